//! Platform-specific process wrapping.
//!
//! A plain pipe does not make a shell believe it owns a terminal. On hosts
//! where the session is not backed by a native PTY, the command is run under
//! `script(1)`, whose invocation differs between util-linux and the BSDs.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    MacOs,
    FreeBsd,
    Windows,
    Other,
}

impl Platform {
    /// The platform this daemon runs on.
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(target_os = "freebsd") {
            Platform::FreeBsd
        } else if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Other
        }
    }
}

/// Concrete process invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

/// Environment forced onto every session so output is the same everywhere.
pub const TERMINAL_ENV: [(&str, &str); 4] = [
    ("TERM", "xterm-256color"),
    ("COLORTERM", "truecolor"),
    ("LANG", "en_US.UTF-8"),
    ("LC_ALL", "en_US.UTF-8"),
];

fn terminal_env(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut merged = env.clone();
    for (key, value) in TERMINAL_ENV {
        merged.insert(key.to_string(), value.to_string());
    }
    merged
}

/// Maps a command onto the invocation that gives it a terminal. Pure.
pub trait PtyStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn wrap(&self, command: &str, args: &[String], env: &BTreeMap<String, String>) -> SpawnSpec;
}

/// util-linux: `script -qfc "<command line>" /dev/null`.
pub struct UtilLinuxScript;

impl PtyStrategy for UtilLinuxScript {
    fn name(&self) -> &'static str {
        "util-linux-script"
    }

    fn wrap(&self, command: &str, args: &[String], env: &BTreeMap<String, String>) -> SpawnSpec {
        let command_line = std::iter::once(command)
            .chain(args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ");
        SpawnSpec {
            program: "script".into(),
            args: vec!["-qfc".into(), command_line, "/dev/null".into()],
            env: terminal_env(env),
            cwd: None,
        }
    }
}

/// BSD and macOS: `script -q /dev/null <command> <args...>`.
pub struct BsdScript;

impl PtyStrategy for BsdScript {
    fn name(&self) -> &'static str {
        "bsd-script"
    }

    fn wrap(&self, command: &str, args: &[String], env: &BTreeMap<String, String>) -> SpawnSpec {
        let mut wrapped = vec!["-q".to_string(), "/dev/null".to_string(), command.to_string()];
        wrapped.extend(args.iter().cloned());
        SpawnSpec {
            program: "script".into(),
            args: wrapped,
            env: terminal_env(env),
            cwd: None,
        }
    }
}

/// Runs the command as-is.
pub struct Passthrough;

impl PtyStrategy for Passthrough {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn wrap(&self, command: &str, args: &[String], env: &BTreeMap<String, String>) -> SpawnSpec {
        SpawnSpec {
            program: command.to_string(),
            args: args.to_vec(),
            env: terminal_env(env),
            cwd: None,
        }
    }
}

/// Platform → strategy lookup, resolved once per session open.
#[derive(Clone)]
pub struct StrategyTable {
    strategies: HashMap<Platform, Arc<dyn PtyStrategy>>,
    fallback: Arc<dyn PtyStrategy>,
}

impl StrategyTable {
    pub fn standard() -> Self {
        let bsd: Arc<dyn PtyStrategy> = Arc::new(BsdScript);
        let mut strategies: HashMap<Platform, Arc<dyn PtyStrategy>> = HashMap::new();
        strategies.insert(Platform::Linux, Arc::new(UtilLinuxScript));
        strategies.insert(Platform::MacOs, bsd.clone());
        strategies.insert(Platform::FreeBsd, bsd);
        Self {
            strategies,
            fallback: Arc::new(Passthrough),
        }
    }

    pub fn resolve(&self, platform: Platform) -> Arc<dyn PtyStrategy> {
        self.strategies
            .get(&platform)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    pub fn passthrough(&self) -> Arc<dyn PtyStrategy> {
        self.fallback.clone()
    }
}

impl Default for StrategyTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// POSIX single-quote a word unless it only holds safe characters.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
