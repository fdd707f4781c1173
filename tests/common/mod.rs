#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use appliance_live::config::{LiveConfig, TerminalBackend};
use appliance_live::pty::{HostEntry, Platform};
use appliance_live::{build_router, AppState, JwtValidator};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;

pub const SECRET: &str = "integration-secret";

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
}

impl TestServer {
    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }
}

fn local(command: &str, args: &[&str]) -> HostEntry {
    HostEntry::Local {
        command: command.into(),
        args: args.iter().map(|a| a.to_string()).collect(),
        cwd: None,
        platform: Some(Platform::Other),
    }
}

/// Serve the full router on an ephemeral port with the pipe backend.
///
/// Hosts: `h1` echoes input, `h-exit` exits with status 3 after one line.
pub async fn start_server() -> TestServer {
    let mut config = LiveConfig::default();
    config.terminal.backend = TerminalBackend::Pipe;
    config.terminal.kill_grace_ms = 200;
    config.hosts.insert("h1".into(), local("cat", &[]));
    config
        .hosts
        .insert("h-exit".into(), local("sh", &["-c", "read line; exit 3"]));

    let state = AppState::from_config(&config, Arc::new(JwtValidator::new(SECRET))).unwrap();
    state.hub.spawn_bus_pump(&state.bus);
    state.hub.spawn_keepalive();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer { addr, state }
}

pub fn token(user_id: &str) -> String {
    let exp = chrono::Utc::now().timestamp() + 3600;
    encode(
        &Header::default(),
        &json!({ "userId": user_id, "exp": exp }),
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}
