//! Terminal session bridging
//!
//! Sessions run one process per browser terminal, spawned through a
//! [`ProcessSpawner`] and wrapped by the platform's [`PtyStrategy`].

pub mod api;
mod host;
mod native;
mod pipe;
mod platform;
mod process;
mod session;
mod state;
mod types;

pub use host::{ssh_args, HostEntry, HostResolver, HostTarget, StaticHostResolver};
pub use native::NativePtySpawner;
pub use pipe::PipeSpawner;
pub use platform::{
    shell_quote, BsdScript, Passthrough, Platform, PtyStrategy, SpawnSpec, StrategyTable,
    UtilLinuxScript, TERMINAL_ENV,
};
pub use process::{
    ProcessControl, ProcessExit, ProcessSpawner, SpawnedProcess, TerminalSize,
};
pub use session::{SessionTimings, TerminalSession};
pub use state::SessionRegistry;
pub use types::{
    ClientChannel, ClientEnd, ClientInput, ClientMessage, ExitCause, ExitInfo, ServerMessage,
    SessionInfo, SessionState, TerminalEvent,
};
