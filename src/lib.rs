//! Live layer for the appliance dashboard: a server-push event hub and a
//! browser terminal bridge.

pub mod api;
pub mod auth;
pub mod config;
pub mod errors;
pub mod events;
pub mod hub;
pub mod pty;
pub mod service;
pub mod shutdown;

pub use api::{build_router, ApiDoc, HealthResponse};
pub use auth::{Identity, JwtValidator, TokenValidator};
pub use config::LiveConfig;
pub use errors::{LiveError, LiveResult};
pub use events::{Event, EventBus};
pub use hub::BroadcastHub;
pub use pty::SessionRegistry;
pub use service::AppState;
pub use shutdown::ShutdownCoordinator;
