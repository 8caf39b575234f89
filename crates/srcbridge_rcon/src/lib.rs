#![forbid(unsafe_code)]
//! RCON client: authenticated connections plus the serialized, retrying
//! command gateway in front of them.

pub mod connection;
pub mod error;
pub mod gateway;
pub mod reply;

pub use connection::{CloseReason, ConnectionClosed, ConnectionConfig, ConnectionState, RconConnection};
pub use error::RconError;
pub use gateway::{AUDIT_TARGET, Gateway, GatewayConfig, ServerDirectory, StaticDirectory};
use srcbridge_domain::ServerKey;

/// Anything that can run an administrative command against a server.
///
/// Implementations never fail; problems are reported in the returned text.
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync + 'static {
	async fn execute(&self, server: &ServerKey, command: &str) -> String;
}
