#![forbid(unsafe_code)]

use std::time::Duration;

use srcbridge_domain::ServerKey;
use srcbridge_protocol::FramingError;

use crate::connection::ConnectionState;

/// Errors produced by RCON connections and the gateway.
#[derive(Debug, thiserror::Error)]
pub enum RconError {
	/// Inbound bytes did not form a valid frame. Fatal to the connection.
	#[error("malformed frame: {0}")]
	MalformedFrame(#[from] FramingError),

	/// Outbound command could not be encoded (e.g. embedded NUL).
	#[error("invalid command: {0}")]
	InvalidCommand(FramingError),

	/// Server answered the handshake with the failure sentinel.
	#[error("authentication failed for server {server}")]
	AuthenticationFailed { server: ServerKey },

	#[error("timed out connecting to server {server} after {after:?}")]
	ConnectTimeout { server: ServerKey, after: Duration },

	#[error("command timed out on server {server} after {after:?}")]
	CommandTimeout { server: ServerKey, after: Duration },

	#[error("unknown server: {0}")]
	UnknownServer(ServerKey),

	/// The connection was torn down before a reply arrived.
	#[error("connection disposed")]
	Disposed,

	#[error("connection not ready (state={0:?})")]
	NotReady(ConnectionState),

	#[error("connection closed by server")]
	PeerClosed,

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

impl RconError {
	/// Whether the gateway should dispose and retry after this error.
	pub fn is_retryable(&self) -> bool {
		!matches!(
			self,
			RconError::AuthenticationFailed { .. } | RconError::UnknownServer(_) | RconError::InvalidCommand(_)
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn auth_and_unknown_server_are_not_retried() {
		let key = ServerKey::new("pug-1").unwrap();
		assert!(!RconError::AuthenticationFailed { server: key.clone() }.is_retryable());
		assert!(!RconError::UnknownServer(key.clone()).is_retryable());
		assert!(!RconError::InvalidCommand(FramingError::BodyContainsNul).is_retryable());

		assert!(
			RconError::CommandTimeout {
				server: key,
				after: Duration::from_secs(3)
			}
			.is_retryable()
		);
		assert!(RconError::Disposed.is_retryable());
		assert!(RconError::PeerClosed.is_retryable());
	}
}
