#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use srcbridge_domain::{ServerEndpoint, ServerKey};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionClosed, ConnectionConfig, ConnectionState, RconConnection};
use crate::error::RconError;
use crate::reply::{self, NO_REPLY_TEXT};

/// Audit records are emitted under this tracing target.
pub const AUDIT_TARGET: &str = "srcbridge::audit";

/// Resolves a server key to its connection details.
#[async_trait::async_trait]
pub trait ServerDirectory: Send + Sync + 'static {
	async fn resolve(&self, key: &ServerKey) -> Option<ServerEndpoint>;
}

/// Fixed server table, typically built from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
	servers: HashMap<ServerKey, ServerEndpoint>,
}

impl StaticDirectory {
	pub fn new(endpoints: impl IntoIterator<Item = ServerEndpoint>) -> Self {
		Self {
			servers: endpoints.into_iter().map(|e| (e.key.clone(), e)).collect(),
		}
	}

	pub fn get(&self, key: &ServerKey) -> Option<&ServerEndpoint> {
		self.servers.get(key)
	}

	pub fn keys(&self) -> impl Iterator<Item = &ServerKey> {
		self.servers.keys()
	}
}

#[async_trait::async_trait]
impl ServerDirectory for StaticDirectory {
	async fn resolve(&self, key: &ServerKey) -> Option<ServerEndpoint> {
		self.servers.get(key).cloned()
	}
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
	pub connection: ConnectionConfig,
	pub max_attempts: u32,
	pub retry_delay: Duration,
	/// First tokens of commands that are not audited (status polling).
	pub quiet_commands: Vec<String>,
	pub no_reply_text: String,
}

impl Default for GatewayConfig {
	fn default() -> Self {
		Self {
			connection: ConnectionConfig::default(),
			max_attempts: 5,
			retry_delay: Duration::from_secs(1),
			quiet_commands: vec!["status".to_string()],
			no_reply_text: NO_REPLY_TEXT.to_string(),
		}
	}
}

struct Pool {
	connections: HashMap<ServerKey, Arc<RconConnection>>,
	closed_rx: mpsc::UnboundedReceiver<ConnectionClosed>,
}

impl Pool {
	fn evict_closed(&mut self) {
		while let Ok(notice) = self.closed_rx.try_recv() {
			let matches = self
				.connections
				.get(&notice.server)
				.is_some_and(|c| c.id() == notice.connection_id);
			if matches {
				self.connections.remove(&notice.server);
				debug!(server = %notice.server, conn_id = notice.connection_id, reason = %notice.reason, "evicted closed connection");
			}
		}
	}
}

/// Serialized, retrying front door to every configured server.
///
/// Exactly one command is in flight process-wide; the gate is held across
/// the whole retry sequence. Callers always get text back.
pub struct Gateway {
	directory: Arc<dyn ServerDirectory>,
	cfg: GatewayConfig,
	pool: Mutex<Pool>,
	closed_tx: mpsc::UnboundedSender<ConnectionClosed>,
}

impl Gateway {
	pub fn new(directory: Arc<dyn ServerDirectory>, cfg: GatewayConfig) -> Self {
		let (closed_tx, closed_rx) = mpsc::unbounded_channel();
		Self {
			directory,
			cfg,
			pool: Mutex::new(Pool {
				connections: HashMap::new(),
				closed_rx,
			}),
			closed_tx,
		}
	}

	pub fn config(&self) -> &GatewayConfig {
		&self.cfg
	}

	/// Run a command against a server and return its cleaned reply.
	pub async fn execute(&self, server: &ServerKey, command: &str) -> String {
		let mut pool = match self.pool.try_lock() {
			Ok(pool) => pool,
			Err(_) => {
				info!(server = %server, command, "waiting for in-flight rcon command");
				metrics::counter!("srcbridge_rcon_gate_waits_total").increment(1);
				self.pool.lock().await
			}
		};

		metrics::counter!("srcbridge_rcon_commands_total").increment(1);
		let outcome = self.execute_locked(&mut pool, server, command).await;
		drop(pool);

		let reply = match outcome {
			Ok(raw) => reply::clean_reply(&raw, &self.cfg.no_reply_text),
			Err(text) => text,
		};

		self.audit(server, command, &reply);
		reply
	}

	/// Player count parsed from `status`, when the server answers.
	pub async fn get_player_count(&self, server: &ServerKey) -> Option<u32> {
		let status = self.execute(server, "status").await;
		reply::parse_player_count(&status)
	}

	/// Snapshot of pooled connections and their states.
	pub async fn pool_snapshot(&self) -> Vec<(ServerKey, ConnectionState)> {
		let mut pool = self.pool.lock().await;
		pool.evict_closed();
		let mut out: Vec<_> = pool.connections.iter().map(|(k, c)| (k.clone(), c.state())).collect();
		out.sort_by(|a, b| a.0.cmp(&b.0));
		out
	}

	/// Dispose every pooled connection.
	pub async fn shutdown(&self) {
		let mut pool = self.pool.lock().await;
		for (server, conn) in pool.connections.drain() {
			debug!(server = %server, conn_id = conn.id(), "disposing pooled connection");
			conn.dispose();
		}
		pool.evict_closed();
	}

	async fn execute_locked(&self, pool: &mut Pool, server: &ServerKey, command: &str) -> Result<String, String> {
		let max_attempts = self.cfg.max_attempts.max(1);
		let mut last_error: Option<RconError> = None;

		for attempt in 1..=max_attempts {
			let result = match self.checkout(pool, server).await {
				Ok(conn) => {
					let res = conn.send_command(command).await;
					if res.as_ref().is_err_and(RconError::is_retryable) {
						conn.dispose();
						pool.connections.remove(server);
					}
					res
				}
				Err(e) => Err(e),
			};

			match result {
				Ok(body) => return Ok(body),
				Err(e) if !e.is_retryable() => {
					metrics::counter!("srcbridge_rcon_command_failures_total").increment(1);
					return Err(describe_fatal(server, &e));
				}
				Err(e) => {
					warn!(server = %server, attempt, max_attempts, error = %e, "rcon attempt failed");
					last_error = Some(e);
				}
			}

			if attempt < max_attempts {
				metrics::counter!("srcbridge_rcon_retries_total").increment(1);
				tokio::time::sleep(self.cfg.retry_delay).await;
			}
		}

		metrics::counter!("srcbridge_rcon_command_failures_total").increment(1);
		let detail = last_error.map(|e| format!(" Last error: {e}.")).unwrap_or_default();
		Err(format!(
			"Failed to run command on server {server} after {max_attempts} attempts.{detail}"
		))
	}

	async fn checkout(&self, pool: &mut Pool, server: &ServerKey) -> Result<Arc<RconConnection>, RconError> {
		pool.evict_closed();

		if let Some(conn) = pool.connections.get(server) {
			if !conn.is_disposed() {
				return Ok(Arc::clone(conn));
			}
			pool.connections.remove(server);
		}

		let endpoint = self
			.directory
			.resolve(server)
			.await
			.ok_or_else(|| RconError::UnknownServer(server.clone()))?;

		let conn = RconConnection::new(endpoint, self.cfg.connection.clone(), Some(self.closed_tx.clone()));
		conn.connect().await?;
		pool.connections.insert(server.clone(), Arc::clone(&conn));
		Ok(conn)
	}

	fn is_quiet(&self, command: &str) -> bool {
		let Some(first) = command.split_whitespace().next() else {
			return true;
		};
		self.cfg.quiet_commands.iter().any(|q| q.eq_ignore_ascii_case(first))
	}

	fn audit(&self, server: &ServerKey, command: &str, reply: &str) {
		if self.is_quiet(command) {
			return;
		}
		info!(target: AUDIT_TARGET, server = %server, command, reply, "rcon command executed");
	}
}

impl Drop for Gateway {
	fn drop(&mut self) {
		if let Ok(mut pool) = self.pool.try_lock() {
			for (_, conn) in pool.connections.drain() {
				conn.dispose();
			}
		}
	}
}

fn describe_fatal(server: &ServerKey, e: &RconError) -> String {
	match e {
		RconError::AuthenticationFailed { .. } => {
			format!("Authentication failed for server {server}. Check the configured RCON password.")
		}
		RconError::UnknownServer(_) => format!("Unknown server {server}."),
		other => format!("Command rejected for server {server}: {other}"),
	}
}

#[async_trait::async_trait]
impl crate::CommandExecutor for Gateway {
	async fn execute(&self, server: &ServerKey, command: &str) -> String {
		Gateway::execute(self, server, command).await
	}
}
