#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use srcbridge_domain::ServerKey;
use srcbridge_rcon::{CommandExecutor, ServerDirectory};
use srcbridge_util::time::unix_ms_now;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, info, warn};

use crate::feedback::FeedbackLog;
use crate::grammar::{self, LogMessageType, MessageKind, ParsedLogMessage, Sender};

/// Engine out-of-band packet header.
const OOB_HEADER: [u8; 4] = [0xff, 0xff, 0xff, 0xff];

#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
	#[error("failed to bind log listener on {addr}: {source}")]
	Bind {
		addr: SocketAddr,
		#[source]
		source: std::io::Error,
	},

	#[error("unknown server: {0}")]
	UnknownServer(ServerKey),

	#[error("no active capture session")]
	NoActiveSession,

	#[error("could not resolve {address} for source filtering: {reason}")]
	Resolve { address: String, reason: String },

	#[error("feedback log error: {0}")]
	Feedback(#[from] std::io::Error),
}

/// Receives classified chat commands for one message type.
#[async_trait::async_trait]
pub trait LogListener: Send + Sync + 'static {
	async fn on_message(&self, server: &ServerKey, message: ParsedLogMessage) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
	pub bind: SocketAddr,
	/// Address game servers should send logs to (the `logaddress_add` host).
	pub advertise_host: String,
	/// Drop datagrams whose source IP differs from the captured server.
	/// On unless explicitly disabled.
	pub filter_source: bool,
	/// Publish unmatched lines on the raw channel.
	pub debug_raw: bool,
	pub feedback_dir: PathBuf,
	pub raw_channel_capacity: usize,
}

impl Default for ReceiverConfig {
	fn default() -> Self {
		Self {
			bind: SocketAddr::from(([0, 0, 0, 0], 27500)),
			advertise_host: "127.0.0.1".to_string(),
			filter_source: true,
			debug_raw: false,
			feedback_dir: PathBuf::from("feedback"),
			raw_channel_capacity: 256,
		}
	}
}

/// Snapshot of the capture session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStatus {
	pub active: bool,
	pub server: Option<String>,
	pub advertised: Option<String>,
	pub started_at_unix_ms: Option<i64>,
	pub feedback_enabled: bool,
	pub feedback_path: Option<PathBuf>,
}

struct Session {
	server: ServerKey,
	advertised: String,
	started_at_unix_ms: i64,
	feedback: Option<FeedbackLog>,
	// Dropping the sender stops the receive loop.
	_stop_tx: watch::Sender<()>,
}

/// Shared view of the capture session used by handlers that record feedback.
#[derive(Clone)]
pub struct CaptureHandle {
	session: Arc<Mutex<Option<Session>>>,
	feedback_dir: PathBuf,
}

impl CaptureHandle {
	pub async fn status(&self) -> CaptureStatus {
		let session = self.session.lock().await;
		match session.as_ref() {
			None => CaptureStatus::default(),
			Some(s) => CaptureStatus {
				active: true,
				server: Some(s.server.to_string()),
				advertised: Some(s.advertised.clone()),
				started_at_unix_ms: Some(s.started_at_unix_ms),
				feedback_enabled: s.feedback.is_some(),
				feedback_path: s.feedback.as_ref().map(|f| f.path().to_path_buf()),
			},
		}
	}

	pub async fn active_server(&self) -> Option<ServerKey> {
		self.session.lock().await.as_ref().map(|s| s.server.clone())
	}

	/// Start appending feedback to a fresh per-session file.
	///
	/// Returns the file path; a no-op when feedback is already on.
	pub async fn enable_feedback(&self) -> Result<PathBuf, ReceiverError> {
		let mut session = self.session.lock().await;
		let session = session.as_mut().ok_or(ReceiverError::NoActiveSession)?;
		if let Some(log) = &session.feedback {
			return Ok(log.path().to_path_buf());
		}

		let log = FeedbackLog::create(&self.feedback_dir, &session.server, unix_ms_now()).await?;
		let path = log.path().to_path_buf();
		info!(server = %session.server, path = %path.display(), "feedback capture enabled");
		session.feedback = Some(log);
		Ok(path)
	}

	/// Stop recording feedback. Returns whether it was on.
	pub async fn disable_feedback(&self) -> bool {
		let mut session = self.session.lock().await;
		let Some(session) = session.as_mut() else {
			return false;
		};
		let was_on = session.feedback.take().is_some();
		if was_on {
			info!(server = %session.server, "feedback capture disabled");
		}
		was_on
	}

	/// Append a Feedback message to the session log.
	///
	/// `Ok(false)` when no session is active or feedback is off.
	pub async fn record_feedback(&self, message: &ParsedLogMessage) -> Result<bool, ReceiverError> {
		let MessageKind::Feedback { message: text } = &message.kind else {
			return Ok(false);
		};
		self.append_feedback(&message.sender, text).await
	}

	/// Append free text on behalf of `sender`, whatever grammar carried it.
	pub async fn append_feedback(&self, sender: &Sender, text: &str) -> Result<bool, ReceiverError> {
		let session = self.session.lock().await;
		let Some(log) = session.as_ref().and_then(|s| s.feedback.as_ref()) else {
			return Ok(false);
		};

		log.append(&sender.name, &sender.team, text).await?;
		metrics::counter!("srcbridge_ingest_feedback_recorded_total").increment(1);
		Ok(true)
	}
}

struct Inner {
	cfg: ReceiverConfig,
	socket: Arc<UdpSocket>,
	executor: Arc<dyn CommandExecutor>,
	directory: Arc<dyn ServerDirectory>,
	listeners: RwLock<HashMap<LogMessageType, Vec<Arc<dyn LogListener>>>>,
	capture: CaptureHandle,
	raw_tx: broadcast::Sender<String>,
}

/// UDP log listener that turns server log lines into typed chat commands.
///
/// At most one capture session is active at a time.
#[derive(Clone)]
pub struct LogReceiver {
	inner: Arc<Inner>,
}

impl LogReceiver {
	pub async fn bind(
		cfg: ReceiverConfig,
		executor: Arc<dyn CommandExecutor>,
		directory: Arc<dyn ServerDirectory>,
	) -> Result<Self, ReceiverError> {
		let socket = UdpSocket::bind(cfg.bind)
			.await
			.map_err(|source| ReceiverError::Bind { addr: cfg.bind, source })?;
		info!(bind = %cfg.bind, advertise_host = %cfg.advertise_host, "log receiver listening");

		let (raw_tx, _) = broadcast::channel(cfg.raw_channel_capacity.max(1));
		let capture = CaptureHandle {
			session: Arc::new(Mutex::new(None)),
			feedback_dir: cfg.feedback_dir.clone(),
		};

		Ok(Self {
			inner: Arc::new(Inner {
				cfg,
				socket: Arc::new(socket),
				executor,
				directory,
				listeners: RwLock::new(HashMap::new()),
				capture,
				raw_tx,
			}),
		})
	}

	pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
		self.inner.socket.local_addr()
	}

	pub fn capture(&self) -> CaptureHandle {
		self.inner.capture.clone()
	}

	pub fn register_listener(&self, kind: LogMessageType, listener: Arc<dyn LogListener>) {
		self.inner.listeners.write().entry(kind).or_default().push(listener);
	}

	/// Unmatched lines, published while `debug_raw` is set.
	pub fn subscribe_raw(&self) -> broadcast::Receiver<String> {
		self.inner.raw_tx.subscribe()
	}

	/// Begin capturing a server's logs.
	///
	/// Returns `Ok(false)` without side effects when a session is already
	/// active. With source filtering on, an unresolvable server address is an
	/// error rather than an unfiltered session.
	pub async fn start(&self, server: &ServerKey) -> Result<bool, ReceiverError> {
		if let Some(active) = self.inner.capture.active_server().await {
			debug!(requested = %server, active = %active, "capture already active");
			return Ok(false);
		}

		let endpoint = self
			.inner
			.directory
			.resolve(server)
			.await
			.ok_or_else(|| ReceiverError::UnknownServer(server.clone()))?;

		let source_ip = if self.inner.cfg.filter_source {
			Some(resolve_ip(&endpoint.address).await?)
		} else {
			warn!(server = %server, "source filtering disabled; accepting log datagrams from any host");
			None
		};

		// Sent without holding the session lock.
		let advertised = format!("{}:{}", self.inner.cfg.advertise_host, endpoint.log_port);
		let reply = self
			.inner
			.executor
			.execute(server, &format!("logaddress_add {advertised}"))
			.await;
		debug!(server = %server, reply = %reply, "logaddress_add sent");

		let mut session = self.inner.capture.session.lock().await;
		if let Some(active) = session.as_ref() {
			let same_server = &active.server == server;
			debug!(requested = %server, active = %active.server, "capture started concurrently");
			drop(session);
			if !same_server {
				let reply = self
					.inner
					.executor
					.execute(server, &format!("logaddress_del {advertised}"))
					.await;
				debug!(server = %server, reply = %reply, "logaddress_del sent for abandoned start");
			}
			return Ok(false);
		}

		// No receive loop runs while the session is empty.
		let discarded = self.inner.discard_pending();
		if discarded > 0 {
			debug!(server = %server, discarded, "discarded datagrams queued before capture");
		}

		let (stop_tx, stop_rx) = watch::channel(());
		*session = Some(Session {
			server: server.clone(),
			advertised: advertised.clone(),
			started_at_unix_ms: unix_ms_now(),
			feedback: None,
			_stop_tx: stop_tx,
		});
		drop(session);

		tokio::spawn(run_receive_loop(Arc::clone(&self.inner), server.clone(), source_ip, stop_rx));

		metrics::counter!("srcbridge_ingest_sessions_started_total").increment(1);
		info!(server = %server, advertised = %advertised, source_filter = ?source_ip, "log capture started");
		Ok(true)
	}

	/// End the session if any. Idempotent; the socket stays bound.
	pub async fn stop(&self) -> bool {
		let Some(session) = self.inner.capture.session.lock().await.take() else {
			return false;
		};

		let reply = self
			.inner
			.executor
			.execute(&session.server, &format!("logaddress_del {}", session.advertised))
			.await;
		debug!(server = %session.server, reply = %reply, "logaddress_del sent");

		info!(server = %session.server, feedback_was_enabled = session.feedback.is_some(), "log capture stopped");
		true
	}

	pub async fn enable_feedback(&self) -> Result<PathBuf, ReceiverError> {
		self.inner.capture.enable_feedback().await
	}

	pub async fn disable_feedback(&self) -> bool {
		self.inner.capture.disable_feedback().await
	}

	pub async fn capture_status(&self) -> CaptureStatus {
		self.inner.capture.status().await
	}

	pub fn feedback_dir(&self) -> &Path {
		&self.inner.cfg.feedback_dir
	}

	/// Classify one log line and dispatch it. Exposed for replaying logs.
	pub fn handle_line(&self, server: &ServerKey, line: &str) {
		self.inner.handle_line(server, line);
	}
}

impl Inner {
	/// Drop whatever the socket buffered while no session was reading it.
	fn discard_pending(&self) -> usize {
		let mut buf = [0u8; 2048];
		let mut discarded = 0;
		while self.socket.try_recv_from(&mut buf).is_ok() {
			discarded += 1;
		}
		if discarded > 0 {
			metrics::counter!("srcbridge_ingest_datagrams_discarded_total").increment(discarded as u64);
		}
		discarded
	}

	fn handle_line(&self, server: &ServerKey, line: &str) {
		let Some(message) = grammar::classify(line) else {
			if self.cfg.debug_raw {
				let _ = self.raw_tx.send(line.to_string());
			}
			return;
		};

		let kind = message.message_type();
		metrics::counter!("srcbridge_ingest_messages_total", "kind" => kind.as_str()).increment(1);

		let listeners = self.listeners.read().get(&kind).cloned().unwrap_or_default();
		if listeners.is_empty() {
			debug!(server = %server, %kind, "no listeners registered");
			return;
		}

		for listener in listeners {
			let server = server.clone();
			let message = message.clone();
			tokio::spawn(async move {
				if let Err(e) = listener.on_message(&server, message).await {
					metrics::counter!("srcbridge_ingest_listener_errors_total").increment(1);
					warn!(server = %server, %kind, error = %e, "log listener failed");
				}
			});
		}
	}
}

async fn run_receive_loop(
	inner: Arc<Inner>,
	server: ServerKey,
	source_ip: Option<IpAddr>,
	mut stop_rx: watch::Receiver<()>,
) {
	let mut buf = vec![0u8; 64 * 1024];

	loop {
		tokio::select! {
			res = inner.socket.recv_from(&mut buf) => {
				let (n, from) = match res {
					Ok(v) => v,
					Err(e) => {
						debug!(server = %server, error = %e, "log socket receive error");
						continue;
					}
				};

				if let Some(ip) = source_ip
					&& from.ip() != ip
				{
					metrics::counter!("srcbridge_ingest_datagrams_filtered_total").increment(1);
					debug!(server = %server, %from, "dropping datagram from unexpected source");
					continue;
				}

				for line in split_datagram(&buf[..n]) {
					inner.handle_line(&server, &line);
				}
			}
			_ = stop_rx.changed() => break,
		}
	}

	debug!(server = %server, "log receive loop exited");
}

/// Strip the out-of-band header and split a datagram into log lines.
pub fn split_datagram(datagram: &[u8]) -> Vec<String> {
	let mut payload = datagram;
	if let Some(rest) = payload.strip_prefix(&OOB_HEADER[..]) {
		payload = match rest.first() {
			Some(b'R') => &rest[1..],
			// `S<secret>L ...` when the server has a log secret configured.
			Some(b'S') => rest
				.windows(2)
				.position(|w| w == b"L ")
				.map(|idx| &rest[idx..])
				.unwrap_or(&rest[1..]),
			_ => rest,
		};
	}

	String::from_utf8_lossy(payload)
		.split('\n')
		.map(|line| line.trim_end_matches(['\0', '\r']).trim())
		.filter(|line| !line.is_empty())
		.map(str::to_string)
		.collect()
}

async fn resolve_ip(address: &str) -> Result<IpAddr, ReceiverError> {
	let resolved = match tokio::net::lookup_host(address).await {
		Ok(mut addrs) => addrs.next().map(|a| a.ip()).ok_or_else(|| "no addresses".to_string()),
		Err(e) => Err(e.to_string()),
	};
	resolved.map_err(|reason| {
		warn!(address, %reason, "could not resolve server address for source filtering");
		ReceiverError::Resolve {
			address: address.to_string(),
			reason,
		}
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strips_oob_header_and_splits_lines() {
		let mut datagram = OOB_HEADER.to_vec();
		datagram.extend_from_slice(b"RL 10/01/2024 - 12:00:00: first\nL 10/01/2024 - 12:00:01: second\n\0");
		assert_eq!(
			split_datagram(&datagram),
			vec![
				"L 10/01/2024 - 12:00:00: first".to_string(),
				"L 10/01/2024 - 12:00:01: second".to_string()
			]
		);
	}

	#[test]
	fn strips_log_secret_header() {
		let mut datagram = OOB_HEADER.to_vec();
		datagram.extend_from_slice(b"S12345L 10/01/2024 - 12:00:00: hello\0");
		assert_eq!(split_datagram(&datagram), vec!["L 10/01/2024 - 12:00:00: hello".to_string()]);
	}

	#[test]
	fn plain_payload_passes_through() {
		assert_eq!(split_datagram(b"just a line\r\n"), vec!["just a line".to_string()]);
		assert!(split_datagram(b"\0\n").is_empty());
	}
}
