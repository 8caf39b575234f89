#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use srcbridge_domain::{ServerEndpoint, ServerKey};
use srcbridge_protocol::{
	AUTH_FAILED_ID, DEFAULT_MAX_FRAME_SIZE, Direction, Frame, FrameType, encode_frame, try_decode_frame_from_buffer,
};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::RconError;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Timing and sizing knobs for a single connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
	/// Bound on socket open + authentication.
	pub connect_timeout: Duration,
	/// Bound on waiting for one command reply.
	pub command_timeout: Duration,
	/// Period of the staleness watcher.
	pub stale_check_interval: Duration,
	/// Ticks without a successful command before the connection disposes itself.
	pub max_stale_ticks: u32,
	pub max_frame_bytes: usize,
	pub write_queue_capacity: usize,
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self {
			connect_timeout: Duration::from_secs(5),
			command_timeout: Duration::from_secs(3),
			stale_check_interval: Duration::from_secs(5),
			max_stale_ticks: 120,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			write_queue_capacity: 64,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Authenticating,
	Ready,
	Disposed,
}

/// Why a connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
	Explicit,
	AuthenticationFailed,
	ConnectTimeout,
	CommandTimeout,
	Stale,
	MalformedFrame,
	PeerClosed,
	Io,
}

impl CloseReason {
	fn from_error(e: &RconError) -> Self {
		match e {
			RconError::AuthenticationFailed { .. } => CloseReason::AuthenticationFailed,
			RconError::ConnectTimeout { .. } => CloseReason::ConnectTimeout,
			RconError::CommandTimeout { .. } => CloseReason::CommandTimeout,
			RconError::MalformedFrame(_) => CloseReason::MalformedFrame,
			RconError::PeerClosed => CloseReason::PeerClosed,
			RconError::Io(_) => CloseReason::Io,
			_ => CloseReason::Explicit,
		}
	}
}

impl fmt::Display for CloseReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			CloseReason::Explicit => "explicit",
			CloseReason::AuthenticationFailed => "authentication_failed",
			CloseReason::ConnectTimeout => "connect_timeout",
			CloseReason::CommandTimeout => "command_timeout",
			CloseReason::Stale => "stale",
			CloseReason::MalformedFrame => "malformed_frame",
			CloseReason::PeerClosed => "peer_closed",
			CloseReason::Io => "io",
		};
		f.write_str(s)
	}
}

/// Notice sent to the pool when a connection disposes itself.
#[derive(Debug, Clone)]
pub struct ConnectionClosed {
	pub server: ServerKey,
	pub connection_id: u64,
	pub reason: CloseReason,
}

struct Shared {
	state: ConnectionState,
	pending: HashMap<i32, oneshot::Sender<String>>,
	writer: Option<mpsc::Sender<Vec<u8>>>,
}

/// One authenticated RCON socket to one server.
///
/// Replies are correlated by sequence id, so concurrent `send_command`
/// calls may be answered in any order. Teardown is idempotent and may race
/// with in-flight commands; every pending waiter then observes `Disposed`.
pub struct RconConnection {
	id: u64,
	endpoint: ServerEndpoint,
	cfg: ConnectionConfig,
	shared: Mutex<Shared>,
	next_seq: AtomicI32,
	stale_ticks: AtomicU32,
	disposed: AtomicBool,
	shutdown_tx: watch::Sender<bool>,
	closed_tx: Option<mpsc::UnboundedSender<ConnectionClosed>>,
}

impl fmt::Debug for RconConnection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RconConnection")
			.field("id", &self.id)
			.field("server", &self.endpoint.key)
			.field("address", &self.endpoint.address)
			.field("state", &self.state())
			.finish()
	}
}

impl RconConnection {
	/// Create a disconnected connection. Call [`RconConnection::connect`] next.
	pub fn new(
		endpoint: ServerEndpoint,
		cfg: ConnectionConfig,
		closed_tx: Option<mpsc::UnboundedSender<ConnectionClosed>>,
	) -> Arc<Self> {
		let (shutdown_tx, _) = watch::channel(false);
		Arc::new(Self {
			id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
			endpoint,
			cfg,
			shared: Mutex::new(Shared {
				state: ConnectionState::Disconnected,
				pending: HashMap::new(),
				writer: None,
			}),
			next_seq: AtomicI32::new(1),
			stale_ticks: AtomicU32::new(0),
			disposed: AtomicBool::new(false),
			shutdown_tx,
			closed_tx,
		})
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn server(&self) -> &ServerKey {
		&self.endpoint.key
	}

	pub fn endpoint(&self) -> &ServerEndpoint {
		&self.endpoint
	}

	pub fn state(&self) -> ConnectionState {
		self.shared.lock().state
	}

	pub fn is_disposed(&self) -> bool {
		self.disposed.load(Ordering::Acquire)
	}

	pub fn stale_ticks(&self) -> u32 {
		self.stale_ticks.load(Ordering::Relaxed)
	}

	pub fn pending_count(&self) -> usize {
		self.shared.lock().pending.len()
	}

	/// Open the socket and authenticate, bounded by the connect timeout.
	///
	/// Any failure disposes the connection.
	pub async fn connect(self: &Arc<Self>) -> Result<(), RconError> {
		{
			let mut shared = self.shared.lock();
			if shared.state != ConnectionState::Disconnected {
				return Err(RconError::NotReady(shared.state));
			}
			shared.state = ConnectionState::Connecting;
		}

		let after = self.cfg.connect_timeout;
		match tokio::time::timeout(after, self.handshake()).await {
			Ok(Ok(())) => {
				info!(server = %self.endpoint.key, conn_id = self.id, addr = %self.endpoint.address, "rcon connection ready");
				Ok(())
			}
			Ok(Err(e)) => {
				warn!(server = %self.endpoint.key, conn_id = self.id, error = %e, "rcon connect failed");
				self.close(CloseReason::from_error(&e));
				Err(e)
			}
			Err(_) => {
				warn!(server = %self.endpoint.key, conn_id = self.id, ?after, "rcon connect timed out");
				self.close(CloseReason::ConnectTimeout);
				Err(RconError::ConnectTimeout {
					server: self.endpoint.key.clone(),
					after,
				})
			}
		}
	}

	async fn handshake(self: &Arc<Self>) -> Result<(), RconError> {
		let stream = TcpStream::connect(self.endpoint.address.as_str()).await?;
		let _ = stream.set_nodelay(true);
		let (mut read, mut write) = stream.into_split();

		self.set_state(ConnectionState::Authenticating);

		let auth_id = self.next_sequence_id();
		let auth = Frame::auth(auth_id, self.endpoint.password.expose());
		let bytes = encode_frame(&auth, self.cfg.max_frame_bytes).map_err(RconError::InvalidCommand)?;
		write.write_all(&bytes).await?;

		let mut buf = BytesMut::with_capacity(4096);
		loop {
			let frame = read_frame(&mut read, &mut buf, self.cfg.max_frame_bytes).await?;
			match frame.frame_type {
				FrameType::AuthResponse if frame.id == AUTH_FAILED_ID => {
					return Err(RconError::AuthenticationFailed {
						server: self.endpoint.key.clone(),
					});
				}
				FrameType::AuthResponse => {
					if frame.id != auth_id {
						debug!(server = %self.endpoint.key, expected = auth_id, got = frame.id, "auth response id mismatch");
					}
					break;
				}
				_ => {
					debug!(server = %self.endpoint.key, id = frame.id, "skipping frame before auth response");
				}
			}
		}

		let (writer_tx, writer_rx) = mpsc::channel(self.cfg.write_queue_capacity);
		{
			let mut shared = self.shared.lock();
			if shared.state == ConnectionState::Disposed {
				return Err(RconError::Disposed);
			}
			shared.state = ConnectionState::Ready;
			shared.writer = Some(writer_tx);
		}

		tokio::spawn(Arc::clone(self).run_writer(write, writer_rx));
		tokio::spawn(Arc::clone(self).run_reader(read, buf));
		tokio::spawn(Arc::clone(self).run_staleness());

		Ok(())
	}

	/// Send one command and wait for its reply body.
	///
	/// A timeout disposes the connection; the pool recreates it lazily.
	pub async fn send_command(&self, command: &str) -> Result<String, RconError> {
		let id = self.next_sequence_id();
		let bytes = encode_frame(&Frame::command(id, command), self.cfg.max_frame_bytes).map_err(RconError::InvalidCommand)?;

		let (tx, rx) = oneshot::channel();
		let writer = {
			let mut shared = self.shared.lock();
			match (shared.state, shared.writer.clone()) {
				(ConnectionState::Ready, Some(writer)) => {
					shared.pending.insert(id, tx);
					writer
				}
				(ConnectionState::Disposed, _) => return Err(RconError::Disposed),
				(state, _) => return Err(RconError::NotReady(state)),
			}
		};

		if writer.send(bytes).await.is_err() {
			self.shared.lock().pending.remove(&id);
			return Err(RconError::Disposed);
		}
		drop(writer);

		let after = self.cfg.command_timeout;
		match tokio::time::timeout(after, rx).await {
			Ok(Ok(body)) => {
				self.stale_ticks.store(0, Ordering::Relaxed);
				Ok(body)
			}
			Ok(Err(_)) => Err(RconError::Disposed),
			Err(_) => {
				self.shared.lock().pending.remove(&id);
				warn!(server = %self.endpoint.key, conn_id = self.id, id, ?after, "rcon command timed out");
				self.close(CloseReason::CommandTimeout);
				Err(RconError::CommandTimeout {
					server: self.endpoint.key.clone(),
					after,
				})
			}
		}
	}

	/// Tear the connection down. Safe to call repeatedly and concurrently.
	pub fn dispose(&self) {
		self.close(CloseReason::Explicit);
	}

	fn close(&self, reason: CloseReason) {
		if self.disposed.swap(true, Ordering::AcqRel) {
			return;
		}

		let pending = {
			let mut shared = self.shared.lock();
			shared.state = ConnectionState::Disposed;
			shared.writer = None;
			std::mem::take(&mut shared.pending)
		};
		let failed_pending = pending.len();
		drop(pending);

		self.shutdown_tx.send_replace(true);

		metrics::counter!("srcbridge_rcon_connections_disposed_total").increment(1);
		debug!(
			server = %self.endpoint.key,
			conn_id = self.id,
			%reason,
			failed_pending,
			"rcon connection disposed"
		);

		if let Some(tx) = &self.closed_tx {
			let _ = tx.send(ConnectionClosed {
				server: self.endpoint.key.clone(),
				connection_id: self.id,
				reason,
			});
		}
	}

	fn set_state(&self, state: ConnectionState) {
		let mut shared = self.shared.lock();
		if shared.state != ConnectionState::Disposed {
			shared.state = state;
		}
	}

	/// Next outbound sequence id; stays within `1..=i32::MAX`.
	fn next_sequence_id(&self) -> i32 {
		self.next_seq
			.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
				Some(if id >= i32::MAX { 1 } else { id + 1 })
			})
			.unwrap_or_else(|id| id)
	}

	fn settle(&self, frame: Frame) {
		if frame.frame_type != FrameType::CommandResponse {
			debug!(server = %self.endpoint.key, id = frame.id, frame_type = ?frame.frame_type, "ignoring unexpected frame");
			return;
		}

		let waiter = self.shared.lock().pending.remove(&frame.id);
		match waiter {
			Some(tx) => {
				let _ = tx.send(frame.body);
			}
			None => {
				debug!(server = %self.endpoint.key, conn_id = self.id, id = frame.id, "dropping reply with no pending request");
			}
		}
	}

	async fn run_writer(self: Arc<Self>, mut write: OwnedWriteHalf, mut rx: mpsc::Receiver<Vec<u8>>) {
		let mut shutdown = self.shutdown_tx.subscribe();
		if *shutdown.borrow_and_update() {
			return;
		}

		loop {
			tokio::select! {
				msg = rx.recv() => {
					let Some(bytes) = msg else {
						break;
					};
					if let Err(e) = write.write_all(&bytes).await {
						warn!(server = %self.endpoint.key, conn_id = self.id, error = %e, "rcon write failed");
						self.close(CloseReason::Io);
						break;
					}
				}
				_ = shutdown.changed() => break,
			}
		}

		let _ = write.shutdown().await;
	}

	async fn run_reader(self: Arc<Self>, mut read: OwnedReadHalf, mut buf: BytesMut) {
		let mut shutdown = self.shutdown_tx.subscribe();
		if *shutdown.borrow_and_update() {
			return;
		}

		loop {
			tokio::select! {
				res = read_frame(&mut read, &mut buf, self.cfg.max_frame_bytes) => match res {
					Ok(frame) => self.settle(frame),
					Err(e) => {
						if !self.is_disposed() {
							warn!(server = %self.endpoint.key, conn_id = self.id, error = %e, "rcon read loop failed");
						}
						self.close(CloseReason::from_error(&e));
						break;
					}
				},
				_ = shutdown.changed() => break,
			}
		}

		debug!(server = %self.endpoint.key, conn_id = self.id, "rcon read loop exited");
	}

	async fn run_staleness(self: Arc<Self>) {
		let mut shutdown = self.shutdown_tx.subscribe();
		if *shutdown.borrow_and_update() {
			return;
		}

		let mut ticker = tokio::time::interval(self.cfg.stale_check_interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		ticker.tick().await;

		loop {
			tokio::select! {
				_ = ticker.tick() => {
					let ticks = self.stale_ticks.fetch_add(1, Ordering::Relaxed) + 1;
					if ticks > self.cfg.max_stale_ticks {
						info!(server = %self.endpoint.key, conn_id = self.id, ticks, "rcon connection went stale");
						self.close(CloseReason::Stale);
						break;
					}
				}
				_ = shutdown.changed() => break,
			}
		}
	}
}

async fn read_frame(read: &mut OwnedReadHalf, buf: &mut BytesMut, max_frame_bytes: usize) -> Result<Frame, RconError> {
	loop {
		if let Some(frame) = try_decode_frame_from_buffer(buf, Direction::ServerToClient, max_frame_bytes)? {
			return Ok(frame);
		}

		let n = read.read_buf(buf).await?;
		if n == 0 {
			return Err(RconError::PeerClosed);
		}
	}
}
