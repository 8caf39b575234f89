#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;
use srcbridge_domain::{SecretString, ServerEndpoint, ServerKey};
use srcbridge_protocol::{
	AUTH_FAILED_ID, DEFAULT_MAX_FRAME_SIZE, Direction, Frame, FrameType, encode_frame, try_decode_frame_from_buffer,
};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub fn init_test_logging() {
	static INIT: std::sync::Once = std::sync::Once::new();
	INIT.call_once(|| {
		if std::env::var_os("SRCBRIDGE_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

pub fn key(s: &str) -> ServerKey {
	ServerKey::new(s).expect("valid server key")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
	/// Accept the configured password, reject anything else.
	Check,
	/// Never answer the auth frame.
	Ignore,
}

/// Reply body and delay for a command; `None` means never reply.
pub type Responder = Arc<dyn Fn(&str) -> Option<(String, Duration)> + Send + Sync>;

pub fn echo() -> Responder {
	Arc::new(|cmd| Some((format!("echo: {cmd}"), Duration::ZERO)))
}

pub fn silent() -> Responder {
	Arc::new(|_| None)
}

/// In-process RCON server speaking the real wire format.
pub struct FakeRcon {
	pub addr: SocketAddr,
	password: String,
	accepts: Arc<AtomicUsize>,
	received: Arc<Mutex<Vec<(Instant, String)>>>,
	task: JoinHandle<()>,
}

impl FakeRcon {
	pub async fn start(password: &str, auth: AuthMode, responder: Responder) -> Self {
		let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake rcon");
		let addr = listener.local_addr().expect("local addr");

		let accepts = Arc::new(AtomicUsize::new(0));
		let received = Arc::new(Mutex::new(Vec::new()));

		let task = {
			let accepts = Arc::clone(&accepts);
			let received = Arc::clone(&received);
			let password = password.to_string();
			tokio::spawn(async move {
				loop {
					let Ok((stream, _)) = listener.accept().await else {
						break;
					};
					accepts.fetch_add(1, Ordering::SeqCst);
					tokio::spawn(serve(
						stream,
						password.clone(),
						auth,
						Arc::clone(&responder),
						Arc::clone(&received),
					));
				}
			})
		};

		Self {
			addr,
			password: password.to_string(),
			accepts,
			received,
			task,
		}
	}

	pub fn endpoint(&self, key_str: &str) -> ServerEndpoint {
		self.endpoint_with_password(key_str, &self.password)
	}

	pub fn endpoint_with_password(&self, key_str: &str, password: &str) -> ServerEndpoint {
		ServerEndpoint::new(key(key_str), self.addr.to_string(), SecretString::new(password), 27500)
	}

	pub fn accepts(&self) -> usize {
		self.accepts.load(Ordering::SeqCst)
	}

	pub fn commands(&self) -> Vec<String> {
		self.received.lock().iter().map(|(_, c)| c.clone()).collect()
	}

	pub fn received_at(&self) -> Vec<Instant> {
		self.received.lock().iter().map(|(t, _)| *t).collect()
	}
}

impl Drop for FakeRcon {
	fn drop(&mut self) {
		self.task.abort();
	}
}

async fn serve(
	stream: tokio::net::TcpStream,
	password: String,
	auth: AuthMode,
	responder: Responder,
	received: Arc<Mutex<Vec<(Instant, String)>>>,
) {
	let (mut read, mut write) = stream.into_split();
	let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();

	tokio::spawn(async move {
		while let Some(frame) = out_rx.recv().await {
			let Ok(bytes) = encode_frame(&frame, DEFAULT_MAX_FRAME_SIZE) else {
				break;
			};
			if write.write_all(&bytes).await.is_err() {
				break;
			}
		}
	});

	let mut buf = BytesMut::new();
	loop {
		let frame = match try_decode_frame_from_buffer(&mut buf, Direction::ClientToServer, DEFAULT_MAX_FRAME_SIZE) {
			Ok(Some(frame)) => frame,
			Ok(None) => match read.read_buf(&mut buf).await {
				Ok(0) | Err(_) => return,
				Ok(_) => continue,
			},
			Err(_) => return,
		};

		match frame.frame_type {
			FrameType::Auth => {
				if auth == AuthMode::Ignore {
					continue;
				}
				let _ = out_tx.send(Frame::command_response(frame.id, ""));
				let id = if frame.body == password { frame.id } else { AUTH_FAILED_ID };
				let _ = out_tx.send(Frame::auth_response(id));
			}
			FrameType::Command => {
				received.lock().push((Instant::now(), frame.body.clone()));
				if let Some((body, delay)) = responder(&frame.body) {
					let out_tx = out_tx.clone();
					tokio::spawn(async move {
						if !delay.is_zero() {
							tokio::time::sleep(delay).await;
						}
						let _ = out_tx.send(Frame::command_response(frame.id, body));
					});
				}
			}
			_ => {}
		}
	}
}
