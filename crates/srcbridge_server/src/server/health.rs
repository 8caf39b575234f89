#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use srcbridge_ingest::CaptureHandle;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	capture: Option<CaptureHandle>,
}

impl HealthState {
	pub fn new(capture: Option<CaptureHandle>) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			capture,
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn mark_not_ready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

pub async fn spawn_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<SocketAddr> {
	let listener = TcpListener::bind(bind).await?;
	let local = listener.local_addr()?;
	info!(bind = %local, "health server listening");
	tokio::spawn(async move {
		if let Err(err) = run_health_server(listener, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
	Ok(local)
}

async fn run_health_server(listener: TcpListener, state: HealthState) -> anyhow::Result<()> {
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let (status, content_type, body) = respond(req.method(), req.uri().path(), &state).await;
	let mut resp = Response::new(Full::new(body));
	*resp.status_mut() = status;
	if let Some(ct) = content_type {
		resp.headers_mut()
			.insert(hyper::header::CONTENT_TYPE, hyper::header::HeaderValue::from_static(ct));
	}
	Ok(resp)
}

async fn respond(method: &Method, path: &str, state: &HealthState) -> (StatusCode, Option<&'static str>, Bytes) {
	if *method != Method::GET {
		return (StatusCode::METHOD_NOT_ALLOWED, None, Bytes::new());
	}

	match path {
		"/healthz" => (StatusCode::OK, Some("text/plain"), Bytes::from_static(b"ok")),
		"/readyz" if state.is_ready() => (StatusCode::OK, Some("text/plain"), Bytes::from_static(b"ready")),
		"/readyz" => (
			StatusCode::SERVICE_UNAVAILABLE,
			Some("text/plain"),
			Bytes::from_static(b"not-ready"),
		),
		"/capture" => {
			let Some(capture) = &state.capture else {
				return (StatusCode::NOT_FOUND, None, Bytes::new());
			};
			match serde_json::to_vec(&capture.status().await) {
				Ok(json) => (StatusCode::OK, Some("application/json"), Bytes::from(json)),
				Err(e) => {
					warn!(error = %e, "failed to encode capture status");
					(StatusCode::INTERNAL_SERVER_ERROR, None, Bytes::new())
				}
			}
		}
		_ => (StatusCode::NOT_FOUND, None, Bytes::new()),
	}
}
