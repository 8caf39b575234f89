#![forbid(unsafe_code)]

mod config;
mod console;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use srcbridge_ingest::{LogMessageType, LogReceiver};
use srcbridge_rcon::{CommandExecutor, Gateway, StaticDirectory};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::console::{Console, ConsoleExit};
use crate::server::access::{AccessList, ConfigIdentityDirectory};
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::playtest::ConfiguredPlaytest;
use crate::server::queue::PlayerQueue;
use crate::server::router::{CommandRouter, RouterDeps};

struct Args {
	config_path: Option<PathBuf>,
	console: bool,
}

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: srcbridge_server [--config path] [--no-console]\n\
\n\
Options:\n\
\t--config      Config file (default: ~/.srcbridge/config.toml)\n\
\t--no-console  Do not read operator commands from stdin\n\
\t--help        Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Args {
	let mut args = Args {
		config_path: None,
		console: true,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config_path = Some(PathBuf::from(v));
			}
			"--no-console" => args.console = false,
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,srcbridge_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("srcbridge_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

/// Log unmatched server log lines while raw debugging is on.
fn spawn_raw_logger(mut raw_rx: broadcast::Receiver<String>) {
	tokio::spawn(async move {
		loop {
			match raw_rx.recv().await {
				Ok(line) => debug!(target: "srcbridge::raw", %line, "unmatched log line"),
				Err(broadcast::error::RecvError::Lagged(n)) => {
					warn!(skipped = n, "raw log channel lagged");
				}
				Err(broadcast::error::RecvError::Closed) => break,
			}
		}
	});
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_bridge_config_from_path(&config_path)?;
	info!(
		path = %config_path.display(),
		servers = cfg.servers.len(),
		"loaded bridge config (toml + env overrides)"
	);

	init_metrics(cfg.bridge.metrics_bind.as_deref());

	let directory = Arc::new(StaticDirectory::new(cfg.servers.iter().cloned()));
	let gateway = Arc::new(Gateway::new(directory.clone(), cfg.gateway_config()));
	let executor: Arc<dyn CommandExecutor> = gateway.clone();

	let receiver = LogReceiver::bind(cfg.receiver_config(), Arc::clone(&executor), directory.clone())
		.await
		.context("start log receiver")?;

	let health_state = HealthState::new(Some(receiver.capture()));
	if let Some(bind) = cfg.bridge.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone())
					.await
					.with_context(|| format!("bind health server on {addr}"))?;
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	if cfg.log_receiver.debug_raw {
		spawn_raw_logger(receiver.subscribe_raw());
	}

	let queue = Arc::new(PlayerQueue::new());
	let playtest = Arc::new(ConfiguredPlaytest::new(
		Arc::clone(&executor),
		receiver.capture(),
		cfg.playtest.clone(),
	));
	let access = AccessList::new(cfg.access.allow.iter().copied());
	info!(
		allow_listed = access.len(),
		linked = cfg.access.links.len(),
		public_commands = cfg.router.public_commands.len(),
		"access control configured"
	);
	if access.is_empty() && cfg.access.privileged_users.is_empty() {
		warn!("no privileged identities configured; in-game rcon relay and playtest controls are disabled");
	}
	let identities = Arc::new(ConfigIdentityDirectory::new(
		cfg.access.links.clone(),
		cfg.access.privileged_users.clone(),
	));

	let router = Arc::new(CommandRouter::new(
		RouterDeps {
			executor: Arc::clone(&executor),
			identities,
			access,
			playtest,
			feedback: Arc::new(receiver.capture()),
			queue: Arc::clone(&queue),
		},
		cfg.router.clone(),
	));
	for kind in LogMessageType::PRIORITY {
		receiver.register_listener(kind, router.clone());
	}

	let mut server_keys: Vec<_> = directory.keys().cloned().collect();
	server_keys.sort();
	health_state.mark_ready();
	info!(servers = ?server_keys, "srcbridge ready");

	if args.console {
		let console = Console::new(Arc::clone(&executor), receiver.clone(), queue, server_keys);
		let stdin = tokio::io::BufReader::new(tokio::io::stdin());
		let mut stdout = tokio::io::stdout();

		tokio::select! {
			res = console.run(stdin, &mut stdout) => {
				match res? {
					ConsoleExit::Quit => info!("console quit"),
					ConsoleExit::Eof => {
						info!("console input closed; waiting for ctrl-c");
						tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
					}
				}
			}
			res = tokio::signal::ctrl_c() => res.context("wait for ctrl-c")?,
		}
	} else {
		tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
	}

	info!("shutting down");
	health_state.mark_not_ready();
	receiver.stop().await;
	gateway.shutdown().await;

	Ok(())
}
