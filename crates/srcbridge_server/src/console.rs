#![forbid(unsafe_code)]
//! Line-oriented operator console on stdin.

use std::sync::Arc;

use anyhow::Context as _;
use srcbridge_domain::ServerKey;
use srcbridge_ingest::LogReceiver;
use srcbridge_rcon::CommandExecutor;
use srcbridge_rcon::reply::parse_player_count;
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tracing::debug;

use crate::server::queue::PlayerQueue;

const HELP: &str = "\
commands:
  exec <server> <command...>   run an rcon command
  players <server>             human player count from status
  capture start <server>       begin log capture
  capture stop                 end log capture
  feedback on|off              toggle feedback recording
  status                       capture and queue summary
  queue [clear]                show or clear the player queue
  servers                      configured servers
  help
  quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
	Exec { server: ServerKey, command: String },
	Players(ServerKey),
	CaptureStart(ServerKey),
	CaptureStop,
	Feedback(bool),
	Status,
	Queue { clear: bool },
	Servers,
	Help,
	Quit,
}

impl ConsoleCommand {
	/// `Ok(None)` for blank lines.
	pub fn parse(line: &str) -> Result<Option<Self>, String> {
		let line = line.trim();
		let mut words = line.split_whitespace();
		let Some(verb) = words.next() else {
			return Ok(None);
		};

		let server = |w: Option<&str>| -> Result<ServerKey, String> {
			let w = w.ok_or_else(|| format!("{verb}: missing server"))?;
			ServerKey::new(w).map_err(|e| e.to_string())
		};

		let cmd = match verb.to_ascii_lowercase().as_str() {
			"exec" => {
				let server = server(words.next())?;
				let command = words.collect::<Vec<_>>().join(" ");
				if command.is_empty() {
					return Err("exec: missing command".to_string());
				}
				ConsoleCommand::Exec { server, command }
			}
			"players" => ConsoleCommand::Players(server(words.next())?),
			"capture" => match words.next() {
				Some("start") => ConsoleCommand::CaptureStart(server(words.next())?),
				Some("stop") => ConsoleCommand::CaptureStop,
				_ => return Err("usage: capture start <server> | capture stop".to_string()),
			},
			"feedback" => match words.next() {
				Some("on") => ConsoleCommand::Feedback(true),
				Some("off") => ConsoleCommand::Feedback(false),
				_ => return Err("usage: feedback on|off".to_string()),
			},
			"status" => ConsoleCommand::Status,
			"queue" => match words.next() {
				None => ConsoleCommand::Queue { clear: false },
				Some("clear") => ConsoleCommand::Queue { clear: true },
				Some(other) => return Err(format!("queue: unknown argument {other:?}")),
			},
			"servers" => ConsoleCommand::Servers,
			"help" | "?" => ConsoleCommand::Help,
			"quit" | "exit" => ConsoleCommand::Quit,
			other => return Err(format!("unknown command {other:?} (try help)")),
		};
		Ok(Some(cmd))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleExit {
	Quit,
	Eof,
}

pub struct Console {
	executor: Arc<dyn CommandExecutor>,
	receiver: LogReceiver,
	queue: Arc<PlayerQueue>,
	servers: Vec<ServerKey>,
}

impl Console {
	pub fn new(
		executor: Arc<dyn CommandExecutor>,
		receiver: LogReceiver,
		queue: Arc<PlayerQueue>,
		servers: Vec<ServerKey>,
	) -> Self {
		Self {
			executor,
			receiver,
			queue,
			servers,
		}
	}

	pub async fn run<R, W>(&self, input: R, output: &mut W) -> anyhow::Result<ConsoleExit>
	where
		R: AsyncBufRead + Unpin,
		W: AsyncWrite + Unpin,
	{
		let mut lines = input.lines();
		output.write_all(b"srcbridge console ready; type help\n").await?;
		output.flush().await?;

		while let Some(line) = lines.next_line().await.context("read console input")? {
			let text = match ConsoleCommand::parse(&line) {
				Ok(None) => continue,
				Ok(Some(ConsoleCommand::Quit)) => return Ok(ConsoleExit::Quit),
				Ok(Some(cmd)) => {
					debug!(?cmd, "console command");
					self.dispatch(cmd).await
				}
				Err(e) => e,
			};
			output.write_all(text.as_bytes()).await?;
			output.write_all(b"\n").await?;
			output.flush().await?;
		}

		Ok(ConsoleExit::Eof)
	}

	async fn dispatch(&self, cmd: ConsoleCommand) -> String {
		match cmd {
			ConsoleCommand::Exec { server, command } => self.executor.execute(&server, &command).await,
			ConsoleCommand::Players(server) => {
				let status = self.executor.execute(&server, "status").await;
				match parse_player_count(&status) {
					Some(n) => format!("{server}: {n} player(s)"),
					None => format!("{server}: player count unavailable ({})", first_line(&status)),
				}
			}
			ConsoleCommand::CaptureStart(server) => match self.receiver.start(&server).await {
				Ok(true) => format!("capturing logs from {server}"),
				Ok(false) => "a capture session is already active".to_string(),
				Err(e) => format!("capture failed: {e}"),
			},
			ConsoleCommand::CaptureStop => {
				if self.receiver.stop().await {
					"capture stopped".to_string()
				} else {
					"no capture session".to_string()
				}
			}
			ConsoleCommand::Feedback(true) => match self.receiver.enable_feedback().await {
				Ok(path) => format!("recording feedback to {}", path.display()),
				Err(e) => format!("feedback not enabled: {e}"),
			},
			ConsoleCommand::Feedback(false) => {
				if self.receiver.disable_feedback().await {
					"feedback recording stopped".to_string()
				} else {
					"feedback was not being recorded".to_string()
				}
			}
			ConsoleCommand::Status => {
				let status = self.receiver.capture_status().await;
				let capture = match (&status.server, &status.advertised) {
					(Some(server), Some(advertised)) => format!("capture: {server} (logs -> {advertised})"),
					_ => "capture: idle".to_string(),
				};
				let feedback = match &status.feedback_path {
					Some(path) => format!("feedback: on ({})", path.display()),
					None => "feedback: off".to_string(),
				};
				format!("{capture}\n{feedback}\nqueue: {} waiting", self.queue.len())
			}
			ConsoleCommand::Queue { clear: true } => format!("cleared {} queued player(s)", self.queue.clear()),
			ConsoleCommand::Queue { clear: false } => {
				let entries = self.queue.list();
				if entries.is_empty() {
					"queue is empty".to_string()
				} else {
					entries
						.iter()
						.enumerate()
						.map(|(i, e)| format!("{}. {} {}", i + 1, e.name, e.steam_id))
						.collect::<Vec<_>>()
						.join("\n")
				}
			}
			ConsoleCommand::Servers => {
				if self.servers.is_empty() {
					"no servers configured".to_string()
				} else {
					self.servers.iter().map(ServerKey::as_str).collect::<Vec<_>>().join(", ")
				}
			}
			ConsoleCommand::Help => HELP.to_string(),
			ConsoleCommand::Quit => String::new(),
		}
	}
}

fn first_line(text: &str) -> &str {
	text.lines().next().unwrap_or_default()
}
