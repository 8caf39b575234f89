#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context as _;
use srcbridge_domain::{ServerKey, SteamId};
use srcbridge_ingest::{CaptureHandle, LogListener, MessageKind, ParsedLogMessage, Sender};
use srcbridge_rcon::CommandExecutor;
use srcbridge_rcon::reply::truncate_chars;
use tracing::{debug, info, warn};

use crate::config::RouterSettings;
use crate::server::access::{AccessList, IdentityDirectory, is_privileged};
use crate::server::playtest::{PlaytestHooks, PlaytestPhase};
use crate::server::queue::{JoinOutcome, PlayerQueue};

/// Where acknowledged feedback goes.
#[async_trait::async_trait]
pub trait FeedbackSink: Send + Sync + 'static {
	/// `Ok(false)` when feedback is not being collected.
	async fn record(&self, sender: &Sender, text: &str) -> anyhow::Result<bool>;
}

#[async_trait::async_trait]
impl FeedbackSink for CaptureHandle {
	async fn record(&self, sender: &Sender, text: &str) -> anyhow::Result<bool> {
		Ok(self.append_feedback(sender, text).await?)
	}
}

/// Collaborators the router acts through.
pub struct RouterDeps {
	pub executor: Arc<dyn CommandExecutor>,
	pub identities: Arc<dyn IdentityDirectory>,
	pub access: AccessList,
	pub playtest: Arc<dyn PlaytestHooks>,
	pub feedback: Arc<dyn FeedbackSink>,
	pub queue: Arc<PlayerQueue>,
}

/// Acts on classified chat commands and answers in-game via `say`.
pub struct CommandRouter {
	deps: RouterDeps,
	cfg: RouterSettings,
}

impl CommandRouter {
	pub fn new(deps: RouterDeps, cfg: RouterSettings) -> Self {
		Self { deps, cfg }
	}

	pub async fn route(&self, server: &ServerKey, message: &ParsedLogMessage) -> anyhow::Result<()> {
		let kind = message.message_type();
		metrics::counter!("srcbridge_router_commands_total", "kind" => kind.as_str()).increment(1);
		debug!(server = %server, %kind, sender = %message.sender.name, "routing chat command");

		let sender = &message.sender;
		match &message.kind {
			MessageKind::Feedback { message: text } => self.feedback(server, sender, text).await,
			MessageKind::PlaytestControl { action } => {
				self.playtest(server, sender, action).await;
				Ok(())
			}
			MessageKind::RelayRcon { command } => {
				self.relay(server, sender, command).await;
				Ok(())
			}
			MessageKind::GenericCommand { keyword, args } => self.generic(server, sender, keyword, args).await,
		}
	}

	async fn generic(&self, server: &ServerKey, sender: &Sender, keyword: &str, args: &str) -> anyhow::Result<()> {
		let args = args.trim();
		match keyword {
			"fb" | "feedback" if args.is_empty() => self.say(server, "Usage: >fb <message>").await,
			"fb" | "feedback" => return self.feedback(server, sender, args).await,
			"p" | "playtest" if args.is_empty() => {
				let phases = PlaytestPhase::ALL.map(PlaytestPhase::as_str).join("|");
				self.say(server, &format!("Usage: >p <{phases}>")).await
			}
			"p" | "playtest" => self.playtest(server, sender, args).await,
			"r" | "rcon" if args.is_empty() => self.say(server, "Usage: >r <command>").await,
			"r" | "rcon" => self.relay(server, sender, args).await,
			"join" | "queue" => self.join(server, sender).await,
			"leave" | "unqueue" => self.leave(server, sender).await,
			"pub" | "public" => self.public(server, args).await,
			"help" => self.say(server, HELP_TEXT).await,
			other => {
				self.say(server, &format!("Unknown command '{other}'. Try >help."))
					.await
			}
		}
		Ok(())
	}

	async fn relay(&self, server: &ServerKey, sender: &Sender, command: &str) {
		if !self.privileged(sender).await {
			self.reject(server, sender, "rcon").await;
			return;
		}

		info!(server = %server, sender = %sender.name, network_id = %sender.network_id, command, "relaying rcon from chat");
		let reply = self.deps.executor.execute(server, command).await;
		self.echo(server, &reply).await;
	}

	async fn playtest(&self, server: &ServerKey, sender: &Sender, action: &str) {
		if !self.privileged(sender).await {
			self.reject(server, sender, "playtest controls").await;
			return;
		}

		if !self.deps.playtest.playtest_active(server).await {
			self.say(server, "No playtest is running on this server.").await;
			return;
		}

		let alias = action.split_whitespace().next().unwrap_or_default();
		let Some(phase) = PlaytestPhase::from_alias(alias) else {
			self.say(server, &format!("Unknown playtest action '{alias}'.")).await;
			return;
		};

		let text = match self.deps.playtest.run_phase(server, phase).await {
			Ok(text) => text,
			Err(e) => {
				warn!(server = %server, %phase, error = %e, "playtest phase failed");
				format!("Playtest {phase} failed: {e}")
			}
		};
		self.say(server, &text).await;
	}

	async fn feedback(&self, server: &ServerKey, sender: &Sender, text: &str) -> anyhow::Result<()> {
		let recorded = self
			.deps
			.feedback
			.record(sender, text)
			.await
			.with_context(|| format!("record feedback from {}", sender.name));

		match recorded {
			Ok(true) => {
				self.say(server, &format!("Thanks {}, feedback recorded.", sender.name)).await;
				Ok(())
			}
			Ok(false) => {
				self.say(server, "Feedback is not being collected right now.").await;
				Ok(())
			}
			Err(e) => {
				self.say(server, "Could not record feedback.").await;
				Err(e)
			}
		}
	}

	async fn join(&self, server: &ServerKey, sender: &Sender) {
		let Some(id) = player_id(sender) else {
			debug!(server = %server, sender = %sender.name, "queue join from non-player ignored");
			return;
		};
		let text = match self.deps.queue.join(id, &sender.name) {
			JoinOutcome::Joined(pos) => format!("{} joined the queue at position {pos}.", sender.name),
			JoinOutcome::AlreadyQueued(pos) => format!("{} is already queued at position {pos}.", sender.name),
		};
		self.say(server, &text).await;
	}

	async fn leave(&self, server: &ServerKey, sender: &Sender) {
		let Some(id) = player_id(sender) else {
			return;
		};
		let text = match self.deps.queue.leave(&id) {
			Some(_) => format!("{} left the queue.", sender.name),
			None => format!("{} is not in the queue.", sender.name),
		};
		self.say(server, &text).await;
	}

	async fn public(&self, server: &ServerKey, args: &str) {
		let Some(first) = args.split_whitespace().next() else {
			let text = if self.cfg.public_commands.is_empty() {
				"No public commands are enabled.".to_string()
			} else {
				format!("Public commands: {}", self.cfg.public_commands.join(", "))
			};
			self.say(server, &text).await;
			return;
		};

		let first = first.to_ascii_lowercase();
		if !self.cfg.public_commands.iter().any(|c| c == &first) {
			self.say(server, &format!("'{first}' is not a public command.")).await;
			return;
		}

		let reply = self.deps.executor.execute(server, args).await;
		self.echo(server, &reply).await;
	}

	async fn privileged(&self, sender: &Sender) -> bool {
		match player_id(sender) {
			Some(id) => is_privileged(&self.deps.access, self.deps.identities.as_ref(), &id).await,
			None => false,
		}
	}

	async fn reject(&self, server: &ServerKey, sender: &Sender, what: &str) {
		metrics::counter!("srcbridge_router_unauthorized_total").increment(1);
		warn!(server = %server, sender = %sender.name, network_id = %sender.network_id, what, "unauthorized chat command");
		self.say(server, &format!("{} is not allowed to use {what}.", sender.name))
			.await;
	}

	async fn echo(&self, server: &ServerKey, reply: &str) {
		let flat = reply.lines().map(str::trim).filter(|l| !l.is_empty()).collect::<Vec<_>>().join(" | ");
		self.say(server, &truncate_chars(&flat, self.cfg.max_echo_chars)).await;
	}

	async fn say(&self, server: &ServerKey, text: &str) {
		let line = say_command(&self.cfg.say_prefix, text);
		let reply = self.deps.executor.execute(server, &line).await;
		debug!(server = %server, reply = %reply, "said in game");
	}
}

#[async_trait::async_trait]
impl LogListener for CommandRouter {
	async fn on_message(&self, server: &ServerKey, message: ParsedLogMessage) -> anyhow::Result<()> {
		self.route(server, &message).await
	}
}

const HELP_TEXT: &str = "Commands: >fb <text>, >join, >leave, >pub <command>, >p <phase>, >r <command>, >help";

fn player_id(sender: &Sender) -> Option<SteamId> {
	sender.steam_id().filter(SteamId::is_player)
}

/// Build a `say` command that cannot break out of its argument.
pub fn say_command(prefix: &str, text: &str) -> String {
	let text: String = text
		.chars()
		.map(|c| match c {
			'"' => '\'',
			';' => ',',
			'\r' | '\n' => ' ',
			c => c,
		})
		.collect();
	let prefix = prefix.trim();
	if prefix.is_empty() {
		format!("say \"{}\"", text.trim())
	} else {
		format!("say \"{prefix} {}\"", text.trim())
	}
}
