#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use srcbridge_domain::ServerKey;
use srcbridge_ingest::CaptureHandle;
use srcbridge_rcon::CommandExecutor;
use tracing::{debug, info};

use crate::config::PlaytestSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaytestPhase {
	Pre,
	Start,
	Post,
	Pause,
	Unpause,
	Scramble,
}

impl PlaytestPhase {
	pub const ALL: [PlaytestPhase; 6] = [
		PlaytestPhase::Pre,
		PlaytestPhase::Start,
		PlaytestPhase::Post,
		PlaytestPhase::Pause,
		PlaytestPhase::Unpause,
		PlaytestPhase::Scramble,
	];

	/// Resolve an in-game alias, case-insensitively.
	pub fn from_alias(alias: &str) -> Option<Self> {
		match alias.trim().to_ascii_lowercase().as_str() {
			"pre" | "prestart" => Some(PlaytestPhase::Pre),
			"start" => Some(PlaytestPhase::Start),
			"post" => Some(PlaytestPhase::Post),
			"pause" | "p" => Some(PlaytestPhase::Pause),
			"unpause" | "u" => Some(PlaytestPhase::Unpause),
			"scramble" | "s" => Some(PlaytestPhase::Scramble),
			_ => None,
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			PlaytestPhase::Pre => "pre",
			PlaytestPhase::Start => "start",
			PlaytestPhase::Post => "post",
			PlaytestPhase::Pause => "pause",
			PlaytestPhase::Unpause => "unpause",
			PlaytestPhase::Scramble => "scramble",
		}
	}
}

impl fmt::Display for PlaytestPhase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Playtest state owned outside the router.
#[async_trait::async_trait]
pub trait PlaytestHooks: Send + Sync + 'static {
	/// Whether a playtest is running on `server` (phase commands are allowed).
	async fn playtest_active(&self, server: &ServerKey) -> bool;

	/// Run one phase transition; the returned text is relayed in-game.
	async fn run_phase(&self, server: &ServerKey, phase: PlaytestPhase) -> anyhow::Result<String>;
}

/// Playtest hooks driven by configured command lists.
///
/// A playtest counts as active while playtests are enabled and the log
/// capture session is on the same server.
pub struct ConfiguredPlaytest {
	executor: Arc<dyn CommandExecutor>,
	capture: CaptureHandle,
	settings: PlaytestSettings,
}

impl ConfiguredPlaytest {
	pub fn new(executor: Arc<dyn CommandExecutor>, capture: CaptureHandle, settings: PlaytestSettings) -> Self {
		Self {
			executor,
			capture,
			settings,
		}
	}

	fn commands_for(&self, phase: PlaytestPhase) -> &[String] {
		match phase {
			PlaytestPhase::Pre => &self.settings.pre,
			PlaytestPhase::Start => &self.settings.start,
			PlaytestPhase::Post => &self.settings.post,
			PlaytestPhase::Pause => &self.settings.pause,
			PlaytestPhase::Unpause => &self.settings.unpause,
			PlaytestPhase::Scramble => &self.settings.scramble,
		}
	}
}

#[async_trait::async_trait]
impl PlaytestHooks for ConfiguredPlaytest {
	async fn playtest_active(&self, server: &ServerKey) -> bool {
		self.settings.enabled && self.capture.active_server().await.as_ref() == Some(server)
	}

	async fn run_phase(&self, server: &ServerKey, phase: PlaytestPhase) -> anyhow::Result<String> {
		let commands = self.commands_for(phase);
		if commands.is_empty() {
			anyhow::bail!("no commands configured for playtest {phase}");
		}

		for command in commands {
			let reply = self.executor.execute(server, command).await;
			debug!(server = %server, %phase, command = %command, reply = %reply, "playtest command ran");
		}

		metrics::counter!("srcbridge_playtest_phases_total", "phase" => phase.as_str()).increment(1);
		info!(server = %server, %phase, commands = commands.len(), "playtest phase applied");
		Ok(format!("Playtest {phase}: ran {} command(s).", commands.len()))
	}
}
