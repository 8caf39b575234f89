#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow, bail};
use serde::Deserialize;
use srcbridge_domain::{SecretString, ServerEndpoint, ServerKey, SteamId};
use srcbridge_ingest::ReceiverConfig;
use srcbridge_rcon::reply::NO_REPLY_TEXT;
use srcbridge_rcon::{ConnectionConfig, GatewayConfig};
use srcbridge_util::endpoint::HostPort;
use tracing::{info, warn};

pub const DEFAULT_RCON_PORT: u16 = 27015;

/// Default config path: `~/.srcbridge/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".srcbridge").join("config.toml"))
}

/// Load the bridge config from TOML and `SRCBRIDGE_*` env overrides.
pub fn load_bridge_config_from_path(path: &Path) -> anyhow::Result<BridgeConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = BridgeConfig::from_file(file_cfg).with_context(|| format!("invalid config in {}", path.display()))?;

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
	pub bridge: BridgeSettings,
	pub rcon: RconSettings,
	pub log_receiver: LogReceiverSettings,
	pub servers: Vec<ServerEndpoint>,
	pub access: AccessSettings,
	pub router: RouterSettings,
	pub playtest: PlaytestSettings,
}

#[derive(Debug, Clone, Default)]
pub struct BridgeSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RconSettings {
	pub connect_timeout: Duration,
	pub command_timeout: Duration,
	pub stale_check_interval: Duration,
	pub max_stale_ticks: u32,
	pub max_attempts: u32,
	pub retry_delay: Duration,
	pub quiet_commands: Vec<String>,
	pub no_reply_text: String,
}

impl Default for RconSettings {
	fn default() -> Self {
		let gw = GatewayConfig::default();
		Self {
			connect_timeout: gw.connection.connect_timeout,
			command_timeout: gw.connection.command_timeout,
			stale_check_interval: gw.connection.stale_check_interval,
			max_stale_ticks: gw.connection.max_stale_ticks,
			max_attempts: gw.max_attempts,
			retry_delay: gw.retry_delay,
			quiet_commands: gw.quiet_commands,
			no_reply_text: gw.no_reply_text,
		}
	}
}

#[derive(Debug, Clone)]
pub struct LogReceiverSettings {
	pub bind: SocketAddr,
	/// Host game servers send logs to. Falls back to the bind IP.
	pub advertise_host: Option<String>,
	pub filter_source: bool,
	pub debug_raw: bool,
	pub feedback_dir: PathBuf,
}

impl Default for LogReceiverSettings {
	fn default() -> Self {
		let rc = ReceiverConfig::default();
		Self {
			bind: rc.bind,
			advertise_host: None,
			filter_source: rc.filter_source,
			debug_raw: rc.debug_raw,
			feedback_dir: rc.feedback_dir,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct AccessSettings {
	/// Identities allowed to relay rcon and control playtests.
	pub allow: Vec<SteamId>,
	/// Linked users (by id) treated as privileged.
	pub privileged_users: Vec<String>,
	/// In-game identity -> linked user id.
	pub links: BTreeMap<SteamId, String>,
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
	/// Prefix on every line the bridge says in-game.
	pub say_prefix: String,
	/// Relay replies echoed in-game are cut to this many characters.
	pub max_echo_chars: usize,
	/// First tokens anyone may run via the `pub` keyword.
	pub public_commands: Vec<String>,
}

impl Default for RouterSettings {
	fn default() -> Self {
		Self {
			say_prefix: "[bridge]".to_string(),
			max_echo_chars: 180,
			public_commands: Vec::new(),
		}
	}
}

/// Command lists run for each playtest phase.
#[derive(Debug, Clone, Default)]
pub struct PlaytestSettings {
	pub enabled: bool,
	pub pre: Vec<String>,
	pub start: Vec<String>,
	pub post: Vec<String>,
	pub pause: Vec<String>,
	pub unpause: Vec<String>,
	pub scramble: Vec<String>,
}

impl BridgeConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let rcon_defaults = RconSettings::default();
		let rcon = RconSettings {
			connect_timeout: file
				.rcon
				.connect_timeout_ms
				.map(Duration::from_millis)
				.unwrap_or(rcon_defaults.connect_timeout),
			command_timeout: file
				.rcon
				.command_timeout_ms
				.map(Duration::from_millis)
				.unwrap_or(rcon_defaults.command_timeout),
			stale_check_interval: file
				.rcon
				.stale_check_interval_ms
				.map(Duration::from_millis)
				.unwrap_or(rcon_defaults.stale_check_interval),
			max_stale_ticks: file.rcon.max_stale_ticks.unwrap_or(rcon_defaults.max_stale_ticks),
			max_attempts: file.rcon.max_attempts.filter(|n| *n > 0).unwrap_or(rcon_defaults.max_attempts),
			retry_delay: file
				.rcon
				.retry_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(rcon_defaults.retry_delay),
			quiet_commands: file.rcon.quiet_commands.unwrap_or(rcon_defaults.quiet_commands),
			no_reply_text: file
				.rcon
				.no_reply_text
				.filter(|s| !s.trim().is_empty())
				.unwrap_or_else(|| NO_REPLY_TEXT.to_string()),
		};

		let receiver_defaults = LogReceiverSettings::default();
		let bind = match file.log_receiver.bind.filter(|s| !s.trim().is_empty()) {
			Some(s) => s
				.trim()
				.parse::<SocketAddr>()
				.with_context(|| format!("log_receiver.bind must be ip:port, got {s:?}"))?,
			None => receiver_defaults.bind,
		};
		let log_receiver = LogReceiverSettings {
			bind,
			advertise_host: file.log_receiver.advertise_host.filter(|s| !s.trim().is_empty()),
			filter_source: file.log_receiver.filter_source.unwrap_or(true),
			debug_raw: file.log_receiver.debug_raw.unwrap_or(false),
			feedback_dir: file
				.log_receiver
				.feedback_dir
				.filter(|s| !s.trim().is_empty())
				.map(PathBuf::from)
				.unwrap_or(receiver_defaults.feedback_dir),
		};

		let mut servers = Vec::with_capacity(file.servers.len());
		for s in file.servers {
			let key = ServerKey::new(&s.key).with_context(|| format!("invalid server key {:?}", s.key))?;
			if servers.iter().any(|e: &ServerEndpoint| e.key == key) {
				bail!("duplicate server key {key}");
			}
			let address = HostPort::parse_with_default(&s.address, Some(DEFAULT_RCON_PORT))
				.map_err(|e| anyhow!("server {key}: {e}"))?;
			let log_port = s.log_port.unwrap_or(bind.port());
			servers.push(ServerEndpoint::new(
				key,
				address.hostport(),
				SecretString::new(s.password.unwrap_or_default()),
				log_port,
			));
		}

		let allow = file
			.access
			.allow
			.iter()
			.map(|s| SteamId::parse(s).with_context(|| format!("access.allow: invalid steam id {s:?}")))
			.collect::<anyhow::Result<Vec<_>>>()?;
		let links = file
			.access
			.links
			.into_iter()
			.map(|(id, user)| -> anyhow::Result<(SteamId, String)> {
				let id = SteamId::parse(&id).with_context(|| format!("access.links: invalid steam id {id:?}"))?;
				Ok((id, user))
			})
			.collect::<anyhow::Result<BTreeMap<_, _>>>()?;

		let router_defaults = RouterSettings::default();
		let router = RouterSettings {
			say_prefix: file.router.say_prefix.unwrap_or(router_defaults.say_prefix),
			max_echo_chars: file
				.router
				.max_echo_chars
				.filter(|n| *n > 0)
				.unwrap_or(router_defaults.max_echo_chars),
			public_commands: file
				.router
				.public_commands
				.into_iter()
				.map(|c| c.trim().to_ascii_lowercase())
				.filter(|c| !c.is_empty())
				.collect(),
		};

		Ok(Self {
			bridge: BridgeSettings {
				metrics_bind: file.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.health_bind.filter(|s| !s.trim().is_empty()),
			},
			rcon,
			log_receiver,
			servers,
			access: AccessSettings {
				allow,
				privileged_users: file.access.privileged_users,
				links,
			},
			router,
			playtest: PlaytestSettings {
				enabled: file.playtest.enabled.unwrap_or(false),
				pre: file.playtest.pre,
				start: file.playtest.start,
				post: file.playtest.post,
				pause: file.playtest.pause,
				unpause: file.playtest.unpause,
				scramble: file.playtest.scramble,
			},
		})
	}

	pub fn gateway_config(&self) -> GatewayConfig {
		GatewayConfig {
			connection: ConnectionConfig {
				connect_timeout: self.rcon.connect_timeout,
				command_timeout: self.rcon.command_timeout,
				stale_check_interval: self.rcon.stale_check_interval,
				max_stale_ticks: self.rcon.max_stale_ticks,
				..ConnectionConfig::default()
			},
			max_attempts: self.rcon.max_attempts,
			retry_delay: self.rcon.retry_delay,
			quiet_commands: self.rcon.quiet_commands.clone(),
			no_reply_text: self.rcon.no_reply_text.clone(),
		}
	}

	pub fn receiver_config(&self) -> ReceiverConfig {
		let advertise_host = self
			.log_receiver
			.advertise_host
			.clone()
			.unwrap_or_else(|| self.log_receiver.bind.ip().to_string());
		ReceiverConfig {
			bind: self.log_receiver.bind,
			advertise_host,
			filter_source: self.log_receiver.filter_source,
			debug_raw: self.log_receiver.debug_raw,
			feedback_dir: self.log_receiver.feedback_dir.clone(),
			..ReceiverConfig::default()
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	metrics_bind: Option<String>,
	health_bind: Option<String>,

	#[serde(default)]
	rcon: FileRconSettings,

	#[serde(default)]
	log_receiver: FileLogReceiverSettings,

	#[serde(default)]
	servers: Vec<FileServer>,

	#[serde(default)]
	access: FileAccessSettings,

	#[serde(default)]
	router: FileRouterSettings,

	#[serde(default)]
	playtest: FilePlaytestSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRconSettings {
	connect_timeout_ms: Option<u64>,
	command_timeout_ms: Option<u64>,
	stale_check_interval_ms: Option<u64>,
	max_stale_ticks: Option<u32>,
	max_attempts: Option<u32>,
	retry_delay_ms: Option<u64>,
	quiet_commands: Option<Vec<String>>,
	no_reply_text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLogReceiverSettings {
	bind: Option<String>,
	advertise_host: Option<String>,
	filter_source: Option<bool>,
	debug_raw: Option<bool>,
	feedback_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileServer {
	key: String,
	address: String,
	password: Option<String>,
	log_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAccessSettings {
	#[serde(default)]
	allow: Vec<String>,
	#[serde(default)]
	privileged_users: Vec<String>,
	#[serde(default)]
	links: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRouterSettings {
	say_prefix: Option<String>,
	max_echo_chars: Option<usize>,
	#[serde(default)]
	public_commands: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePlaytestSettings {
	enabled: Option<bool>,
	#[serde(default)]
	pre: Vec<String>,
	#[serde(default)]
	start: Vec<String>,
	#[serde(default)]
	post: Vec<String>,
	#[serde(default)]
	pause: Vec<String>,
	#[serde(default)]
	unpause: Vec<String>,
	#[serde(default)]
	scramble: Vec<String>,
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

/// `SRCBRIDGE_RCON_PASSWORD_<KEY>` with the key upper-cased and
/// non-alphanumerics mapped to `_`.
pub fn password_env_var(key: &ServerKey) -> String {
	let suffix: String = key
		.as_str()
		.chars()
		.map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
		.collect();
	format!("SRCBRIDGE_RCON_PASSWORD_{suffix}")
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn apply_env_overrides(cfg: &mut BridgeConfig, lookup: impl Fn(&str) -> Option<String>) {
	if let Some(v) = non_empty(lookup("SRCBRIDGE_METRICS_BIND")) {
		cfg.bridge.metrics_bind = Some(v);
		info!("bridge config: metrics_bind overridden by env");
	}

	if let Some(v) = non_empty(lookup("SRCBRIDGE_HEALTH_BIND")) {
		cfg.bridge.health_bind = Some(v);
		info!("bridge config: health_bind overridden by env");
	}

	if let Some(v) = non_empty(lookup("SRCBRIDGE_LOG_BIND")) {
		match v.parse::<SocketAddr>() {
			Ok(bind) => {
				cfg.log_receiver.bind = bind;
				info!(%bind, "log receiver: bind overridden by env");
			}
			Err(_) => warn!(value = %v, "log receiver: ignoring invalid SRCBRIDGE_LOG_BIND"),
		}
	}

	if let Some(v) = non_empty(lookup("SRCBRIDGE_LOG_ADVERTISE_HOST")) {
		cfg.log_receiver.advertise_host = Some(v);
		info!("log receiver: advertise_host overridden by env");
	}

	if let Some(v) = lookup("SRCBRIDGE_LOG_FILTER_SOURCE")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.log_receiver.filter_source = enabled;
		info!(enabled, "log receiver: filter_source overridden by env");
	}

	if let Some(v) = lookup("SRCBRIDGE_LOG_DEBUG_RAW")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.log_receiver.debug_raw = enabled;
		info!(enabled, "log receiver: debug_raw overridden by env");
	}

	if let Some(v) = non_empty(lookup("SRCBRIDGE_FEEDBACK_DIR")) {
		cfg.log_receiver.feedback_dir = PathBuf::from(v);
		info!("log receiver: feedback_dir overridden by env");
	}

	if let Some(v) = lookup("SRCBRIDGE_RCON_COMMAND_TIMEOUT_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.rcon.command_timeout = Duration::from_millis(ms);
		info!(ms, "rcon config: command_timeout overridden by env");
	}

	if let Some(v) = lookup("SRCBRIDGE_RCON_MAX_ATTEMPTS")
		&& let Ok(n) = v.trim().parse::<u32>()
		&& n > 0
	{
		cfg.rcon.max_attempts = n;
		info!(max_attempts = n, "rcon config: max_attempts overridden by env");
	}

	if let Some(v) = lookup("SRCBRIDGE_PLAYTEST_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.playtest.enabled = enabled;
		info!(enabled, "playtest config: enabled overridden by env");
	}

	for server in &mut cfg.servers {
		if let Some(v) = non_empty(lookup(&password_env_var(&server.key))) {
			server.password = SecretString::new(v);
			info!(server = %server.key, "rcon config: password overridden by env");
		}
	}

	for server in &cfg.servers {
		if server.password.expose().is_empty() {
			warn!(server = %server.key, "rcon config: no password configured; authentication will fail");
		}
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	const SAMPLE: &str = r#"
health_bind = "127.0.0.1:9100"

[rcon]
command_timeout_ms = 1500
max_attempts = 3

[log_receiver]
bind = "0.0.0.0:27600"
advertise_host = "203.0.113.7"

[[servers]]
key = "pug-1"
address = "10.0.0.5"
password = "hunter2"

[[servers]]
key = "pug-2"
address = "10.0.0.6:27016"
log_port = 27601

[access]
allow = ["[U:1:1234]"]
privileged_users = ["alice"]
links = { "STEAM_0:1:10" = "alice" }

[router]
public_commands = ["Status", " "]

[playtest]
enabled = true
start = ["mp_tournament_restart", "mp_restartgame 1"]
"#;

	fn parse(s: &str) -> anyhow::Result<BridgeConfig> {
		BridgeConfig::from_file(toml::from_str(s)?)
	}

	#[test]
	fn normalizes_file_config() {
		let cfg = parse(SAMPLE).expect("config");

		assert_eq!(cfg.bridge.health_bind.as_deref(), Some("127.0.0.1:9100"));
		assert_eq!(cfg.rcon.command_timeout, Duration::from_millis(1500));
		assert_eq!(cfg.rcon.max_attempts, 3);
		assert_eq!(cfg.rcon.connect_timeout, Duration::from_secs(5));

		assert_eq!(cfg.servers.len(), 2);
		assert_eq!(cfg.servers[0].address, "10.0.0.5:27015");
		assert_eq!(cfg.servers[0].log_port, 27600);
		assert_eq!(cfg.servers[0].password.expose(), "hunter2");
		assert_eq!(cfg.servers[1].log_port, 27601);

		assert_eq!(cfg.access.allow, vec![SteamId::Player(1234)]);
		assert_eq!(cfg.access.links.get(&SteamId::Player(21)).map(String::as_str), Some("alice"));
		assert_eq!(cfg.router.public_commands, vec!["status".to_string()]);
		assert!(cfg.playtest.enabled);
		assert_eq!(cfg.playtest.start.len(), 2);

		let gw = cfg.gateway_config();
		assert_eq!(gw.max_attempts, 3);
		assert_eq!(gw.connection.command_timeout, Duration::from_millis(1500));

		let rc = cfg.receiver_config();
		assert_eq!(rc.advertise_host, "203.0.113.7");
		assert_eq!(rc.bind.port(), 27600);
	}

	#[test]
	fn empty_file_uses_defaults() {
		let cfg = parse("").expect("config");
		assert!(cfg.servers.is_empty());
		assert_eq!(cfg.rcon.max_attempts, 5);
		assert_eq!(cfg.router.say_prefix, "[bridge]");
		assert!(!cfg.playtest.enabled);
		assert_eq!(cfg.receiver_config().advertise_host, "0.0.0.0");
	}

	#[test]
	fn source_filter_is_on_unless_disabled() {
		assert!(parse("").expect("config").receiver_config().filter_source);

		let mut cfg = parse("[log_receiver]\nfilter_source = false").expect("config");
		assert!(!cfg.receiver_config().filter_source);

		apply_env_overrides(&mut cfg, |k| (k == "SRCBRIDGE_LOG_FILTER_SOURCE").then(|| "true".to_string()));
		assert!(cfg.receiver_config().filter_source);
	}

	#[test]
	fn rejects_bad_identities_and_duplicates() {
		assert!(parse("[access]\nallow = [\"nobody\"]").is_err());

		let dup = r#"
[[servers]]
key = "a"
address = "10.0.0.1"
[[servers]]
key = "a"
address = "10.0.0.2"
"#;
		let err = parse(dup).unwrap_err();
		assert!(format!("{err:#}").contains("duplicate"));
	}

	#[test]
	fn env_overrides_apply() {
		let mut cfg = parse(SAMPLE).expect("config");
		let env: HashMap<&str, &str> = HashMap::from([
			("SRCBRIDGE_RCON_PASSWORD_PUG_2", "from-env"),
			("SRCBRIDGE_LOG_DEBUG_RAW", "yes"),
			("SRCBRIDGE_RCON_MAX_ATTEMPTS", "0"),
			("SRCBRIDGE_METRICS_BIND", "127.0.0.1:9000"),
		]);
		apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

		assert_eq!(cfg.servers[1].password.expose(), "from-env");
		assert_eq!(cfg.servers[0].password.expose(), "hunter2");
		assert!(cfg.log_receiver.debug_raw);
		assert_eq!(cfg.rcon.max_attempts, 3);
		assert_eq!(cfg.bridge.metrics_bind.as_deref(), Some("127.0.0.1:9000"));
	}

	#[test]
	fn env_var_names() {
		assert_eq!(
			password_env_var(&ServerKey::new("pug-1.eu").expect("key")),
			"SRCBRIDGE_RCON_PASSWORD_PUG_1_EU"
		);
		assert_eq!(parse_env_bool(" ON "), Some(true));
		assert_eq!(parse_env_bool("maybe"), None);
	}
}
