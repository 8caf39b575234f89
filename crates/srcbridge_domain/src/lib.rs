#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
	#[error("unknown chat channel token: {0}")]
	UnknownChannel(String),
}

/// Configuration key naming one game server (e.g. `pug-1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct ServerKey(String);

impl ServerKey {
	/// Create a non-empty `ServerKey` (surrounding whitespace is trimmed).
	pub fn new(key: impl Into<String>) -> Result<Self, ParseIdError> {
		let key = key.into();
		let trimmed = key.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if trimmed.chars().any(char::is_whitespace) {
			return Err(ParseIdError::InvalidFormat(format!("server key must not contain whitespace: {trimmed}")));
		}
		Ok(Self(trimmed.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ServerKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ServerKey {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ServerKey::new(s.to_string())
	}
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Resolved connection details for one game server.
///
/// Owned by configuration; connections and the pool hold clones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
	pub key: ServerKey,
	/// RCON address in `host:port` form.
	pub address: String,
	/// RCON password sent once during the handshake.
	pub password: SecretString,
	/// Port advertised to the server in `logaddress_add`.
	pub log_port: u16,
}

impl ServerEndpoint {
	pub fn new(key: ServerKey, address: impl Into<String>, password: SecretString, log_port: u16) -> Self {
		Self {
			key,
			address: address.into(),
			password,
			log_port,
		}
	}

	/// Host part of `address`, brackets stripped for IPv6 literals.
	pub fn host(&self) -> &str {
		let host = self.address.rsplit_once(':').map(|(h, _)| h).unwrap_or(&self.address);
		host.trim_start_matches('[').trim_end_matches(']')
	}
}

/// Chat scope of an in-game message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "snake_case"))]
pub enum ChatChannel {
	/// `say`
	All,
	/// `say_team`
	Team,
}

impl ChatChannel {
	/// Log token used by the engine for this channel.
	pub const fn as_token(self) -> &'static str {
		match self {
			ChatChannel::All => "say",
			ChatChannel::Team => "say_team",
		}
	}

	pub fn from_token(token: &str) -> Result<Self, ParseIdError> {
		match token {
			"say" => Ok(ChatChannel::All),
			"say_team" => Ok(ChatChannel::Team),
			other => Err(ParseIdError::UnknownChannel(other.to_string())),
		}
	}
}

impl fmt::Display for ChatChannel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_token())
	}
}

/// Offset between a 64-bit community id and the 32-bit account id.
const STEAM64_BASE: u64 = 76_561_197_960_265_728;

/// Normalized player identity as reported in server logs.
///
/// The engine prints the same account as `STEAM_0:1:123`, `[U:1:247]` or
/// `76561197960265975` depending on game and settings; all of them parse
/// to the same `Player` account id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "snake_case"))]
pub enum SteamId {
	Player(u32),
	Bot,
	Console,
}

impl SteamId {
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		if s.eq_ignore_ascii_case("bot") {
			return Ok(SteamId::Bot);
		}
		if s.eq_ignore_ascii_case("console") {
			return Ok(SteamId::Console);
		}

		if let Some(rest) = s.strip_prefix("STEAM_") {
			let mut parts = rest.split(':');
			let (Some(_universe), Some(y), Some(z), None) = (parts.next(), parts.next(), parts.next(), parts.next()) else {
				return Err(ParseIdError::InvalidFormat(format!("expected STEAM_X:Y:Z: {s}")));
			};
			let y: u32 = y
				.parse()
				.map_err(|_| ParseIdError::InvalidFormat(format!("invalid steam2 auth bit: {s}")))?;
			let z: u32 = z
				.parse()
				.map_err(|_| ParseIdError::InvalidFormat(format!("invalid steam2 account: {s}")))?;
			if y > 1 {
				return Err(ParseIdError::InvalidFormat(format!("invalid steam2 auth bit: {s}")));
			}
			let account = z
				.checked_mul(2)
				.and_then(|v| v.checked_add(y))
				.ok_or_else(|| ParseIdError::InvalidFormat(format!("steam2 account out of range: {s}")))?;
			return Ok(SteamId::Player(account));
		}

		let bare = s.trim_start_matches('[').trim_end_matches(']');
		if let Some(rest) = bare.strip_prefix("U:") {
			let (_universe, account) = rest
				.split_once(':')
				.ok_or_else(|| ParseIdError::InvalidFormat(format!("expected [U:1:N]: {s}")))?;
			let account: u32 = account
				.parse()
				.map_err(|_| ParseIdError::InvalidFormat(format!("invalid steam3 account: {s}")))?;
			return Ok(SteamId::Player(account));
		}

		if s.len() == 17 && s.bytes().all(|b| b.is_ascii_digit()) {
			let id: u64 = s
				.parse()
				.map_err(|_| ParseIdError::InvalidFormat(format!("invalid steam64 id: {s}")))?;
			let account = id
				.checked_sub(STEAM64_BASE)
				.and_then(|v| u32::try_from(v).ok())
				.ok_or_else(|| ParseIdError::InvalidFormat(format!("steam64 id out of range: {s}")))?;
			return Ok(SteamId::Player(account));
		}

		Err(ParseIdError::InvalidFormat(format!("unrecognized steam id: {s}")))
	}

	/// Whether this identity belongs to a human player.
	pub fn is_player(&self) -> bool {
		matches!(self, SteamId::Player(_))
	}

	/// `STEAM_0:Y:Z` form; `None` for bots and the console.
	pub fn to_steam2(&self) -> Option<String> {
		match self {
			SteamId::Player(account) => Some(format!("STEAM_0:{}:{}", account & 1, account >> 1)),
			_ => None,
		}
	}

	/// 64-bit community id; `None` for bots and the console.
	pub fn to_steam64(&self) -> Option<u64> {
		match self {
			SteamId::Player(account) => Some(STEAM64_BASE + u64::from(*account)),
			_ => None,
		}
	}
}

impl fmt::Display for SteamId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SteamId::Player(account) => write!(f, "[U:1:{account}]"),
			SteamId::Bot => f.write_str("BOT"),
			SteamId::Console => f.write_str("Console"),
		}
	}
}

impl FromStr for SteamId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		SteamId::parse(s)
	}
}
