#![forbid(unsafe_code)]

//! Classification of in-game chat lines into bridge commands.
//!
//! A recognised line looks like
//! `L 10/01/2024 - 12:00:00: "Name<12><[U:1:247]><Red>" say ">fb great job"`;
//! the log prefix and the quotes around the identity block are optional.

use std::fmt;

use srcbridge_domain::{ChatChannel, SteamId};

/// Prefix that turns a chat message into a bridge command.
pub const COMMAND_MARKER: char = '>';

/// Which grammar matched a line. Listeners register per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogMessageType {
	Feedback,
	PlaytestControl,
	RelayRcon,
	GenericCommand,
}

impl LogMessageType {
	/// Matching order; the first grammar that accepts a line wins.
	pub const PRIORITY: [LogMessageType; 4] = [
		LogMessageType::Feedback,
		LogMessageType::PlaytestControl,
		LogMessageType::RelayRcon,
		LogMessageType::GenericCommand,
	];

	pub const fn as_str(self) -> &'static str {
		match self {
			LogMessageType::Feedback => "feedback",
			LogMessageType::PlaytestControl => "playtest_control",
			LogMessageType::RelayRcon => "relay_rcon",
			LogMessageType::GenericCommand => "generic_command",
		}
	}

	/// Keywords owned by a dedicated grammar.
	pub const fn keywords(self) -> &'static [&'static str] {
		match self {
			LogMessageType::Feedback => &["fb", "feedback"],
			LogMessageType::PlaytestControl => &["p", "playtest"],
			LogMessageType::RelayRcon => &["r", "rcon"],
			LogMessageType::GenericCommand => &[],
		}
	}
}

impl fmt::Display for LogMessageType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Identity block of the player who spoke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
	pub name: String,
	/// Per-session user id assigned by the server.
	pub user_id: String,
	/// Network identity exactly as logged (`[U:1:N]`, `STEAM_0:...`, `BOT`).
	pub network_id: String,
	pub team: String,
}

impl Sender {
	pub fn steam_id(&self) -> Option<SteamId> {
		SteamId::parse(&self.network_id).ok()
	}

	pub fn is_console(&self) -> bool {
		self.network_id.eq_ignore_ascii_case("console")
	}
}

/// Chat line with the identity block and body split out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
	pub sender: Sender,
	pub channel: ChatChannel,
	pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
	Feedback { message: String },
	PlaytestControl { action: String },
	RelayRcon { command: String },
	GenericCommand { keyword: String, args: String },
}

impl MessageKind {
	pub fn message_type(&self) -> LogMessageType {
		match self {
			MessageKind::Feedback { .. } => LogMessageType::Feedback,
			MessageKind::PlaytestControl { .. } => LogMessageType::PlaytestControl,
			MessageKind::RelayRcon { .. } => LogMessageType::RelayRcon,
			MessageKind::GenericCommand { .. } => LogMessageType::GenericCommand,
		}
	}
}

/// A classified chat command, handed to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLogMessage {
	pub sender: Sender,
	pub channel: ChatChannel,
	/// Full chat body as typed, marker included.
	pub raw_body: String,
	pub kind: MessageKind,
}

impl ParsedLogMessage {
	pub fn message_type(&self) -> LogMessageType {
		self.kind.message_type()
	}
}

/// Classify one log line. `None` for anything that is not a player's
/// bridge command.
pub fn classify(line: &str) -> Option<ParsedLogMessage> {
	let chat = parse_chat_line(line)?;
	if chat.sender.is_console() {
		return None;
	}

	let (keyword, remainder) = split_command(&chat.body)?;

	let kind = LogMessageType::PRIORITY
		.iter()
		.find_map(|ty| match_grammar(*ty, keyword, remainder))?;

	Some(ParsedLogMessage {
		sender: chat.sender,
		channel: chat.channel,
		raw_body: chat.body,
		kind,
	})
}

fn match_grammar(ty: LogMessageType, keyword: &str, remainder: &str) -> Option<MessageKind> {
	if ty == LogMessageType::GenericCommand {
		return Some(MessageKind::GenericCommand {
			keyword: keyword.to_ascii_lowercase(),
			args: remainder.to_string(),
		});
	}

	if remainder.is_empty() || !ty.keywords().iter().any(|k| k.eq_ignore_ascii_case(keyword)) {
		return None;
	}

	let remainder = remainder.to_string();
	Some(match ty {
		LogMessageType::Feedback => MessageKind::Feedback { message: remainder },
		LogMessageType::PlaytestControl => MessageKind::PlaytestControl { action: remainder },
		_ => MessageKind::RelayRcon { command: remainder },
	})
}

/// Split `>kw rest` into `("kw", "rest")`.
fn split_command(body: &str) -> Option<(&str, &str)> {
	let rest = body.trim_start().strip_prefix(COMMAND_MARKER)?.trim_start();
	let (keyword, remainder) = match rest.find(char::is_whitespace) {
		Some(idx) => (&rest[..idx], rest[idx..].trim()),
		None => (rest, ""),
	};
	if keyword.is_empty() {
		return None;
	}
	Some((keyword, remainder))
}

/// Parse the identity block, chat verb and quoted body of a chat line.
pub fn parse_chat_line(line: &str) -> Option<ChatLine> {
	let line = strip_log_prefix(line.trim_end_matches(['\0', '\r', '\n']).trim());

	// Names and bodies may themselves contain `say "`, so try every verb
	// position and keep the first one that yields a well-formed line.
	let mut search_from = 0;
	while let Some(rel) = line[search_from..].find(" say") {
		let at = search_from + rel;
		search_from = at + 1;

		if let Some(chat) = parse_at(line, at) {
			return Some(chat);
		}
	}
	None
}

fn parse_at(line: &str, verb_at: usize) -> Option<ChatLine> {
	let ident = line[..verb_at].trim_end();
	let after = &line[verb_at + 1..];

	let (channel, rest) = if let Some(rest) = after.strip_prefix("say_team ") {
		(ChatChannel::Team, rest)
	} else if let Some(rest) = after.strip_prefix("say ") {
		(ChatChannel::All, rest)
	} else {
		return None;
	};

	let body = rest.strip_prefix('"')?;
	let body = body.strip_suffix('"')?;

	let ident = match ident.strip_prefix('"') {
		Some(inner) => inner.strip_suffix('"')?,
		None => ident,
	};
	let sender = parse_identity(ident)?;

	Some(ChatLine {
		sender,
		channel,
		body: body.to_string(),
	})
}

/// `name<uid><id><team>`, parsed from the right so names may contain `<`.
fn parse_identity(block: &str) -> Option<Sender> {
	let (rest, team) = take_last_group(block)?;
	let (rest, network_id) = take_last_group(rest)?;
	let (name, user_id) = take_last_group(rest)?;

	if network_id.is_empty() || name.is_empty() {
		return None;
	}
	if !user_id.is_empty() && !user_id.bytes().all(|b| b.is_ascii_digit() || b == b'-') {
		return None;
	}

	Some(Sender {
		name: name.to_string(),
		user_id: user_id.to_string(),
		network_id: network_id.to_string(),
		team: team.to_string(),
	})
}

fn take_last_group(s: &str) -> Option<(&str, &str)> {
	let inner = s.strip_suffix('>')?;
	let open = inner.rfind('<')?;
	Some((&inner[..open], &inner[open + 1..]))
}

fn strip_log_prefix(line: &str) -> &str {
	let Some(rest) = line.strip_prefix("L ") else {
		return line;
	};
	match rest.find(": ") {
		Some(idx) => &rest[idx + 2..],
		None => line,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn feedback_on_all_chat() {
		let msg = classify(r#"Name<1><STEAM_0:1:123><TEAM> say ">fb great job""#).expect("match");
		assert_eq!(msg.channel, ChatChannel::All);
		assert_eq!(
			msg.kind,
			MessageKind::Feedback {
				message: "great job".to_string()
			}
		);
		assert_eq!(msg.sender.name, "Name");
		assert_eq!(msg.sender.team, "TEAM");
		assert_eq!(msg.sender.steam_id(), Some(SteamId::Player(247)));
		assert_eq!(msg.raw_body, ">fb great job");
	}

	#[test]
	fn team_chat_sets_team_channel() {
		let msg = classify(r#"Name<1><[U:1:247]><Blue> say_team ">feedback spawn is too far""#).expect("match");
		assert_eq!(msg.channel, ChatChannel::Team);
		assert_eq!(msg.message_type(), LogMessageType::Feedback);
	}

	#[test]
	fn playtest_control() {
		let msg = classify(r#"Name<1><[U:1:247]><Red> say ">p start""#).expect("match");
		assert_eq!(
			msg.kind,
			MessageKind::PlaytestControl {
				action: "start".to_string()
			}
		);
	}

	#[test]
	fn relay_rcon_keeps_remainder_verbatim() {
		let msg = classify(r#"Name<1><[U:1:247]><Red> say ">rcon mp_timelimit 30""#).expect("match");
		assert_eq!(
			msg.kind,
			MessageKind::RelayRcon {
				command: "mp_timelimit 30".to_string()
			}
		);
	}

	#[test]
	fn full_engine_line_with_prefix_and_quotes() {
		let line = "L 10/01/2024 - 12:00:00: \"Some <Guy><12><[U:1:99]><Red>\" say \">  r  changelevel cp_badlands\"\n";
		let msg = classify(line).expect("match");
		assert_eq!(msg.sender.name, "Some <Guy>");
		assert_eq!(msg.sender.user_id, "12");
		assert_eq!(
			msg.kind,
			MessageKind::RelayRcon {
				command: "changelevel cp_badlands".to_string()
			}
		);
	}

	#[test]
	fn keyword_needs_a_boundary() {
		let msg = classify(r#"Name<1><[U:1:247]><Red> say ">pause""#).expect("match");
		assert_eq!(
			msg.kind,
			MessageKind::GenericCommand {
				keyword: "pause".to_string(),
				args: String::new()
			}
		);
	}

	#[test]
	fn dedicated_keyword_without_remainder_is_generic() {
		let msg = classify(r#"Name<1><[U:1:247]><Red> say ">FB""#).expect("match");
		assert_eq!(
			msg.kind,
			MessageKind::GenericCommand {
				keyword: "fb".to_string(),
				args: String::new()
			}
		);
	}

	#[test]
	fn keywords_are_case_insensitive() {
		let msg = classify(r#"Name<1><[U:1:247]><Red> say ">Playtest pause""#).expect("match");
		assert_eq!(msg.message_type(), LogMessageType::PlaytestControl);
	}

	#[test]
	fn generic_command_with_args() {
		let msg = classify(r#"Name<1><[U:1:247]><Spectator> say ">join now please""#).expect("match");
		assert_eq!(
			msg.kind,
			MessageKind::GenericCommand {
				keyword: "join".to_string(),
				args: "now please".to_string()
			}
		);
	}

	#[test]
	fn body_may_contain_verb_and_quotes() {
		let msg = classify(r#"Name<1><[U:1:247]><Red> say ">r say "hello" now""#).expect("match");
		assert_eq!(
			msg.kind,
			MessageKind::RelayRcon {
				command: r#"say "hello" now"#.to_string()
			}
		);
	}

	#[test]
	fn ignores_plain_chat_console_and_other_events() {
		assert!(classify(r#"Name<1><[U:1:247]><Red> say "gg""#).is_none());
		assert!(classify(r#""Console<0><Console><Console>" say ">fb relayed""#).is_none());
		assert!(classify(r#""Name<1><[U:1:247]><Red>" triggered "killedobject""#).is_none());
		assert!(classify(r#"Name<1><[U:1:247]><Red> say ">""#).is_none());
		assert!(classify("").is_none());
	}

	#[test]
	fn chat_line_without_identity_groups_is_rejected() {
		assert!(parse_chat_line(r#"server say ">fb hi""#).is_none());
	}

	proptest::proptest! {
		#[test]
		fn classify_never_panics(line in ".{0,200}") {
			let _ = classify(&line);
		}

		#[test]
		fn feedback_message_survives(msg in "[a-zA-Z0-9][a-zA-Z0-9 ,.!?]{0,60}") {
			let line = format!(r#""Player<3><[U:1:5]><Red>" say ">fb {msg}""#);
			let parsed = classify(&line).expect("match");
			proptest::prop_assert_eq!(parsed.kind, MessageKind::Feedback { message: msg.trim().to_string() });
		}
	}
}
