#![forbid(unsafe_code)]

/// Substituted when a command produced no visible output.
pub const NO_REPLY_TEXT: &str = "Command sent. The server did not reply.";

/// Drop the server's log echo lines (`L ...`) from a reply.
pub fn strip_log_echo(raw: &str) -> String {
	raw.lines()
		.filter(|line| !line.starts_with("L "))
		.collect::<Vec<_>>()
		.join("\n")
}

/// Post-process a raw reply into the text handed back to callers.
pub fn clean_reply(raw: &str, no_reply_text: &str) -> String {
	let stripped = strip_log_echo(raw);
	let trimmed = stripped.trim_end();
	if trimmed.trim().is_empty() {
		no_reply_text.to_string()
	} else {
		trimmed.to_string()
	}
}

/// Extract the human player count from `status` output.
///
/// Accepts `players : 3 humans, 1 bots (16/0 max)` and the older
/// `players : 3 (24 max)`.
pub fn parse_player_count(status: &str) -> Option<u32> {
	status.lines().find_map(|line| {
		let rest = line.trim_start().strip_prefix("players")?;
		let rest = rest.trim_start().strip_prefix(':')?;
		let digits: String = rest.trim_start().chars().take_while(char::is_ascii_digit).collect();
		digits.parse().ok()
	})
}

/// Shorten text to at most `max_chars` characters, marking the cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
	if text.chars().count() <= max_chars {
		return text.to_string();
	}
	let keep = max_chars.saturating_sub(3);
	let mut out: String = text.chars().take(keep).collect();
	out.push_str("...");
	out
}
