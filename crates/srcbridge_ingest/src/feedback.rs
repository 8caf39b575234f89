#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use srcbridge_domain::ServerKey;
use tokio::io::AsyncWriteExt as _;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Append-only text log of player feedback for one capture session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackLog {
	path: PathBuf,
}

impl FeedbackLog {
	/// `<dir>/<server>-<unix_ms>.log`
	pub fn path_for(dir: &Path, server: &ServerKey, unix_ms: i64) -> PathBuf {
		dir.join(format!("{server}-{unix_ms}.log"))
	}

	/// Create the log and seed it with a marker line.
	pub async fn create(dir: &Path, server: &ServerKey, unix_ms: i64) -> std::io::Result<Self> {
		tokio::fs::create_dir_all(dir).await?;
		let log = Self {
			path: Self::path_for(dir, server, unix_ms),
		};
		let marker = format!(
			"{} - feedback capture started for {server}\n",
			Local::now().format(TIMESTAMP_FORMAT)
		);
		log.append_raw(&marker).await?;
		Ok(log)
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub async fn append(&self, name: &str, team: &str, message: &str) -> std::io::Result<()> {
		let line = format_feedback_line(Local::now(), name, team, message);
		self.append_raw(&line).await
	}

	async fn append_raw(&self, line: &str) -> std::io::Result<()> {
		let mut file = tokio::fs::OpenOptions::new()
			.create(true)
			.append(true)
			.open(&self.path)
			.await?;
		file.write_all(line.as_bytes()).await?;
		file.flush().await
	}
}

/// `<timestamp> - <name> (<team>): <message>` plus newline.
pub fn format_feedback_line(at: DateTime<Local>, name: &str, team: &str, message: &str) -> String {
	let message = message.replace(['\r', '\n'], " ");
	format!("{} - {name} ({team}): {message}\n", at.format(TIMESTAMP_FORMAT))
}

#[cfg(test)]
mod tests {
	use chrono::TimeZone as _;

	use super::*;

	#[test]
	fn line_format() {
		let at = Local.with_ymd_and_hms(2024, 10, 1, 12, 30, 5).single().expect("valid time");
		assert_eq!(
			format_feedback_line(at, "Scout", "Red", "great job"),
			"2024-10-01 12:30:05 - Scout (Red): great job\n"
		);
	}

	#[tokio::test]
	async fn create_seeds_then_appends() {
		let dir = tempfile::tempdir().expect("tempdir");
		let server = ServerKey::new("pug-1").unwrap();

		let log = FeedbackLog::create(dir.path(), &server, 1_700_000_000_000).await.expect("create");
		assert_eq!(log.path(), dir.path().join("pug-1-1700000000000.log"));

		log.append("Scout", "Red", "first").await.expect("append");
		log.append("Medic", "Blue", "second\nline").await.expect("append");

		let text = tokio::fs::read_to_string(log.path()).await.expect("read");
		let lines: Vec<&str> = text.lines().collect();
		assert_eq!(lines.len(), 3);
		assert!(lines[0].ends_with("feedback capture started for pug-1"));
		assert!(lines[1].ends_with(" - Scout (Red): first"));
		assert!(lines[2].ends_with(" - Medic (Blue): second line"));
	}
}
