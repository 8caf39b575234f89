#![forbid(unsafe_code)]

use std::collections::VecDeque;

use parking_lot::Mutex;
use srcbridge_domain::SteamId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
	pub steam_id: SteamId,
	pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
	/// Newly queued at this 1-based position.
	Joined(usize),
	/// Already queued at this position; the entry is unchanged.
	AlreadyQueued(usize),
}

/// Players waiting for a slot, in join order. One entry per identity.
#[derive(Debug, Default)]
pub struct PlayerQueue {
	entries: Mutex<VecDeque<QueueEntry>>,
}

impl PlayerQueue {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn join(&self, steam_id: SteamId, name: &str) -> JoinOutcome {
		let mut entries = self.entries.lock();
		if let Some(idx) = entries.iter().position(|e| e.steam_id == steam_id) {
			return JoinOutcome::AlreadyQueued(idx + 1);
		}
		entries.push_back(QueueEntry {
			steam_id,
			name: name.to_string(),
		});
		metrics::gauge!("srcbridge_queue_length").set(entries.len() as f64);
		JoinOutcome::Joined(entries.len())
	}

	/// Remove a player. Returns the position they held.
	pub fn leave(&self, steam_id: &SteamId) -> Option<usize> {
		let mut entries = self.entries.lock();
		let idx = entries.iter().position(|e| &e.steam_id == steam_id)?;
		entries.remove(idx);
		metrics::gauge!("srcbridge_queue_length").set(entries.len() as f64);
		Some(idx + 1)
	}

	#[cfg(test)]
	pub fn position(&self, steam_id: &SteamId) -> Option<usize> {
		self.entries.lock().iter().position(|e| &e.steam_id == steam_id).map(|i| i + 1)
	}

	pub fn list(&self) -> Vec<QueueEntry> {
		self.entries.lock().iter().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.lock().is_empty()
	}

	pub fn clear(&self) -> usize {
		let mut entries = self.entries.lock();
		let n = entries.len();
		entries.clear();
		metrics::gauge!("srcbridge_queue_length").set(0.0);
		n
	}
}
