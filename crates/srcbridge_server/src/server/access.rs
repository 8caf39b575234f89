#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashSet};

use srcbridge_domain::SteamId;
use tracing::warn;

/// A chat-platform user that a game identity may be linked to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserHandle {
	pub id: String,
}

/// Resolves in-game identities to linked users and their privileges.
#[async_trait::async_trait]
pub trait IdentityDirectory: Send + Sync + 'static {
	async fn resolve_linked_user(&self, steam_id: &SteamId) -> anyhow::Result<Option<UserHandle>>;

	async fn is_authorized(&self, user: &UserHandle) -> anyhow::Result<bool>;
}

/// Identities allowed to run privileged bridge commands directly.
#[derive(Debug, Clone, Default)]
pub struct AccessList {
	allowed: HashSet<SteamId>,
}

impl AccessList {
	pub fn new(allowed: impl IntoIterator<Item = SteamId>) -> Self {
		Self {
			allowed: allowed.into_iter().filter(SteamId::is_player).collect(),
		}
	}

	pub fn contains(&self, id: &SteamId) -> bool {
		self.allowed.contains(id)
	}

	pub fn len(&self) -> usize {
		self.allowed.len()
	}

	pub fn is_empty(&self) -> bool {
		self.allowed.is_empty()
	}
}

/// Identity links and privileged users loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigIdentityDirectory {
	links: BTreeMap<SteamId, UserHandle>,
	privileged: HashSet<String>,
}

impl ConfigIdentityDirectory {
	pub fn new(links: impl IntoIterator<Item = (SteamId, String)>, privileged: impl IntoIterator<Item = String>) -> Self {
		Self {
			links: links.into_iter().map(|(id, user)| (id, UserHandle { id: user })).collect(),
			privileged: privileged.into_iter().collect(),
		}
	}
}

#[async_trait::async_trait]
impl IdentityDirectory for ConfigIdentityDirectory {
	async fn resolve_linked_user(&self, steam_id: &SteamId) -> anyhow::Result<Option<UserHandle>> {
		Ok(self.links.get(steam_id).cloned())
	}

	async fn is_authorized(&self, user: &UserHandle) -> anyhow::Result<bool> {
		Ok(self.privileged.contains(&user.id))
	}
}

/// Whether `id` may run privileged commands: on the allow-list, or linked
/// to an authorized user. Lookup failures deny.
pub async fn is_privileged(access: &AccessList, identities: &dyn IdentityDirectory, id: &SteamId) -> bool {
	if !id.is_player() {
		return false;
	}
	if access.contains(id) {
		return true;
	}

	let user = match identities.resolve_linked_user(id).await {
		Ok(Some(user)) => user,
		Ok(None) => return false,
		Err(e) => {
			warn!(steam_id = %id, error = %e, "identity lookup failed");
			return false;
		}
	};

	match identities.is_authorized(&user).await {
		Ok(authorized) => authorized,
		Err(e) => {
			warn!(steam_id = %id, user = %user.id, error = %e, "authorization check failed");
			false
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct FailingDirectory;

	#[async_trait::async_trait]
	impl IdentityDirectory for FailingDirectory {
		async fn resolve_linked_user(&self, _steam_id: &SteamId) -> anyhow::Result<Option<UserHandle>> {
			anyhow::bail!("directory offline")
		}

		async fn is_authorized(&self, _user: &UserHandle) -> anyhow::Result<bool> {
			Ok(true)
		}
	}

	#[tokio::test]
	async fn allow_list_and_linked_users() {
		let access = AccessList::new([SteamId::Player(1), SteamId::Bot]);
		assert_eq!(access.len(), 1);

		let identities = ConfigIdentityDirectory::new(
			[
				(SteamId::Player(2), "alice".to_string()),
				(SteamId::Player(3), "mallory".to_string()),
			],
			["alice".to_string()],
		);

		assert!(is_privileged(&access, &identities, &SteamId::Player(1)).await);
		assert!(is_privileged(&access, &identities, &SteamId::Player(2)).await);
		assert!(!is_privileged(&access, &identities, &SteamId::Player(3)).await);
		assert!(!is_privileged(&access, &identities, &SteamId::Player(4)).await);
		assert!(!is_privileged(&access, &identities, &SteamId::Bot).await);
	}

	#[tokio::test]
	async fn lookup_errors_deny() {
		let access = AccessList::default();
		assert!(!is_privileged(&access, &FailingDirectory, &SteamId::Player(9)).await);
	}
}
