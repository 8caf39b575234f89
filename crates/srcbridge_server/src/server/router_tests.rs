#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use srcbridge_domain::{ServerKey, SteamId};
use srcbridge_ingest::{LogListener, ParsedLogMessage, Sender, classify};
use srcbridge_rcon::CommandExecutor;

use crate::config::RouterSettings;
use crate::server::access::{AccessList, IdentityDirectory, UserHandle};
use crate::server::playtest::{PlaytestHooks, PlaytestPhase};
use crate::server::queue::PlayerQueue;
use crate::server::router::{CommandRouter, FeedbackSink, RouterDeps};

#[derive(Default)]
struct RecordingExecutor {
	calls: Mutex<Vec<String>>,
}

impl RecordingExecutor {
	fn commands(&self) -> Vec<String> {
		self.calls.lock().clone()
	}

	fn said(&self) -> Vec<String> {
		self.commands().into_iter().filter(|c| c.starts_with("say ")).collect()
	}

	fn non_say(&self) -> Vec<String> {
		self.commands().into_iter().filter(|c| !c.starts_with("say ")).collect()
	}
}

#[async_trait::async_trait]
impl CommandExecutor for RecordingExecutor {
	async fn execute(&self, _server: &ServerKey, command: &str) -> String {
		self.calls.lock().push(command.to_string());
		if command.starts_with("say ") {
			String::new()
		} else {
			format!("reply to {command}\nsecond line")
		}
	}
}

#[derive(Default)]
struct StaticIdentities {
	links: HashMap<SteamId, String>,
	authorized: HashSet<String>,
}

#[async_trait::async_trait]
impl IdentityDirectory for StaticIdentities {
	async fn resolve_linked_user(&self, steam_id: &SteamId) -> anyhow::Result<Option<UserHandle>> {
		Ok(self.links.get(steam_id).map(|id| UserHandle { id: id.clone() }))
	}

	async fn is_authorized(&self, user: &UserHandle) -> anyhow::Result<bool> {
		Ok(self.authorized.contains(&user.id))
	}
}

#[derive(Default)]
struct FakePlaytest {
	active: AtomicBool,
	phases: Mutex<Vec<PlaytestPhase>>,
}

#[async_trait::async_trait]
impl PlaytestHooks for FakePlaytest {
	async fn playtest_active(&self, _server: &ServerKey) -> bool {
		self.active.load(Ordering::SeqCst)
	}

	async fn run_phase(&self, _server: &ServerKey, phase: PlaytestPhase) -> anyhow::Result<String> {
		self.phases.lock().push(phase);
		Ok(format!("phase {phase} done"))
	}
}

#[derive(Default)]
struct RecordingSink {
	enabled: AtomicBool,
	fail: AtomicBool,
	entries: Mutex<Vec<(String, String)>>,
}

#[async_trait::async_trait]
impl FeedbackSink for RecordingSink {
	async fn record(&self, sender: &Sender, text: &str) -> anyhow::Result<bool> {
		if self.fail.load(Ordering::SeqCst) {
			anyhow::bail!("disk full");
		}
		if !self.enabled.load(Ordering::SeqCst) {
			return Ok(false);
		}
		self.entries.lock().push((sender.name.clone(), text.to_string()));
		Ok(true)
	}
}

struct Fixture {
	router: CommandRouter,
	executor: Arc<RecordingExecutor>,
	playtest: Arc<FakePlaytest>,
	sink: Arc<RecordingSink>,
	queue: Arc<PlayerQueue>,
}

const ADMIN: &str = "[U:1:100]";
const LINKED: &str = "STEAM_0:0:200";
const NOBODY: &str = "[U:1:300]";

fn fixture() -> Fixture {
	let executor = Arc::new(RecordingExecutor::default());
	let playtest = Arc::new(FakePlaytest::default());
	let sink = Arc::new(RecordingSink::default());
	let queue = Arc::new(PlayerQueue::new());
	let identities = StaticIdentities {
		links: HashMap::from([(SteamId::Player(400), "alice".to_string())]),
		authorized: HashSet::from(["alice".to_string()]),
	};

	let router = CommandRouter::new(
		RouterDeps {
			executor: executor.clone(),
			identities: Arc::new(identities),
			access: AccessList::new([SteamId::Player(100)]),
			playtest: playtest.clone(),
			feedback: sink.clone(),
			queue: queue.clone(),
		},
		RouterSettings {
			say_prefix: "[bridge]".to_string(),
			max_echo_chars: 20,
			public_commands: vec!["status".to_string()],
		},
	);

	Fixture {
		router,
		executor,
		playtest,
		sink,
		queue,
	}
}

fn msg(name: &str, id: &str, body: &str) -> ParsedLogMessage {
	classify(&format!(r#""{name}<7><{id}><Red>" say "{body}""#)).expect("classified")
}

fn server() -> ServerKey {
	ServerKey::new("pug-1").expect("key")
}

#[tokio::test]
async fn relay_from_allow_listed_sender_echoes_truncated_reply() {
	let f = fixture();
	f.router.route(&server(), &msg("Admin", ADMIN, ">r mp_timelimit 30")).await.expect("route");

	assert_eq!(f.executor.non_say(), vec!["mp_timelimit 30".to_string()]);
	let said = f.executor.said();
	assert_eq!(said.len(), 1);
	assert_eq!(said[0], "say \"[bridge] reply to mp_timel...\"");
}

#[tokio::test]
async fn relay_through_linked_user() {
	let f = fixture();
	f.router.route(&server(), &msg("Alice", LINKED, ">rcon status")).await.expect("route");
	assert_eq!(f.executor.non_say(), vec!["status".to_string()]);
}

#[tokio::test]
async fn relay_from_stranger_is_rejected() {
	let f = fixture();
	f.router.route(&server(), &msg("Rando", NOBODY, ">r quit")).await.expect("route");

	assert!(f.executor.non_say().is_empty());
	let said = f.executor.said();
	assert_eq!(said.len(), 1);
	assert!(said[0].contains("Rando is not allowed to use rcon"), "{said:?}");
}

#[tokio::test]
async fn playtest_requires_privilege_then_active_then_known_alias() {
	let f = fixture();

	f.router.route(&server(), &msg("Rando", NOBODY, ">p start")).await.expect("route");
	f.router.route(&server(), &msg("Admin", ADMIN, ">p start")).await.expect("route");
	assert!(f.playtest.phases.lock().is_empty());

	f.playtest.active.store(true, Ordering::SeqCst);
	f.router.route(&server(), &msg("Admin", ADMIN, ">p s")).await.expect("route");
	f.router.route(&server(), &msg("Admin", ADMIN, ">playtest nope")).await.expect("route");

	assert_eq!(*f.playtest.phases.lock(), vec![PlaytestPhase::Scramble]);
	let said = f.executor.said();
	assert_eq!(said.len(), 4);
	assert!(said[0].contains("not allowed"));
	assert!(said[1].contains("No playtest is running"));
	assert!(said[2].contains("phase scramble done"));
	assert!(said[3].contains("Unknown playtest action 'nope'"));
}

#[tokio::test]
async fn feedback_acknowledged_only_while_collecting() {
	let f = fixture();

	f.router.route(&server(), &msg("Scout", NOBODY, ">fb too dark")).await.expect("route");
	f.sink.enabled.store(true, Ordering::SeqCst);
	f.router.route(&server(), &msg("Scout", NOBODY, ">feedback more ammo")).await.expect("route");

	assert_eq!(
		*f.sink.entries.lock(),
		vec![("Scout".to_string(), "more ammo".to_string())]
	);
	let said = f.executor.said();
	assert!(said[0].contains("not being collected"));
	assert!(said[1].contains("Thanks Scout"));
}

#[tokio::test]
async fn feedback_sink_errors_surface_to_listener() {
	let f = fixture();
	f.sink.fail.store(true, Ordering::SeqCst);

	let res = f
		.router
		.on_message(&server(), msg("Scout", NOBODY, ">fb hello"))
		.await;
	assert!(res.is_err());
	assert!(f.executor.said()[0].contains("Could not record feedback"));
}

#[tokio::test]
async fn queue_join_and_leave() {
	let f = fixture();

	f.router.route(&server(), &msg("A", "[U:1:1]", ">join")).await.expect("route");
	f.router.route(&server(), &msg("B", "[U:1:2]", ">queue")).await.expect("route");
	f.router.route(&server(), &msg("A", "[U:1:1]", ">join")).await.expect("route");
	f.router.route(&server(), &msg("A", "[U:1:1]", ">leave")).await.expect("route");
	f.router.route(&server(), &msg("A", "[U:1:1]", ">unqueue")).await.expect("route");

	assert_eq!(f.queue.position(&SteamId::Player(2)), Some(1));
	let said = f.executor.said();
	assert!(said[0].contains("A joined the queue at position 1"));
	assert!(said[1].contains("B joined the queue at position 2"));
	assert!(said[2].contains("already queued at position 1"));
	assert!(said[3].contains("A left the queue"));
	assert!(said[4].contains("A is not in the queue"));
}

#[tokio::test]
async fn public_commands_checked_on_first_token() {
	let f = fixture();

	f.router.route(&server(), &msg("Rando", NOBODY, ">pub STATUS")).await.expect("route");
	f.router.route(&server(), &msg("Rando", NOBODY, ">pub quit")).await.expect("route");
	f.router.route(&server(), &msg("Rando", NOBODY, ">public")).await.expect("route");

	assert_eq!(f.executor.non_say(), vec!["STATUS".to_string()]);
	let said = f.executor.said();
	assert!(said[1].contains("'quit' is not a public command"));
	assert!(said[2].contains("Public commands: status"));
}

#[tokio::test]
async fn generic_usage_help_and_unknown() {
	let f = fixture();

	f.router.route(&server(), &msg("Admin", ADMIN, ">r")).await.expect("route");
	f.router.route(&server(), &msg("Admin", ADMIN, ">help")).await.expect("route");
	f.router.route(&server(), &msg("Admin", ADMIN, ">dance now")).await.expect("route");

	assert!(f.executor.non_say().is_empty());
	let said = f.executor.said();
	assert!(said[0].contains("Usage: >r"));
	assert!(said[1].contains(">fb"));
	assert!(said[2].contains("Unknown command 'dance'"));
}
