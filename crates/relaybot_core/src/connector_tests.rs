#![forbid(unsafe_code)]

use std::sync::atomic::Ordering;

use relaybot_domain::UserRef;
use tokio::time::sleep;

use super::*;
use crate::config::ChannelSettings;
use crate::testing::{FakeApi, FakeFactory, RecordingSink, chat, identity, login, settle};

fn build(channel: &str, factory: &FakeFactory, api: &Arc<FakeApi>) -> Connector {
	Connector::new(
		identity(channel),
		ConnectorConfig::default(),
		Duration::from_secs(180),
		factory,
		Arc::clone(api) as Arc<dyn PlatformApi>,
	)
}

fn attach(connector: &Connector, id: &str, channel: &str) -> Arc<RecordingSink> {
	let sink = RecordingSink::new();
	attach_sink(connector, id, channel, Arc::clone(&sink));
	sink
}

fn attach_sink(connector: &Connector, id: &str, channel: &str, sink: Arc<RecordingSink>) {
	let entity = ConsumerEntity::new(ConsumerId::new(id).unwrap(), identity(channel), ChannelSettings::default(), sink);
	assert!(connector.add_consumer(Arc::new(entity)));
}

fn online(channel: &str, started_at: SystemTime) -> PlatformEvent {
	PlatformEvent::StreamOnline {
		channel: login(channel),
		started_at,
	}
}

fn offline(channel: &str) -> PlatformEvent {
	PlatformEvent::StreamOffline {
		channel: login(channel),
		occurred_at: SystemTime::now(),
	}
}

#[tokio::test(start_paused = true)]
async fn start_connects_both_transports_and_stop_closes_them() {
	let factory = FakeFactory::default();
	let api = FakeApi::with_users(&["one"]);
	let connector = build("one", &factory, &api);
	attach(&connector, "c1", "one");

	connector.start();
	connector.start();
	settle().await;

	assert!(connector.is_running());
	assert_eq!(factory.chat("one").connects.load(Ordering::SeqCst), 1);
	assert_eq!(factory.session("one").connects.load(Ordering::SeqCst), 1);
	let status = connector.status();
	assert!(status.chat_connected && status.event_session_connected);
	assert_eq!(status.consumers, 1);

	connector.stop().await;
	assert!(!connector.is_running());
	assert!(!factory.chat("one").is_connected());
	assert!(!factory.session("one").is_connected());
	assert_eq!(connector.consumer_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent_and_blocks_restart() {
	let factory = FakeFactory::default();
	let api = FakeApi::with_users(&["one"]);
	let connector = build("one", &factory, &api);
	connector.start();
	settle().await;

	tokio::join!(connector.stop(), connector.stop());
	connector.start();
	settle().await;

	assert!(!connector.is_running());
	assert_eq!(factory.chat("one").connects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_while_start_is_in_flight_leaves_nothing_running() {
	let factory = FakeFactory::default();
	let api = FakeApi::with_users(&["one"]);
	let connector = build("one", &factory, &api);
	attach(&connector, "c1", "one");

	connector.start();
	connector.stop().await;
	connector.stop().await;

	sleep(Duration::from_secs(10 * 60)).await;
	settle().await;

	assert!(!connector.is_running());
	assert!(!factory.chat("one").is_connected());
	assert!(!factory.session("one").is_connected());
	assert_eq!(connector.consumer_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn chat_is_routed_only_to_consumers_of_the_origin_channel() {
	let factory = FakeFactory::default();
	let api = FakeApi::with_users(&["one"]);
	let connector = build("one", &factory, &api);
	let mine = attach(&connector, "mine", "one");
	connector.start();
	settle().await;

	let chat_link = factory.chat("one");
	chat_link.inject(ChatEvent::Message(chat("one", "u1", "Viewer", "!hug"))).await;
	chat_link.inject(ChatEvent::Message(chat("two", "u2", "Elsewhere", "!hug"))).await;
	chat_link.inject(ChatEvent::Message(chat("one", "u1", "Viewer", "!hug"))).await;
	settle().await;

	assert_eq!(mine.commands.lock().len(), 2);
	assert_eq!(mine.count(HookKind::UserIntro), 1);
	assert!(mine.commands.lock().iter().all(|c| c.author.id == "u1"));
	assert_eq!(connector.consumer(&ConsumerId::new("mine").unwrap()).map(|c| c.active_chatters().len()), Some(1));

	connector.stop().await;
}

#[tokio::test(start_paused = true)]
async fn fresh_online_fires_both_hooks_and_enriches_metadata() {
	let factory = FakeFactory::default();
	let api = FakeApi::with_users(&["one"]);
	let started_at = SystemTime::now();
	api.set_live("one", "Speedrun", "Retro", started_at);
	let connector = build("one", &factory, &api);
	let sink = attach(&connector, "c1", "one");
	connector.start();
	settle().await;

	let session = factory.session("one");
	session.inject(online("one", started_at)).await;
	session.inject(online("one", started_at)).await;
	settle().await;

	let starts = sink.calls(HookKind::StreamStart);
	assert_eq!(starts.len(), 1, "duplicate online must be ignored");
	assert_eq!(starts[0][..3], ["one".to_string(), "Speedrun".to_string(), "Retro".to_string()]);
	assert_eq!(sink.count(HookKind::StreamStartOneShot), 1);
	assert!(connector.stream_state().is_online);

	connector.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stale_transitions_skip_one_shot_hooks() {
	let factory = FakeFactory::default();
	let api = FakeApi::with_users(&["one"]);
	let connector = build("one", &factory, &api);
	let sink = attach(&connector, "c1", "one");
	connector.start();
	settle().await;

	let session = factory.session("one");
	session
		.inject(online("one", SystemTime::now() - Duration::from_secs(20 * 60)))
		.await;
	settle().await;
	assert_eq!(sink.count(HookKind::StreamStart), 1);
	assert_eq!(sink.count(HookKind::StreamStartOneShot), 0);

	session
		.inject(PlatformEvent::StreamOffline {
			channel: login("one"),
			occurred_at: SystemTime::now() - Duration::from_secs(11 * 60),
		})
		.await;
	settle().await;
	assert_eq!(sink.count(HookKind::StreamEnd), 1);
	assert_eq!(sink.count(HookKind::StreamEndOneShot), 0);

	connector.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stream_start_resets_introductions() {
	let factory = FakeFactory::default();
	let api = FakeApi::with_users(&["one"]);
	let connector = build("one", &factory, &api);
	let sink = attach(&connector, "c1", "one");
	connector.start();
	settle().await;

	let chat_link = factory.chat("one");
	let session = factory.session("one");
	chat_link.inject(ChatEvent::Message(chat("one", "u1", "Viewer", "hi"))).await;
	settle().await;
	session.inject(online("one", SystemTime::now())).await;
	settle().await;
	chat_link.inject(ChatEvent::Message(chat("one", "u1", "Viewer", "hi"))).await;
	settle().await;

	assert_eq!(sink.count(HookKind::UserIntro), 2);
	connector.stop().await;
}

#[tokio::test(start_paused = true)]
async fn live_loop_delivers_reward_ticks_until_offline() {
	let factory = FakeFactory::default();
	let api = FakeApi::with_users(&["one"]);
	*api.chatters.lock() = Some(vec!["u1".to_string(), "u3".to_string()]);
	let connector = build("one", &factory, &api);
	let sink = attach(&connector, "c1", "one");
	connector.start();
	settle().await;

	let chat_link = factory.chat("one");
	let session = factory.session("one");
	session.inject(online("one", SystemTime::now())).await;
	chat_link.inject(ChatEvent::Message(chat("one", "u1", "Present", "hi"))).await;
	chat_link.inject(ChatEvent::Message(chat("one", "u2", "Lurker", "hi"))).await;
	settle().await;

	sleep(Duration::from_secs(5 * 60)).await;
	settle().await;
	{
		let ticks = sink.ticks.lock();
		assert_eq!(ticks.len(), 1);
		assert_eq!(ticks[0].amount_for("u1"), Some(2));
		assert_eq!(ticks[0].amount_for("u2"), Some(2));
		assert_eq!(ticks[0].amount_for("u3"), Some(1));
		assert_eq!(ticks[0].amount_for("one-id"), Some(1));
	}

	// A failed chatter lookup still rewards the active chatters.
	*api.chatters.lock() = None;
	sleep(Duration::from_secs(5 * 60)).await;
	settle().await;
	{
		let ticks = sink.ticks.lock();
		assert_eq!(ticks[1].amount_for("u2"), Some(2));
		assert_eq!(ticks[1].amount_for("u3"), None);
	}

	session.inject(offline("one")).await;
	settle().await;
	sleep(Duration::from_secs(15 * 60)).await;
	assert_eq!(sink.ticks.lock().len(), 2);
	assert_eq!(sink.count(HookKind::StreamEnd), 1);
	assert_eq!(sink.count(HookKind::StreamEndOneShot), 1);

	connector.stop().await;
}

#[tokio::test(start_paused = true)]
async fn follows_raids_and_bans_reach_consumers() {
	let factory = FakeFactory::default();
	let api = FakeApi::with_users(&["one"]);
	let connector = build("one", &factory, &api);
	let sink = attach(&connector, "c1", "one");
	connector.start();
	settle().await;

	let session = factory.session("one");
	let fan = UserRef::new("u5", "fan");
	for _ in 0..2 {
		session
			.inject(PlatformEvent::Follow {
				channel: login("one"),
				user: fan.clone(),
				followed_at: SystemTime::now(),
			})
			.await;
	}
	session
		.inject(PlatformEvent::Raid {
			channel: login("one"),
			from: UserRef::new("r1", "raider").with_display("Raider"),
			viewers: 42,
		})
		.await;

	factory
		.chat("one")
		.inject(ChatEvent::Message(chat("one", "troll", "Troll", "spam")))
		.await;
	settle().await;
	let consumer = connector.consumer(&ConsumerId::new("c1").unwrap()).unwrap();
	assert_eq!(consumer.active_chatters().len(), 1);

	session
		.inject(PlatformEvent::Ban {
			channel: login("one"),
			user: UserRef::new("troll", "troll"),
			moderator: UserRef::new("m", "mod"),
			reason: Some("spam".to_string()),
			permanent: true,
		})
		.await;
	settle().await;

	assert_eq!(sink.count(HookKind::Follow), 1);
	assert_eq!(consumer.follower_count(), 1);
	assert_eq!(
		sink.calls(HookKind::Raid),
		vec![vec!["raider".to_string(), "Raider".to_string(), "42".to_string()]]
	);
	assert!(consumer.active_chatters().is_empty());

	connector.stop().await;
}

#[tokio::test(start_paused = true)]
async fn events_for_other_channels_are_ignored() {
	let factory = FakeFactory::default();
	let api = FakeApi::with_users(&["one"]);
	let connector = build("one", &factory, &api);
	let sink = attach(&connector, "c1", "one");
	connector.start();
	settle().await;

	factory.session("one").inject(online("two", SystemTime::now())).await;
	settle().await;

	assert_eq!(sink.count(HookKind::StreamStart), 0);
	assert!(!connector.stream_state().is_online);
	connector.stop().await;
}

#[tokio::test(start_paused = true)]
async fn channel_update_always_notifies_but_monitor_only_on_change() {
	let factory = FakeFactory::default();
	let api = FakeApi::with_users(&["one"]);
	let connector = build("one", &factory, &api);
	let sink = attach(&connector, "c1", "one");
	connector.start();
	settle().await;

	let session = factory.session("one");
	let update = || PlatformEvent::ChannelUpdate {
		channel: login("one"),
		title: "t".to_string(),
		category: "c".to_string(),
	};
	session.inject(update()).await;
	settle().await;
	assert_eq!(sink.count(HookKind::StreamUpdate), 0, "offline updates only cache");

	let info = StreamInfo {
		user_id: "one-id".to_string(),
		user_login: "one".to_string(),
		title: "t".to_string(),
		category: "c".to_string(),
		started_at: SystemTime::now(),
		viewer_count: 3,
	};
	connector.observe_live(&info).await;
	assert_eq!(sink.count(HookKind::StreamStart), 1);

	session.inject(update()).await;
	settle().await;
	assert_eq!(sink.count(HookKind::StreamUpdate), 1);

	connector.observe_live(&info).await;
	assert_eq!(sink.count(HookKind::StreamUpdate), 1);
	connector
		.observe_live(&StreamInfo {
			title: "new".to_string(),
			..info.clone()
		})
		.await;
	assert_eq!(sink.calls(HookKind::StreamUpdate)[1], vec!["one", "new", "c"]);

	connector.observe_offline(SystemTime::now()).await;
	connector.observe_offline(SystemTime::now()).await;
	assert_eq!(sink.count(HookKind::StreamEnd), 1);

	connector.stop().await;
}

#[tokio::test(start_paused = true)]
async fn failing_consumer_does_not_block_others() {
	let factory = FakeFactory::default();
	let api = FakeApi::with_users(&["one"]);
	let connector = build("one", &factory, &api);
	let bad = RecordingSink::failing();
	attach_sink(&connector, "bad", "one", Arc::clone(&bad));
	let good = attach(&connector, "good", "one");
	connector.start();
	settle().await;

	factory.session("one").inject(online("one", SystemTime::now())).await;
	settle().await;

	assert_eq!(bad.count(HookKind::StreamStart), 1);
	assert_eq!(good.count(HookKind::StreamStart), 1);
	assert_eq!(good.count(HookKind::StreamStartOneShot), 1);
	connector.stop().await;
}

#[tokio::test(start_paused = true)]
async fn supervisor_reconnects_event_session_and_resets_backoff() {
	let factory = FakeFactory::default();
	let api = FakeApi::with_users(&["one"]);
	let connector = build("one", &factory, &api);
	connector.start();
	settle().await;

	let session = factory.session("one");
	session.drop_link();
	session
		.emit(SessionEvent::Disconnected {
			reason: "closed".to_string(),
		})
		.await;
	settle().await;
	assert!(!connector.health().event_sub_connected);

	sleep(Duration::from_secs(61)).await;
	settle().await;

	assert_eq!(session.reconnects.load(Ordering::SeqCst), 1);
	let health = connector.health();
	assert!(health.event_sub_connected);
	assert_eq!(health.event_sub_backoff, Duration::ZERO);
	assert_eq!(factory.chat("one").disconnects.load(Ordering::SeqCst), 0);

	connector.stop().await;
}

#[tokio::test(start_paused = true)]
async fn long_chat_outage_triggers_cold_restart() {
	let factory = FakeFactory::default();
	let api = FakeApi::with_users(&["one"]);
	let connector = build("one", &factory, &api);
	connector.start();
	settle().await;

	let chat_link = factory.chat("one");
	chat_link.drop_link();
	sleep(Duration::from_secs(170)).await;
	assert_eq!(chat_link.connects.load(Ordering::SeqCst), 1);

	sleep(Duration::from_secs(30)).await;
	settle().await;
	assert_eq!(chat_link.connects.load(Ordering::SeqCst), 2);
	assert_eq!(factory.session("one").connects.load(Ordering::SeqCst), 2);
	assert!(chat_link.is_connected());

	connector.stop().await;
}

#[tokio::test(start_paused = true)]
async fn send_chat_and_announce_use_the_channel() {
	let factory = FakeFactory::default();
	let api = FakeApi::with_users(&["one"]);
	let connector = build("one", &factory, &api);

	connector.send_chat(ChatTarget::Channel, "hello").await.unwrap();
	connector.announce("we are live").await.unwrap();

	assert_eq!(
		factory.chat("one").sent.lock().as_slice(),
		&[(ChatTarget::Channel, "hello".to_string())]
	);
	assert_eq!(
		api.announcements.lock().as_slice(),
		&[("one-id".to_string(), "we are live".to_string())]
	);
}
