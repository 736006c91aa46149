#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use proptest::prelude::*;

use super::*;

fn policy() -> SupervisorPolicy {
	SupervisorPolicy::new(&SupervisorConfig::default(), Duration::from_secs(180))
}

#[tokio::test(start_paused = true)]
async fn chat_outage_restarts_only_past_threshold() {
	let start = Instant::now();
	let mut health = ConnectionHealth::new(start);
	health.chat_connected = true;
	let p = policy();

	assert_eq!(evaluate(&mut health, false, true, &p, start), TickAction::Idle);
	assert_eq!(health.last_chat_change, start);
	assert_eq!(
		evaluate(&mut health, false, true, &p, start + Duration::from_secs(180)),
		TickAction::Idle
	);
	assert_eq!(
		evaluate(&mut health, false, true, &p, start + Duration::from_secs(181)),
		TickAction::ColdRestart
	);
}

#[tokio::test(start_paused = true)]
async fn event_session_backoff_grows_to_cap_and_resets_on_connect() {
	let start = Instant::now();
	let mut health = ConnectionHealth::new(start);
	let p = policy();

	let mut now = start;
	let mut backoffs = Vec::new();
	for _ in 0..12 {
		match evaluate(&mut health, true, false, &p, now) {
			TickAction::ReconnectEventSession { backoff } => backoffs.push(backoff.as_secs()),
			other => panic!("expected reconnect, got {other:?}"),
		}
		// Rate-limited just before the backoff elapses.
		let almost = now + health.event_sub_backoff - Duration::from_secs(1);
		assert_eq!(evaluate(&mut health, true, false, &p, almost), TickAction::Idle);
		now += health.event_sub_backoff;
	}
	assert_eq!(backoffs, vec![60, 120, 180, 240, 300, 360, 420, 480, 540, 600, 600, 600]);

	assert_eq!(evaluate(&mut health, true, true, &p, now), TickAction::Idle);
	assert_eq!(health.event_sub_backoff, Duration::ZERO);
	assert!(health.event_sub_connected);
}

#[tokio::test(start_paused = true)]
async fn connected_event_resets_backoff_immediately() {
	let mut health = ConnectionHealth::new(Instant::now());
	health.event_sub_backoff = Duration::from_secs(300);
	health.event_session_up();
	assert_eq!(health.event_sub_backoff, Duration::ZERO);
}

proptest! {
	#[test]
	fn attempt_intervals_are_non_decreasing_until_capped(
		step_secs in 1u64..120,
		cap_mult in 1u64..12,
		poll_secs in 1u64..30,
		ticks in 1usize..400,
	) {
		let cap = Duration::from_secs(step_secs * cap_mult);
		let p = SupervisorPolicy {
			force_reconnect_after: Duration::from_secs(180),
			backoff_step: Duration::from_secs(step_secs),
			backoff_cap: cap,
		};
		// Plain arithmetic on a fixed origin; no clock is read.
		let origin = std::time::Instant::now();
		let mut health = ConnectionHealth::new(Instant::from_std(origin));
		let mut attempts = Vec::new();
		for i in 0..ticks {
			let now = Instant::from_std(origin) + Duration::from_secs(poll_secs * i as u64);
			if let TickAction::ReconnectEventSession { backoff } = evaluate(&mut health, true, false, &p, now) {
				prop_assert!(backoff <= cap);
				attempts.push(now);
			}
		}

		let intervals: Vec<_> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
		for pair in intervals.windows(2) {
			prop_assert!(pair[0] <= pair[1]);
		}

		evaluate(&mut health, true, true, &p, Instant::from_std(origin) + Duration::from_secs(poll_secs * ticks as u64));
		prop_assert_eq!(health.event_sub_backoff, Duration::ZERO);
	}
}

struct FakeTarget {
	chat: AtomicBool,
	event: AtomicBool,
	heal_on_restart: bool,
	health: parking_lot::Mutex<ConnectionHealth>,
	restarts: AtomicU32,
	reconnects: AtomicU32,
}

impl FakeTarget {
	fn new(chat: bool, event: bool, heal_on_restart: bool) -> Arc<Self> {
		let mut health = ConnectionHealth::new(Instant::now());
		health.chat_connected = chat;
		health.event_sub_connected = event;
		Arc::new(Self {
			chat: AtomicBool::new(chat),
			event: AtomicBool::new(event),
			heal_on_restart,
			health: parking_lot::Mutex::new(health),
			restarts: AtomicU32::new(0),
			reconnects: AtomicU32::new(0),
		})
	}
}

#[async_trait::async_trait]
impl Supervised for FakeTarget {
	fn label(&self) -> String {
		"fake".to_string()
	}

	fn chat_connected(&self) -> bool {
		self.chat.load(Ordering::SeqCst)
	}

	fn event_session_connected(&self) -> bool {
		self.event.load(Ordering::SeqCst)
	}

	fn health(&self) -> &parking_lot::Mutex<ConnectionHealth> {
		&self.health
	}

	async fn cold_restart(&self) {
		self.restarts.fetch_add(1, Ordering::SeqCst);
		if self.heal_on_restart {
			self.chat.store(true, Ordering::SeqCst);
			self.event.store(true, Ordering::SeqCst);
		}
	}

	async fn reconnect_event_session(&self) {
		self.reconnects.fetch_add(1, Ordering::SeqCst);
	}
}

fn spawn_loop(target: Arc<FakeTarget>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		run_supervisor(target.as_ref(), &SupervisorConfig::default(), policy(), cancel).await;
	})
}

#[tokio::test(start_paused = true)]
async fn loop_backs_off_event_session_reconnects() {
	let target = FakeTarget::new(true, false, false);
	let cancel = CancellationToken::new();
	let handle = spawn_loop(Arc::clone(&target), cancel.clone());

	sleep(Duration::from_secs(59)).await;
	assert_eq!(target.reconnects.load(Ordering::SeqCst), 0, "warm-up");

	// Attempts at t=60, t=123 (60s later, on the 9s grid), t=249.
	sleep(Duration::from_secs(141)).await;
	assert_eq!(target.reconnects.load(Ordering::SeqCst), 2);
	sleep(Duration::from_secs(100)).await;
	assert_eq!(target.reconnects.load(Ordering::SeqCst), 3);
	assert_eq!(target.restarts.load(Ordering::SeqCst), 0);

	cancel.cancel();
	handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn loop_cold_restarts_once_when_restart_heals() {
	let target = FakeTarget::new(false, false, true);
	let cancel = CancellationToken::new();
	let handle = spawn_loop(Arc::clone(&target), cancel.clone());

	sleep(Duration::from_secs(180)).await;
	assert_eq!(target.restarts.load(Ordering::SeqCst), 0);
	sleep(Duration::from_secs(20)).await;
	assert_eq!(target.restarts.load(Ordering::SeqCst), 1);

	sleep(Duration::from_secs(600)).await;
	assert_eq!(target.restarts.load(Ordering::SeqCst), 1);
	assert_eq!(target.reconnects.load(Ordering::SeqCst), 0);
	assert_eq!(target.health.lock().event_sub_backoff, Duration::ZERO);

	cancel.cancel();
	handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_the_loop_during_warm_up() {
	let target = FakeTarget::new(true, true, false);
	let cancel = CancellationToken::new();
	let handle = spawn_loop(Arc::clone(&target), cancel.clone());

	cancel.cancel();
	cancel.cancel();
	tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
}
