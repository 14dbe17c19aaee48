#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime};

use tally_domain::{EventKind, LifecycleState, TenantId};
use tally_platform::{SessionMessage, UpstreamClient, UpstreamEvent};
use tokio::time::advance;

use crate::hub::{TenantHub, TenantHubConfig};
use crate::live::reconciler::PendingState;
use crate::live::registry::{ConnectionRegistry, RegistryConfig};
use crate::live::testutil::{FakeUpstream, RecordingNotifier, bad_request_error, creds, tenant, wait_until};
use crate::notify::Notifier;
use crate::store::memory::MemoryTenantStore;
use crate::store::{Tenant, TenantStore};

struct Fixture {
	store: Arc<MemoryTenantStore>,
	upstream: Arc<FakeUpstream>,
	notifier: Arc<RecordingNotifier>,
	registry: Arc<ConnectionRegistry>,
}

fn add_tenant(store: &MemoryTenantStore, id: &TenantId) {
	store.insert_tenant(Tenant {
		id: id.clone(),
		display_name: format!("Tenant {id}"),
		credentials: creds(),
	});
}

fn fixture_with(store: MemoryTenantStore) -> Fixture {
	let store = Arc::new(store);
	let upstream = Arc::new(FakeUpstream::new());
	let notifier = Arc::new(RecordingNotifier::new());
	let hub = TenantHub::new(TenantHubConfig::default());

	let cfg = RegistryConfig {
		restart_delay: Duration::from_millis(100),
		..RegistryConfig::default()
	};

	let registry = ConnectionRegistry::start(
		cfg,
		Arc::clone(&store) as Arc<dyn TenantStore>,
		Arc::clone(&upstream) as Arc<dyn UpstreamClient>,
		Arc::clone(&notifier) as Arc<dyn Notifier>,
		hub,
	);

	Fixture {
		store,
		upstream,
		notifier,
		registry,
	}
}

fn fixture(id: &TenantId) -> Fixture {
	let store = MemoryTenantStore::new();
	add_tenant(&store, id);
	fixture_with(store)
}

fn online(stream_id: &str) -> SessionMessage {
	SessionMessage::Event(UpstreamEvent::StreamOnline {
		stream_id: tally_domain::StreamId::new(stream_id.to_string()).expect("valid stream id"),
		started_at: SystemTime::now(),
	})
}

#[tokio::test(start_paused = true)]
async fn concurrent_subscribes_provision_exactly_one_session() {
	let t = tenant("t1");
	let fx = fixture(&t);

	let (a, b) = tokio::join!(fx.registry.subscribe(&t), fx.registry.subscribe(&t));
	a.expect("first subscribe");
	b.expect("second subscribe treated as no-op");

	assert_eq!(fx.upstream.open_session_calls.load(Ordering::SeqCst), 1);

	let status = fx.registry.status(&t).await.expect("slot exists");
	assert_eq!(status.lifecycle, LifecycleState::Active);
}

#[tokio::test(start_paused = true)]
async fn subscribe_while_active_is_a_no_op() {
	let t = tenant("t1");
	let fx = fixture(&t);

	fx.registry.subscribe(&t).await.expect("subscribe");
	fx.registry.subscribe(&t).await.expect("repeat subscribe");

	assert_eq!(fx.upstream.open_session_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn unknown_tenant_fails_and_stays_disconnected() {
	let t = tenant("ghost");
	let fx = fixture_with(MemoryTenantStore::new());

	let err = fx.registry.subscribe(&t).await.expect_err("no credentials");
	assert!(err.to_string().contains("unknown tenant"));

	let status = fx.registry.status(&t).await.expect("slot exists");
	assert_eq!(status.lifecycle, LifecycleState::Disconnected);
	assert_eq!(fx.upstream.open_session_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn provisioning_failure_leaves_tenant_disconnected() {
	let t = tenant("t1");
	let fx = fixture(&t);
	fx.upstream.push_create_failure(EventKind::StreamOnline, bad_request_error());

	fx.registry.subscribe(&t).await.expect_err("core provisioning fails");

	let status = fx.registry.status(&t).await.expect("slot exists");
	assert_eq!(status.lifecycle, LifecycleState::Disconnected);
	assert!(status.active_kinds.is_empty());
}

#[tokio::test(start_paused = true)]
async fn manual_unsubscribe_is_idempotent() {
	let t = tenant("t1");
	let fx = fixture(&t);

	fx.registry.subscribe(&t).await.expect("subscribe");
	fx.registry.unsubscribe(&t, true).await.expect("stop");

	let deletes_after_first = fx.upstream.deleted.lock().len();
	assert!(deletes_after_first > 0, "teardown deletes provisioned subscriptions");
	assert!(fx.registry.status(&t).await.is_none(), "manual stop removes the entry");

	fx.registry.unsubscribe(&t, true).await.expect("second stop is a no-op");
	assert_eq!(fx.upstream.deleted.lock().len(), deletes_after_first, "no duplicate cleanup");
}

#[tokio::test(start_paused = true)]
async fn manual_stop_clears_dedup_but_automatic_teardown_preserves_it() {
	let t = tenant("t1");
	let fx = fixture(&t);

	fx.registry.subscribe(&t).await.expect("subscribe");
	fx.upstream.latest_session().send(online("s-1")).await.unwrap();

	let notifier = Arc::clone(&fx.notifier);
	wait_until(move || notifier.sent_count() == 1).await;
	assert_eq!(
		fx.store.get_notified_stream_id(&t).await.unwrap().unwrap().as_str(),
		"s-1"
	);

	// Automatic teardown keeps the dedup record.
	fx.registry.unsubscribe(&t, false).await.expect("automatic teardown");
	let status = fx.registry.status(&t).await.expect("entry kept for reconnect");
	assert_eq!(status.lifecycle, LifecycleState::Reconnecting);
	assert!(fx.store.get_notified_stream_id(&t).await.unwrap().is_some());

	// Reconnect replays the same stream id: suppressed.
	fx.registry.subscribe(&t).await.expect("resubscribe");
	fx.upstream.latest_session().send(online("s-1")).await.unwrap();

	let registry = Arc::clone(&fx.registry);
	let t2 = t.clone();
	wait_until(move || registry.pending_state(&t2) == Some(PendingState::Suppressed)).await;
	assert_eq!(fx.notifier.sent_count(), 1, "no duplicate notification across reconnect");

	// Manual stop wipes the record.
	fx.registry.unsubscribe(&t, true).await.expect("manual stop");
	assert!(fx.store.get_notified_stream_id(&t).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn watchdog_silence_triggers_one_recycle_and_dedup_survives() {
	let t = tenant("t1");
	let fx = fixture(&t);
	*fx.upstream.keepalive_timeout.lock() = Duration::from_secs(30);

	fx.registry.subscribe(&t).await.expect("subscribe");
	fx.upstream.latest_session().send(online("s-1")).await.unwrap();

	let notifier = Arc::clone(&fx.notifier);
	wait_until(move || notifier.sent_count() == 1).await;

	// Silence past keepalive + grace: the watchdog recycles the session.
	advance(Duration::from_secs(36)).await;

	let upstream = Arc::clone(&fx.upstream);
	wait_until(move || upstream.open_session_calls.load(Ordering::SeqCst) == 2).await;

	let status = fx.registry.status(&t).await.expect("slot exists");
	assert_eq!(status.lifecycle, LifecycleState::Active);

	// Dedup state is unchanged across the automatic cycle.
	assert_eq!(
		fx.store.get_notified_stream_id(&t).await.unwrap().unwrap().as_str(),
		"s-1"
	);

	fx.upstream.latest_session().send(online("s-1")).await.unwrap();
	let registry = Arc::clone(&fx.registry);
	let t2 = t.clone();
	wait_until(move || registry.pending_state(&t2) == Some(PendingState::Suppressed)).await;
	assert_eq!(fx.notifier.sent_count(), 1, "reconnect inside the same live session stays quiet");
	assert_eq!(fx.upstream.open_session_calls.load(Ordering::SeqCst), 2, "exactly one recycle");
}

#[tokio::test(start_paused = true)]
async fn force_reconnect_cycles_the_session() {
	let t = tenant("t1");
	let fx = fixture(&t);

	fx.registry.subscribe(&t).await.expect("subscribe");
	fx.registry.force_reconnect(&t).await.expect("force reconnect");

	assert_eq!(fx.upstream.open_session_calls.load(Ordering::SeqCst), 2);
	let status = fx.registry.status(&t).await.expect("slot exists");
	assert_eq!(status.lifecycle, LifecycleState::Active);
}

#[tokio::test(start_paused = true)]
async fn status_all_reports_every_known_tenant() {
	let t1 = tenant("alpha");
	let t2 = tenant("beta");
	let store = MemoryTenantStore::new();
	add_tenant(&store, &t1);
	add_tenant(&store, &t2);
	let fx = fixture_with(store);

	fx.registry.subscribe(&t2).await.expect("subscribe beta");
	fx.registry.subscribe(&t1).await.expect("subscribe alpha");

	let all = fx.registry.status_all().await;
	assert_eq!(all.len(), 2);
	assert_eq!(all[0].tenant, t1, "snapshots are sorted by tenant id");
	assert_eq!(all[1].tenant, t2);

	for snapshot in &all {
		assert_eq!(snapshot.lifecycle, LifecycleState::Active);
		assert!(snapshot.active_kinds.contains(&EventKind::StreamOnline));
		assert!(snapshot.active_kinds.contains(&EventKind::StreamOffline));
		assert!(snapshot.session_id.is_some());
	}
}

#[tokio::test(start_paused = true)]
async fn reset_stream_state_unsticks_the_dedup_record() {
	let t = tenant("t1");
	let fx = fixture(&t);

	fx.registry.subscribe(&t).await.expect("subscribe");
	fx.upstream.latest_session().send(online("s-1")).await.unwrap();
	let notifier = Arc::clone(&fx.notifier);
	wait_until(move || notifier.sent_count() == 1).await;

	fx.registry.reset_stream_state(&t).await.expect("reset");
	assert!(fx.store.get_notified_stream_id(&t).await.unwrap().is_none());

	fx.upstream.latest_session().send(online("s-1")).await.unwrap();
	let notifier = Arc::clone(&fx.notifier);
	wait_until(move || notifier.sent_count() == 2).await;
}
