#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::SystemTime;

use tally_domain::{SessionStatus, StreamId};
use tally_platform::{ChannelInfo, StreamInfo, UpstreamClient};

use crate::hub::{HubItem, TenantHub, TenantHubConfig};
use crate::live::reconciler::{PendingState, Reconciler, ReconcilerConfig};
use crate::live::testutil::{FakeUpstream, RecordingNotifier, bad_request_error, creds, store_with_tenant, tenant};
use crate::notify::Notifier;
use crate::store::TenantStore;
use crate::store::memory::MemoryTenantStore;

struct Fixture {
	store: Arc<MemoryTenantStore>,
	upstream: Arc<FakeUpstream>,
	notifier: Arc<RecordingNotifier>,
	hub: TenantHub,
	reconciler: Reconciler,
}

fn fixture(tenant_id: &tally_domain::TenantId) -> Fixture {
	let store = Arc::new(store_with_tenant(tenant_id));
	let upstream = Arc::new(FakeUpstream::new());
	let notifier = Arc::new(RecordingNotifier::new());
	let hub = TenantHub::new(TenantHubConfig::default());

	let reconciler = Reconciler::new(
		Arc::clone(&store) as Arc<dyn TenantStore>,
		Arc::clone(&upstream) as Arc<dyn UpstreamClient>,
		Arc::clone(&notifier) as Arc<dyn Notifier>,
		hub.clone(),
		ReconcilerConfig::default(),
	);

	Fixture {
		store,
		upstream,
		notifier,
		hub,
		reconciler,
	}
}

fn stream(id: &str) -> StreamId {
	StreamId::new(id.to_string()).expect("valid stream id")
}

#[tokio::test]
async fn new_stream_dispatches_one_notification_with_fetched_metadata() {
	let t = tenant("T1");
	let fx = fixture(&t);

	*fx.upstream.channel_info.lock() = ChannelInfo {
		title: "Dark Souls".to_string(),
		category: "Gaming".to_string(),
	};
	*fx.upstream.stream_info.lock() = Some(StreamInfo {
		viewer_count: 42,
		thumbnail_url: Some("https://cdn.example/shot.jpg".to_string()),
	});

	fx.reconciler
		.handle_stream_online(&t, &creds(), stream("abc123"), SystemTime::now())
		.await
		.expect("reconcile");

	let sent = fx.notifier.sent.lock();
	assert_eq!(sent.len(), 1);
	let (to, n) = &sent[0];
	assert_eq!(to, &t);
	assert_eq!(n.stream_id, "abc123");
	assert_eq!(n.title, "Dark Souls");
	assert_eq!(n.category, "Gaming");
	assert_eq!(n.viewer_count, 42);
	drop(sent);

	assert_eq!(fx.store.get_notified_stream_id(&t).await.unwrap(), Some(stream("abc123")));
	let live = fx.store.get_live_state(&t).await.unwrap();
	assert!(live.active);
	assert_eq!(live.stream_id, Some(stream("abc123")));
}

#[tokio::test]
async fn reconnect_with_same_stream_id_is_suppressed() {
	let t = tenant("T1");
	let fx = fixture(&t);

	fx.reconciler
		.handle_stream_online(&t, &creds(), stream("abc123"), SystemTime::now())
		.await
		.unwrap();
	assert_eq!(fx.notifier.sent_count(), 1);

	// Reconnect inside the same live session replays the same stream id.
	fx.reconciler
		.handle_stream_online(&t, &creds(), stream("abc123"), SystemTime::now())
		.await
		.unwrap();

	assert_eq!(fx.notifier.sent_count(), 1, "no additional notification");
	assert_eq!(fx.reconciler.pending_state(&t), Some(PendingState::Suppressed));

	// The dedup check runs before any metadata fetch.
	assert_eq!(fx.upstream.channel_info_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn metadata_fetch_failure_falls_back_to_defaults_after_one_retry() {
	let t = tenant("T1");
	let fx = fixture(&t);

	fx.upstream.push_channel_info_failure(bad_request_error());
	fx.upstream.push_channel_info_failure(bad_request_error());

	fx.reconciler
		.handle_stream_online(&t, &creds(), stream("xyz"), SystemTime::now())
		.await
		.unwrap();

	assert_eq!(fx.upstream.channel_info_calls.load(Ordering::SeqCst), 2, "one retry");

	let sent = fx.notifier.sent.lock();
	assert_eq!(sent.len(), 1);
	assert_eq!(sent[0].1.title, "Untitled stream");
	assert_eq!(sent[0].1.category, "Unknown");
	assert_eq!(sent[0].1.viewer_count, 0);
	assert_eq!(sent[0].1.thumbnail_url, None);
}

#[tokio::test]
async fn stream_offline_clears_live_flag_so_next_start_is_new() {
	let t = tenant("T1");
	let fx = fixture(&t);

	fx.reconciler
		.handle_stream_online(&t, &creds(), stream("s-1"), SystemTime::now())
		.await
		.unwrap();
	assert!(fx.store.get_live_state(&t).await.unwrap().active);

	fx.reconciler.handle_stream_offline(&t).await.unwrap();
	let live = fx.store.get_live_state(&t).await.unwrap();
	assert!(!live.active);

	fx.reconciler
		.handle_stream_online(&t, &creds(), stream("s-2"), SystemTime::now())
		.await
		.unwrap();
	assert_eq!(fx.notifier.sent_count(), 2, "new stream id notifies again");
}

#[tokio::test]
async fn notifier_failure_is_surfaced_as_status_and_not_retried() {
	let t = tenant("T1");
	let fx = fixture(&t);
	let mut items = fx.hub.subscribe_tenant(t.clone()).await;

	fx.notifier.fail.store(true, Ordering::SeqCst);

	fx.reconciler
		.handle_stream_online(&t, &creds(), stream("s-1"), SystemTime::now())
		.await
		.unwrap();

	assert_eq!(fx.notifier.sent_count(), 0);

	// Dedup still recorded: the dispatch attempt was this session's one shot.
	assert_eq!(fx.store.get_notified_stream_id(&t).await.unwrap(), Some(stream("s-1")));

	let mut statuses = Vec::new();
	while let Ok(item) = items.try_recv() {
		if let HubItem::Status { status, .. } = item {
			statuses.push(status);
		}
	}
	assert_eq!(statuses, vec![SessionStatus::Pending, SessionStatus::Failed]);
}

#[tokio::test]
async fn successful_dispatch_publishes_pending_then_sent() {
	let t = tenant("T1");
	let fx = fixture(&t);
	let mut items = fx.hub.subscribe_tenant(t.clone()).await;

	fx.reconciler
		.handle_stream_online(&t, &creds(), stream("s-1"), SystemTime::now())
		.await
		.unwrap();

	let mut statuses = Vec::new();
	while let Ok(item) = items.try_recv() {
		if let HubItem::Status { status, .. } = item {
			statuses.push(status);
		}
	}
	assert_eq!(statuses, vec![SessionStatus::Pending, SessionStatus::Sent]);
}

#[tokio::test]
async fn reset_stream_state_clears_dedup_and_live_records() {
	let t = tenant("T1");
	let fx = fixture(&t);

	fx.reconciler
		.handle_stream_online(&t, &creds(), stream("s-1"), SystemTime::now())
		.await
		.unwrap();

	fx.reconciler.reset_stream_state(&t).await.unwrap();

	assert_eq!(fx.store.get_notified_stream_id(&t).await.unwrap(), None);
	assert!(!fx.store.get_live_state(&t).await.unwrap().active);
	assert_eq!(fx.reconciler.pending_state(&t), None);

	// The next start with the old id is treated as brand new.
	fx.reconciler
		.handle_stream_online(&t, &creds(), stream("s-1"), SystemTime::now())
		.await
		.unwrap();
	assert_eq!(fx.notifier.sent_count(), 2);
}
