#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tally_domain::EventKind;
use tally_platform::UpstreamClient;
use tokio::time::Instant;

use crate::live::provisioner::{Provisioner, ProvisionerConfig, backoff_delay};
use crate::live::testutil::{FakeUpstream, bad_request_error, creds, rate_limit_error, store_with_tenant, tenant};

fn provisioner(upstream: &Arc<FakeUpstream>) -> Provisioner {
	Provisioner::new(Arc::clone(upstream) as Arc<dyn UpstreamClient>, ProvisionerConfig::default())
}

#[tokio::test(start_paused = true)]
async fn create_with_retry_backs_off_on_rate_limit_then_succeeds() {
	let upstream = Arc::new(FakeUpstream::new());
	upstream.push_create_failure(EventKind::StreamOnline, rate_limit_error());
	upstream.push_create_failure(EventKind::StreamOnline, rate_limit_error());

	let p = provisioner(&upstream);
	let t = tenant("t1");

	let start = Instant::now();
	let handle = p
		.create_with_retry(&t, &creds(), EventKind::StreamOnline, "sess-1")
		.await
		.expect("third attempt succeeds");

	assert_eq!(handle.kind, EventKind::StreamOnline);
	assert_eq!(upstream.create_calls.load(Ordering::SeqCst), 3);

	// 2s after the first failure, 4s after the second.
	assert!(start.elapsed() >= Duration::from_secs(6), "elapsed = {:?}", start.elapsed());
}

#[tokio::test(start_paused = true)]
async fn create_with_retry_gives_up_at_attempt_ceiling() {
	let upstream = Arc::new(FakeUpstream::new());
	for _ in 0..5 {
		upstream.push_create_failure(EventKind::Cheer, rate_limit_error());
	}

	let p = provisioner(&upstream);

	let err = p
		.create_with_retry(&tenant("t1"), &creds(), EventKind::Cheer, "sess-1")
		.await
		.expect_err("rate limit never clears");

	assert!(err.to_string().contains("channel.cheer"));
	assert_eq!(upstream.create_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn non_rate_limit_errors_fail_immediately() {
	let upstream = Arc::new(FakeUpstream::new());
	upstream.push_create_failure(EventKind::StreamOnline, bad_request_error());

	let p = provisioner(&upstream);

	let start = Instant::now();
	let result = p
		.create_with_retry(&tenant("t1"), &creds(), EventKind::StreamOnline, "sess-1")
		.await;

	assert!(result.is_err());
	assert_eq!(upstream.create_calls.load(Ordering::SeqCst), 1);
	assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn cleanup_deletes_stale_subscriptions_and_reverifies() {
	let upstream = Arc::new(FakeUpstream::new());
	upstream.add_remote_subscription("old-1", "stream.online", 1);
	upstream.add_remote_subscription("old-2", "channel.legacy_thing", 2);

	let p = provisioner(&upstream);
	p.cleanup_stale(&tenant("t1"), &creds()).await.expect("cleanup succeeds");

	let deleted = upstream.deleted.lock().clone();
	assert_eq!(deleted, vec!["old-1".to_string(), "old-2".to_string()]);

	// One list to discover, one to confirm the ceiling was freed.
	assert_eq!(upstream.list_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn provision_orders_core_first_and_honors_feature_flags() {
	let upstream = Arc::new(FakeUpstream::new());
	let t = tenant("t1");
	let store = store_with_tenant(&t);
	store.enable_feature(&t, "follow_alerts");

	let p = provisioner(&upstream);
	let handles = p.provision(&t, &creds(), "sess-1", &store).await.expect("provision");

	assert!(handles.contains_key(&EventKind::StreamOnline));
	assert!(handles.contains_key(&EventKind::StreamOffline));
	assert!(handles.contains_key(&EventKind::Follow));
	assert!(!handles.contains_key(&EventKind::Subscribe));
	assert!(!handles.contains_key(&EventKind::Cheer));
	assert!(!handles.contains_key(&EventKind::RedemptionAdd));
}

#[tokio::test(start_paused = true)]
async fn core_lifecycle_failure_fails_the_whole_provision() {
	let upstream = Arc::new(FakeUpstream::new());
	upstream.push_create_failure(EventKind::StreamOffline, bad_request_error());

	let t = tenant("t1");
	let store = store_with_tenant(&t);

	let p = provisioner(&upstream);
	let err = p
		.provision(&t, &creds(), "sess-1", &store)
		.await
		.expect_err("core kind failure is fatal");

	assert!(err.to_string().contains("stream.offline"));
}

#[tokio::test(start_paused = true)]
async fn exhausted_gated_kind_is_omitted_not_fatal() {
	let upstream = Arc::new(FakeUpstream::new());
	for _ in 0..3 {
		upstream.push_create_failure(EventKind::Cheer, rate_limit_error());
	}

	let t = tenant("t1");
	let store = store_with_tenant(&t);
	store.enable_feature(&t, "bit_alerts");
	store.enable_feature(&t, "sub_alerts");

	let p = provisioner(&upstream);
	let handles = p.provision(&t, &creds(), "sess-1", &store).await.expect("provision");

	assert!(handles.contains_key(&EventKind::StreamOnline));
	assert!(handles.contains_key(&EventKind::Subscribe));
	assert!(!handles.contains_key(&EventKind::Cheer), "rate-limited kind is omitted");
}

proptest::proptest! {
	#[test]
	fn backoff_delay_doubles_and_never_overflows(base_ms in 1u64..10_000, attempt in 0u32..64) {
		let base = Duration::from_millis(base_ms);
		let delay = backoff_delay(attempt, base);

		proptest::prop_assert!(delay >= base);
		if attempt < 16 {
			proptest::prop_assert_eq!(delay, base.saturating_mul(1 << attempt));
			if attempt > 0 {
				proptest::prop_assert!(delay >= backoff_delay(attempt - 1, base));
			}
		} else {
			proptest::prop_assert_eq!(delay, backoff_delay(16, base));
		}
	}
}
