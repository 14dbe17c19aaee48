#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tally_domain::{EventKind, TenantId};
use tally_platform::{
	ChannelInfo, EventSession, RemoteSubscription, SecretString, SessionCloseHandle, SessionMessage, SessionMessageTx,
	StreamInfo, SubscriptionHandle, TenantCredentials, UpstreamClient,
};
use tokio::sync::{mpsc, oneshot};

use crate::notify::{Notifier, SessionStartNotification};
use crate::store::{Tenant, memory::MemoryTenantStore};

pub(crate) fn tenant(id: &str) -> TenantId {
	TenantId::new(id.to_string()).expect("valid tenant id")
}

pub(crate) fn creds() -> TenantCredentials {
	TenantCredentials {
		client_id: "client-id".to_string(),
		user_access_token: SecretString::new("token"),
		broadcaster_user_id: "b-1".to_string(),
	}
}

pub(crate) fn store_with_tenant(id: &TenantId) -> MemoryTenantStore {
	let store = MemoryTenantStore::new();
	store.insert_tenant(Tenant {
		id: id.clone(),
		display_name: format!("Tenant {id}"),
		credentials: creds(),
	});
	store
}

/// Scripted error that categorizes as a rate limit.
pub(crate) fn rate_limit_error() -> anyhow::Error {
	anyhow::anyhow!("helix create subscription rate limit: status=429 Too Many Requests body={{}}")
}

/// Scripted error that categorizes as a client bug (never retried).
pub(crate) fn bad_request_error() -> anyhow::Error {
	anyhow::anyhow!("helix create subscription failed: status=400 Bad Request body={{}}")
}

/// In-process [`UpstreamClient`] double with per-kind scripted failures and
/// handles to feed messages into opened sessions.
pub(crate) struct FakeUpstream {
	pub open_session_calls: AtomicUsize,
	pub create_calls: AtomicUsize,
	pub list_calls: AtomicUsize,
	pub channel_info_calls: AtomicUsize,
	pub deleted: Mutex<Vec<String>>,

	/// Subscriptions reported by the first list call; deletes remove them.
	pub remote: Mutex<Vec<RemoteSubscription>>,

	/// Errors popped per create call for a kind; empty means success.
	pub create_failures: Mutex<HashMap<EventKind, VecDeque<anyhow::Error>>>,

	/// Errors popped per channel-info call; empty means success.
	pub channel_info_failures: Mutex<VecDeque<anyhow::Error>>,

	pub channel_info: Mutex<ChannelInfo>,
	pub stream_info: Mutex<Option<StreamInfo>>,

	pub keepalive_timeout: Mutex<Duration>,

	/// Senders for every session opened, oldest first.
	pub sessions: Mutex<Vec<SessionMessageTx>>,

	next_subscription_id: AtomicUsize,
}

impl FakeUpstream {
	pub(crate) fn new() -> Self {
		Self {
			open_session_calls: AtomicUsize::new(0),
			create_calls: AtomicUsize::new(0),
			list_calls: AtomicUsize::new(0),
			channel_info_calls: AtomicUsize::new(0),
			deleted: Mutex::new(Vec::new()),
			remote: Mutex::new(Vec::new()),
			create_failures: Mutex::new(HashMap::new()),
			channel_info_failures: Mutex::new(VecDeque::new()),
			channel_info: Mutex::new(ChannelInfo {
				title: "Default Title".to_string(),
				category: "Default Category".to_string(),
			}),
			stream_info: Mutex::new(None),
			keepalive_timeout: Mutex::new(Duration::from_secs(3600)),
			sessions: Mutex::new(Vec::new()),
			next_subscription_id: AtomicUsize::new(1),
		}
	}

	pub(crate) fn push_create_failure(&self, kind: EventKind, err: anyhow::Error) {
		self.create_failures.lock().entry(kind).or_default().push_back(err);
	}

	pub(crate) fn push_channel_info_failure(&self, err: anyhow::Error) {
		self.channel_info_failures.lock().push_back(err);
	}

	pub(crate) fn add_remote_subscription(&self, id: &str, subscription_type: &str, cost: u64) {
		self.remote.lock().push(RemoteSubscription {
			id: id.to_string(),
			subscription_type: subscription_type.to_string(),
			cost,
		});
	}

	/// Sender for the most recently opened session.
	pub(crate) fn latest_session(&self) -> SessionMessageTx {
		self.sessions.lock().last().cloned().expect("a session was opened")
	}
}

#[async_trait::async_trait]
impl UpstreamClient for FakeUpstream {
	async fn open_session(&self, _creds: &TenantCredentials) -> anyhow::Result<EventSession> {
		let n = self.open_session_calls.fetch_add(1, Ordering::SeqCst) + 1;

		// Yield so overlapping subscribes actually overlap.
		tokio::time::sleep(Duration::from_millis(10)).await;

		let (tx, rx) = mpsc::channel::<SessionMessage>(64);
		let (close_tx, _close_rx) = oneshot::channel::<()>();
		self.sessions.lock().push(tx);

		Ok(EventSession {
			session_id: format!("sess-{n}"),
			keepalive_timeout: *self.keepalive_timeout.lock(),
			messages: rx,
			close: SessionCloseHandle::new(close_tx),
		})
	}

	async fn list_subscriptions(&self, _creds: &TenantCredentials) -> anyhow::Result<Vec<RemoteSubscription>> {
		self.list_calls.fetch_add(1, Ordering::SeqCst);
		Ok(self.remote.lock().clone())
	}

	async fn delete_subscription(&self, _creds: &TenantCredentials, subscription_id: &str) -> anyhow::Result<()> {
		self.deleted.lock().push(subscription_id.to_string());
		self.remote.lock().retain(|s| s.id != subscription_id);
		Ok(())
	}

	async fn create_subscription(
		&self,
		_creds: &TenantCredentials,
		kind: EventKind,
		_session_id: &str,
	) -> anyhow::Result<SubscriptionHandle> {
		self.create_calls.fetch_add(1, Ordering::SeqCst);

		if let Some(err) = self.create_failures.lock().get_mut(&kind).and_then(|q| q.pop_front()) {
			return Err(err);
		}

		let n = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
		Ok(SubscriptionHandle {
			id: format!("sub-{n}"),
			kind,
			cost: 1,
		})
	}

	async fn channel_info(&self, _creds: &TenantCredentials) -> anyhow::Result<ChannelInfo> {
		self.channel_info_calls.fetch_add(1, Ordering::SeqCst);

		if let Some(err) = self.channel_info_failures.lock().pop_front() {
			return Err(err);
		}

		Ok(self.channel_info.lock().clone())
	}

	async fn stream_info(&self, _creds: &TenantCredentials) -> anyhow::Result<Option<StreamInfo>> {
		Ok(self.stream_info.lock().clone())
	}
}

/// Notifier double that records every dispatch.
#[derive(Default)]
pub(crate) struct RecordingNotifier {
	pub sent: Mutex<Vec<(TenantId, SessionStartNotification)>>,
	pub fail: AtomicBool,
}

impl RecordingNotifier {
	pub(crate) fn new() -> Self {
		Self::default()
	}

	pub(crate) fn sent_count(&self) -> usize {
		self.sent.lock().len()
	}
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
	async fn send(&self, tenant: &TenantId, notification: &SessionStartNotification) -> anyhow::Result<()> {
		if self.fail.load(Ordering::SeqCst) {
			anyhow::bail!("scripted notifier failure");
		}
		self.sent.lock().push((tenant.clone(), notification.clone()));
		Ok(())
	}
}

/// Poll `cond` until it holds or ~2 simulated seconds elapse.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
	for _ in 0..200 {
		if cond() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	assert!(cond(), "condition not reached in time");
}
