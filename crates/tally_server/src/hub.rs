#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use tally_domain::{SessionStatus, TenantId};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Per-tenant hub that fans out status updates and alert events to UI and
/// overlay subscribers.
#[derive(Debug, Clone)]
pub struct TenantHub {
	inner: Arc<Mutex<Inner>>,
	cfg: TenantHubConfig,
}

/// Configuration for `TenantHub`.
#[derive(Debug, Clone)]
pub struct TenantHubConfig {
	/// Maximum number of queued items per subscriber.
	pub subscriber_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for TenantHubConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 256,
			debug_logs: false,
		}
	}
}

/// Alert events with display data already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertItem {
	NewFollower {
		user_name: String,
	},
	NewSubscription {
		user_name: String,
		tier: String,
		is_gift: bool,
	},
	Cheer {
		user_name: Option<String>,
		bits: u64,
	},
	Redemption {
		user_name: String,
		reward_title: String,
		reward_cost: u64,
	},
}

/// Items emitted on a subscriber stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubItem {
	Status {
		status: SessionStatus,
		detail: String,
	},

	Alert(AlertItem),

	/// Indicates the subscriber is lagging and items were dropped.
	Lagged {
		dropped: u64,
	},
}

impl TenantHub {
	pub fn new(cfg: TenantHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Subscribe to a tenant's stream.
	pub async fn subscribe_tenant(&self, tenant: TenantId) -> mpsc::Receiver<HubItem> {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity);

		let mut inner = self.inner.lock().await;
		let entry = inner.tenants.entry(tenant.clone()).or_default();

		prune_closed_subscribers(entry);

		entry.subscribers.push(tx);
		entry.pending_lag_by_subscriber.push(0);

		if self.cfg.debug_logs {
			debug!(tenant = %tenant, subs = entry.subscribers.len(), "tenant hub: subscribed");
		}

		rx
	}

	/// Publish a session-status change to a tenant's subscribers.
	pub async fn publish_status(&self, tenant: &TenantId, status: SessionStatus, detail: impl Into<String>) {
		self.publish_to_tenant(
			tenant,
			HubItem::Status {
				status,
				detail: detail.into(),
			},
		)
		.await;
	}

	/// Publish an alert event to a tenant's subscribers.
	pub async fn publish_alert(&self, tenant: &TenantId, alert: AlertItem) {
		self.publish_to_tenant(tenant, HubItem::Alert(alert)).await;
	}

	pub(crate) async fn publish_to_tenant(&self, tenant: &TenantId, item: HubItem) {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.tenants.get_mut(tenant) else {
			return;
		};

		prune_closed_subscribers(entry);

		if entry.subscribers.is_empty() {
			inner.tenants.remove(tenant);
			return;
		}

		let mut dropped_total: u64 = 0;

		for (idx, sub) in entry.subscribers.iter_mut().enumerate() {
			match sub.try_send(item.clone()) {
				Ok(()) => {
					if let Some(pending) = entry.pending_lag_by_subscriber.get_mut(idx)
						&& *pending > 0 && sub.try_send(HubItem::Lagged { dropped: *pending }).is_ok()
					{
						*pending = 0;
					}
				}
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped_total += 1;

					if let Some(pending) = entry.pending_lag_by_subscriber.get_mut(idx) {
						*pending = pending.saturating_add(1);
					}
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		prune_closed_subscribers(entry);

		if entry.subscribers.is_empty() {
			inner.tenants.remove(tenant);
		}

		if self.cfg.debug_logs && dropped_total > 0 {
			debug!(
				tenant = %tenant,
				dropped = dropped_total,
				"tenant hub: dropped due to full subscriber queues"
			);
		}
	}

	/// Get a snapshot of subscriber counts per tenant.
	#[allow(dead_code)]
	pub async fn tenant_subscriber_counts(&self) -> HashMap<TenantId, usize> {
		let inner = self.inner.lock().await;
		inner
			.tenants
			.iter()
			.map(|(k, v)| (k.clone(), v.subscribers.iter().filter(|s| !s.is_closed()).count()))
			.collect()
	}
}

#[derive(Debug, Default)]
struct Inner {
	tenants: HashMap<TenantId, TenantEntry>,
}

#[derive(Debug, Default)]
struct TenantEntry {
	subscribers: Vec<mpsc::Sender<HubItem>>,

	/// Pending lag markers per subscriber.
	pending_lag_by_subscriber: Vec<u64>,
}

fn prune_closed_subscribers(entry: &mut TenantEntry) {
	if entry.subscribers.len() != entry.pending_lag_by_subscriber.len() {
		entry.pending_lag_by_subscriber.resize(entry.subscribers.len(), 0);
	}

	let mut new_subs = Vec::with_capacity(entry.subscribers.len());
	let mut new_lag = Vec::with_capacity(entry.subscribers.len());

	for (sub, lag) in entry.subscribers.drain(..).zip(entry.pending_lag_by_subscriber.drain(..)) {
		if !sub.is_closed() {
			new_subs.push(sub);
			new_lag.push(lag);
		}
	}

	entry.subscribers = new_subs;
	entry.pending_lag_by_subscriber = new_lag;
}
