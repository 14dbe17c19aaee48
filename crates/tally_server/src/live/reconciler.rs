#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tally_domain::{SessionStatus, StreamId, TenantId};
use tally_platform::{ChannelInfo, StreamInfo, TenantCredentials, UpstreamClient};
use tracing::{debug, info, warn};

use crate::hub::TenantHub;
use crate::notify::{Notifier, SessionStartNotification};
use crate::store::TenantStore;

/// Reconciler settings.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
	/// Placeholder title when the metadata fetch fails outright.
	pub default_title: String,

	/// Placeholder category when the metadata fetch fails outright.
	pub default_category: String,
}

impl Default for ReconcilerConfig {
	fn default() -> Self {
		Self {
			default_title: "Untitled stream".to_string(),
			default_category: "Unknown".to_string(),
		}
	}
}

/// Reconciliation phases for one pending notification.
///
/// `AwaitingCoreData → AwaitingAuxData → Ready → Dispatched`, with
/// `Suppressed` as a parallel terminal reached through the dedup check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
	AwaitingCoreData,
	AwaitingAuxData,
	Ready,
	Dispatched,
	Suppressed,
}

/// Accumulated fragments for one live session's outbound notification.
#[derive(Debug, Clone)]
pub struct PendingNotification {
	pub stream_id: StreamId,
	pub started_at: Option<SystemTime>,

	pub title: Option<String>,
	pub category: Option<String>,

	pub has_core_data: bool,
	pub has_aux_data: bool,

	pub created_at: SystemTime,
	pub state: PendingState,
}

impl PendingNotification {
	fn new(stream_id: StreamId, created_at: SystemTime) -> Self {
		Self {
			stream_id,
			started_at: None,
			title: None,
			category: None,
			has_core_data: false,
			has_aux_data: false,
			created_at,
			state: PendingState::AwaitingCoreData,
		}
	}

	fn suppressed(stream_id: StreamId, created_at: SystemTime) -> Self {
		Self {
			state: PendingState::Suppressed,
			..Self::new(stream_id, created_at)
		}
	}

	fn set_core(&mut self, started_at: SystemTime) {
		self.started_at = Some(started_at);
		self.has_core_data = true;
		self.state = PendingState::AwaitingAuxData;
	}

	/// Record auxiliary metadata. `fetched` is false when the values are
	/// placeholder defaults after the fetch fallback.
	fn set_aux(&mut self, title: String, category: String, fetched: bool) {
		self.title = Some(title);
		self.category = Some(category);
		self.has_aux_data = fetched;
		self.state = PendingState::Ready;
	}

	fn mark_dispatched(&mut self) {
		self.state = PendingState::Dispatched;
	}

	/// Dispatch is allowed once both halves are present, or once the
	/// aux-fetch fallback has filled in defaults.
	fn dispatch_eligible(&self) -> bool {
		self.state == PendingState::Ready && self.has_core_data
	}
}

/// Per-tenant state machine that turns asynchronously-arriving stream-start
/// fragments into at most one outbound notification per live session.
///
/// The dedup check against the persisted notified-stream id runs before any
/// metadata fetch, so a transport reconnect inside the same live session
/// costs nothing and never re-notifies.
pub struct Reconciler {
	store: Arc<dyn TenantStore>,
	upstream: Arc<dyn UpstreamClient>,
	notifier: Arc<dyn Notifier>,
	hub: TenantHub,
	cfg: ReconcilerConfig,

	pending: Mutex<HashMap<TenantId, PendingNotification>>,
}

impl Reconciler {
	pub fn new(
		store: Arc<dyn TenantStore>,
		upstream: Arc<dyn UpstreamClient>,
		notifier: Arc<dyn Notifier>,
		hub: TenantHub,
		cfg: ReconcilerConfig,
	) -> Self {
		Self {
			store,
			upstream,
			notifier,
			hub,
			cfg,
			pending: Mutex::new(HashMap::new()),
		}
	}

	/// Handle a `stream.online` event for a tenant.
	pub async fn handle_stream_online(
		&self,
		tenant: &TenantId,
		creds: &TenantCredentials,
		stream_id: StreamId,
		started_at: SystemTime,
	) -> anyhow::Result<()> {
		let now = SystemTime::now();

		// Dedup first: a reconnect within the same live session replays the
		// stream.online event with the same id.
		let notified = self.store.get_notified_stream_id(tenant).await?;
		if notified.as_ref() == Some(&stream_id) {
			metrics::counter!("tally_server_notifications_suppressed_total").increment(1);
			debug!(tenant = %tenant, stream_id = %stream_id, "suppressing duplicate session-start notification");
			self.pending
				.lock()
				.insert(tenant.clone(), PendingNotification::suppressed(stream_id, now));
			return Ok(());
		}

		{
			let mut record = PendingNotification::new(stream_id.clone(), now);
			record.set_core(started_at);
			self.pending.lock().insert(tenant.clone(), record);
		}

		self.hub
			.publish_status(tenant, SessionStatus::Pending, "session start detected; fetching metadata")
			.await;

		// Synchronous metadata fetch, one retry, then placeholder defaults.
		let (info, fetched) = match self.fetch_channel_info_with_retry(tenant, creds).await {
			Some(info) => (info, true),
			None => (
				ChannelInfo {
					title: self.cfg.default_title.clone(),
					category: self.cfg.default_category.clone(),
				},
				false,
			),
		};

		let eligible = {
			let mut pending = self.pending.lock();
			match pending.get_mut(tenant) {
				Some(p) => {
					p.set_aux(info.title.clone(), info.category.clone(), fetched);
					p.dispatch_eligible()
				}
				// A manual stop raced the fetch and wiped the record.
				None => false,
			}
		};

		if !eligible {
			debug!(tenant = %tenant, stream_id = %stream_id, "pending notification gone before dispatch");
			return Ok(());
		}

		// Viewer count and thumbnail are best-effort extras.
		let stream = match self.upstream.stream_info(creds).await {
			Ok(s) => s,
			Err(e) => {
				debug!(tenant = %tenant, error = %e, "stream info unavailable at dispatch time");
				None
			}
		};
		let stream = stream.unwrap_or(StreamInfo {
			viewer_count: 0,
			thumbnail_url: None,
		});

		let notification = SessionStartNotification {
			stream_id: stream_id.as_str().to_string(),
			title: info.title,
			category: info.category,
			started_at: chrono::DateTime::<chrono::Utc>::from(started_at).to_rfc3339(),
			thumbnail_url: stream.thumbnail_url,
			viewer_count: stream.viewer_count,
		};

		match self.notifier.send(tenant, &notification).await {
			Ok(()) => {
				metrics::counter!("tally_server_notifications_sent_total").increment(1);
				info!(tenant = %tenant, stream_id = %stream_id, title = %notification.title, "session-start notification sent");
				self.hub
					.publish_status(tenant, SessionStatus::Sent, "session-start notification sent")
					.await;
			}
			Err(e) => {
				warn!(tenant = %tenant, stream_id = %stream_id, error = %e, "session-start notification failed");
				self.hub
					.publish_status(tenant, SessionStatus::Failed, "session-start notification failed")
					.await;
			}
		}

		// The dispatch attempt is the one shot this session gets; record the
		// dedup id either way so reconnects stay quiet.
		self.store.set_notified_stream_id(tenant, &stream_id).await?;
		self.store.set_live_state(tenant, true, Some(&stream_id)).await?;

		if let Some(p) = self.pending.lock().remove(tenant).as_mut() {
			p.mark_dispatched();
		}

		Ok(())
	}

	/// Handle a `stream.offline` event: clear the live flag so a subsequent
	/// `stream.online` is treated as a new session.
	pub async fn handle_stream_offline(&self, tenant: &TenantId) -> anyhow::Result<()> {
		debug!(tenant = %tenant, "stream ended; clearing live-session flag");
		self.pending.lock().remove(tenant);
		self.store.set_live_state(tenant, false, None).await
	}

	/// Drop any pending notification for the tenant (manual stop).
	pub fn clear_pending(&self, tenant: &TenantId) {
		self.pending.lock().remove(tenant);
	}

	/// Administrative escape hatch: wipe dedup and live-session records.
	pub async fn reset_stream_state(&self, tenant: &TenantId) -> anyhow::Result<()> {
		self.clear_pending(tenant);
		self.store.clear_notified_stream_id(tenant).await?;
		self.store.set_live_state(tenant, false, None).await?;
		info!(tenant = %tenant, "stream state reset");
		Ok(())
	}

	/// Current reconciliation phase for a tenant, if a record exists.
	pub fn pending_state(&self, tenant: &TenantId) -> Option<PendingState> {
		self.pending.lock().get(tenant).map(|p| p.state)
	}

	async fn fetch_channel_info_with_retry(&self, tenant: &TenantId, creds: &TenantCredentials) -> Option<ChannelInfo> {
		for attempt in 0..2 {
			match self.upstream.channel_info(creds).await {
				Ok(info) => return Some(info),
				Err(e) => {
					warn!(tenant = %tenant, attempt, error = %e, "channel metadata fetch failed");
				}
			}
		}

		None
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pending_record_walks_the_state_table() {
		let stream_id = StreamId::new("s-1").unwrap();
		let now = SystemTime::now();

		let mut p = PendingNotification::new(stream_id, now);
		assert_eq!(p.state, PendingState::AwaitingCoreData);
		assert!(!p.dispatch_eligible());

		p.set_core(now);
		assert_eq!(p.state, PendingState::AwaitingAuxData);
		assert!(!p.dispatch_eligible());

		p.set_aux("title".into(), "category".into(), true);
		assert_eq!(p.state, PendingState::Ready);
		assert!(p.dispatch_eligible());

		p.mark_dispatched();
		assert_eq!(p.state, PendingState::Dispatched);
	}

	#[test]
	fn fallback_defaults_still_reach_ready() {
		let stream_id = StreamId::new("s-2").unwrap();
		let now = SystemTime::now();

		let mut p = PendingNotification::new(stream_id, now);
		p.set_core(now);
		p.set_aux("Untitled stream".into(), "Unknown".into(), false);

		assert_eq!(p.state, PendingState::Ready);
		assert!(!p.has_aux_data);
		assert!(p.dispatch_eligible());
	}

	#[test]
	fn suppressed_is_terminal_and_never_eligible() {
		let stream_id = StreamId::new("s-3").unwrap();
		let p = PendingNotification::suppressed(stream_id, SystemTime::now());
		assert_eq!(p.state, PendingState::Suppressed);
		assert!(!p.dispatch_eligible());
	}
}
