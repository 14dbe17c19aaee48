#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tally_domain::{EventKind, LifecycleState, SessionStatus, TenantId};
use tally_platform::{EventSession, SessionCloseHandle, SubscriptionHandle, UpstreamClient};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::hub::TenantHub;
use crate::live::dispatcher::{DispatcherContext, spawn_dispatcher};
use crate::live::provisioner::{Provisioner, ProvisionerConfig};
use crate::live::reconciler::{Reconciler, ReconcilerConfig};
use crate::live::watchdog::{HealthMonitor, HealthMonitorConfig};
use crate::notify::Notifier;
use crate::store::TenantStore;
use crate::util::unix_ms_now;

/// Connection registry settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
	/// Slack added to the negotiated keepalive before the watchdog fires.
	pub keepalive_grace: Duration,

	/// Pause between teardown and re-subscribe in an automatic recycle.
	pub restart_delay: Duration,

	pub recycle_queue_capacity: usize,

	pub provisioner: ProvisionerConfig,
	pub reconciler: ReconcilerConfig,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		Self {
			keepalive_grace: Duration::from_secs(5),
			restart_delay: Duration::from_secs(2),
			recycle_queue_capacity: 64,
			provisioner: ProvisionerConfig::default(),
			reconciler: ReconcilerConfig::default(),
		}
	}
}

/// Read-only view of one tenant's connection.
#[derive(Debug, Clone, Serialize)]
pub struct TenantStatusSnapshot {
	pub tenant: TenantId,
	pub lifecycle: LifecycleState,
	pub session_id: Option<String>,
	pub active_kinds: Vec<EventKind>,
	pub keepalive_secs: Option<u64>,
	pub last_seen_unix_ms: Option<i64>,
}

/// Session guts held only while a connection exists; guarded by an async
/// lock so per-tenant operations serialize.
#[derive(Default)]
struct SlotState {
	session_id: Option<String>,
	subscriptions: HashMap<EventKind, SubscriptionHandle>,
	close: Option<SessionCloseHandle>,
	dispatcher: Option<tokio::task::JoinHandle<()>>,
	keepalive_timeout: Duration,
}

struct TenantSlot {
	lifecycle: parking_lot::Mutex<LifecycleState>,
	state: tokio::sync::Mutex<SlotState>,

	/// Prevents two overlapping subscribes from racing to provision
	/// duplicate sessions; the loser is a success no-op.
	subscribe_in_flight: AtomicBool,

	last_seen_unix_ms: Arc<AtomicI64>,
}

impl TenantSlot {
	fn new() -> Self {
		Self {
			lifecycle: parking_lot::Mutex::new(LifecycleState::Disconnected),
			state: tokio::sync::Mutex::new(SlotState::default()),
			subscribe_in_flight: AtomicBool::new(false),
			last_seen_unix_ms: Arc::new(AtomicI64::new(0)),
		}
	}

	fn set_lifecycle(&self, next: LifecycleState) {
		*self.lifecycle.lock() = next;
	}

	fn lifecycle(&self) -> LifecycleState {
		*self.lifecycle.lock()
	}
}

/// The map from tenant id to live connection state, and the owner of every
/// per-tenant lifecycle operation.
///
/// Owned by the composition root and injected into the operational surface;
/// there is deliberately no global instance.
pub struct ConnectionRegistry {
	cfg: RegistryConfig,
	store: Arc<dyn TenantStore>,
	upstream: Arc<dyn UpstreamClient>,
	provisioner: Provisioner,
	watchdog: HealthMonitor,
	reconciler: Arc<Reconciler>,
	hub: TenantHub,
	recycle_tx: mpsc::Sender<TenantId>,

	slots: tokio::sync::Mutex<HashMap<TenantId, Arc<TenantSlot>>>,
}

impl ConnectionRegistry {
	/// Build the registry and spawn its recycle worker.
	pub fn start(
		cfg: RegistryConfig,
		store: Arc<dyn TenantStore>,
		upstream: Arc<dyn UpstreamClient>,
		notifier: Arc<dyn Notifier>,
		hub: TenantHub,
	) -> Arc<Self> {
		let (recycle_tx, mut recycle_rx) = mpsc::channel::<TenantId>(cfg.recycle_queue_capacity);

		let watchdog = HealthMonitor::new(
			HealthMonitorConfig {
				grace: cfg.keepalive_grace,
			},
			recycle_tx.clone(),
		);

		let provisioner = Provisioner::new(Arc::clone(&upstream), cfg.provisioner.clone());

		let reconciler = Arc::new(Reconciler::new(
			Arc::clone(&store),
			Arc::clone(&upstream),
			notifier,
			hub.clone(),
			cfg.reconciler.clone(),
		));

		let registry = Arc::new(Self {
			cfg,
			store,
			upstream,
			provisioner,
			watchdog,
			reconciler,
			hub,
			recycle_tx,
			slots: tokio::sync::Mutex::new(HashMap::new()),
		});

		let worker = Arc::clone(&registry);
		tokio::spawn(async move {
			while let Some(tenant) = recycle_rx.recv().await {
				let registry = Arc::clone(&worker);
				tokio::spawn(async move {
					registry.recycle(tenant).await;
				});
			}
		});

		registry
	}

	/// Bring up the tenant's session: open the upstream connection, clean
	/// stale subscriptions, provision desired ones, start the dispatcher and
	/// the health watchdog.
	///
	/// A call while the tenant is Active or while another subscribe is in
	/// flight is a success no-op.
	pub async fn subscribe(&self, tenant: &TenantId) -> anyhow::Result<()> {
		let slot = self.slot(tenant).await;

		if slot
			.subscribe_in_flight
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			debug!(tenant = %tenant, "subscribe already in flight; no-op");
			return Ok(());
		}

		let result = self.subscribe_inner(tenant, &slot).await;
		slot.subscribe_in_flight.store(false, Ordering::Release);
		result
	}

	async fn subscribe_inner(&self, tenant: &TenantId, slot: &TenantSlot) -> anyhow::Result<()> {
		let mut st = slot.state.lock().await;

		if slot.lifecycle() == LifecycleState::Active {
			debug!(tenant = %tenant, "already active; subscribe is a no-op");
			return Ok(());
		}

		// Unknown tenant or unreachable store is fatal for this call.
		let record = self
			.store
			.get_tenant(tenant)
			.await
			.context("load tenant record")?
			.with_context(|| format!("unknown tenant {tenant}"))?;

		slot.set_lifecycle(LifecycleState::Provisioning);
		self.hub
			.publish_status(tenant, SessionStatus::Pending, "connecting to upstream")
			.await;

		let session = match self.upstream.open_session(&record.credentials).await {
			Ok(s) => s,
			Err(e) => {
				slot.set_lifecycle(LifecycleState::Disconnected);
				self.hub
					.publish_status(tenant, SessionStatus::Failed, "upstream connection failed")
					.await;
				return Err(e).context("open upstream session");
			}
		};

		let EventSession {
			session_id,
			keepalive_timeout,
			messages,
			mut close,
		} = session;

		let handles = match self
			.provisioner
			.provision(tenant, &record.credentials, &session_id, self.store.as_ref())
			.await
		{
			Ok(h) => h,
			Err(e) => {
				close.close();
				slot.set_lifecycle(LifecycleState::Disconnected);
				self.hub
					.publish_status(tenant, SessionStatus::Failed, "subscription provisioning failed")
					.await;
				return Err(e).context("provision subscriptions");
			}
		};

		slot.last_seen_unix_ms.store(unix_ms_now(), Ordering::Relaxed);

		let dispatcher = spawn_dispatcher(
			messages,
			DispatcherContext {
				tenant: tenant.clone(),
				creds: record.credentials.clone(),
				keepalive_timeout,
				watchdog: self.watchdog.clone(),
				reconciler: Arc::clone(&self.reconciler),
				hub: self.hub.clone(),
				recycle_tx: self.recycle_tx.clone(),
				last_seen_unix_ms: Arc::clone(&slot.last_seen_unix_ms),
			},
		);

		self.watchdog.start(tenant, keepalive_timeout);

		st.session_id = Some(session_id.clone());
		st.subscriptions = handles;
		st.close = Some(close);
		st.dispatcher = Some(dispatcher);
		st.keepalive_timeout = keepalive_timeout;
		slot.set_lifecycle(LifecycleState::Active);

		metrics::counter!("tally_server_sessions_started_total").increment(1);
		info!(
			tenant = %tenant,
			session_id = %session_id,
			kinds = st.subscriptions.len(),
			keepalive_secs = keepalive_timeout.as_secs(),
			"tenant session active"
		);

		self.hub.publish_status(tenant, SessionStatus::Ready, "counters live").await;

		Ok(())
	}

	/// Tear the tenant's session down. Idempotent.
	///
	/// A manual stop additionally clears the notification dedup record and
	/// any pending notification, and removes the tenant from the map; the
	/// automatic path preserves dedup state for the reconnect.
	pub async fn unsubscribe(&self, tenant: &TenantId, manual: bool) -> anyhow::Result<()> {
		let slot = { self.slots.lock().await.get(tenant).cloned() };
		let Some(slot) = slot else {
			debug!(tenant = %tenant, manual, "unsubscribe for unknown tenant; no-op");
			return Ok(());
		};

		let mut st = slot.state.lock().await;

		// With nothing held there is nothing to tear down; a manual stop on a
		// never-started tenant still falls through to clear derived state.
		let nothing_held = st.close.is_none() && st.subscriptions.is_empty();
		if nothing_held && (!manual || slot.lifecycle() == LifecycleState::Stopped) {
			debug!(tenant = %tenant, manual, "already stopped; unsubscribe is a no-op");
			return Ok(());
		}

		self.watchdog.stop(tenant);

		let handles: Vec<SubscriptionHandle> = st.subscriptions.drain().map(|(_, v)| v).collect();
		if !handles.is_empty() {
			match self.store.get_tenant(tenant).await {
				Ok(Some(record)) => {
					for handle in handles {
						if let Err(e) = self.upstream.delete_subscription(&record.credentials, &handle.id).await {
							warn!(tenant = %tenant, subscription_id = %handle.id, error = %e, "failed to delete subscription during teardown");
						}
					}
				}
				Ok(None) => {
					warn!(tenant = %tenant, "tenant record gone during teardown; upstream subscriptions left to expire");
				}
				Err(e) => {
					warn!(tenant = %tenant, error = %e, "store unavailable during teardown; upstream subscriptions left to expire");
				}
			}
		}

		if let Some(mut close) = st.close.take() {
			close.close();
		}

		// The dispatcher drains its channel and exits once the pump stops.
		st.dispatcher.take();
		st.session_id = None;

		slot.set_lifecycle(if manual {
			LifecycleState::Stopped
		} else {
			LifecycleState::Reconnecting
		});

		drop(st);

		if manual {
			self.reconciler.clear_pending(tenant);
			if let Err(e) = self.store.clear_notified_stream_id(tenant).await {
				warn!(tenant = %tenant, error = %e, "failed to clear notified stream id on manual stop");
			}
			if let Err(e) = self.store.set_live_state(tenant, false, None).await {
				warn!(tenant = %tenant, error = %e, "failed to clear live state on manual stop");
			}

			self.hub
				.publish_status(tenant, SessionStatus::Disabled, "live counters disabled")
				.await;

			self.slots.lock().await.remove(tenant);
			info!(tenant = %tenant, "tenant connection stopped");
		} else {
			debug!(tenant = %tenant, "tenant connection torn down for reconnect");
		}

		Ok(())
	}

	/// Recycle a stuck session: automatic teardown, short delay, subscribe.
	pub async fn force_reconnect(&self, tenant: &TenantId) -> anyhow::Result<()> {
		info!(tenant = %tenant, "forced reconnect requested");
		self.unsubscribe(tenant, false).await?;
		sleep(self.cfg.restart_delay).await;
		self.subscribe(tenant).await
	}

	/// Administrative escape hatch for a stuck dedup/live-session record.
	pub async fn reset_stream_state(&self, tenant: &TenantId) -> anyhow::Result<()> {
		self.reconciler.reset_stream_state(tenant).await
	}

	/// Read-only snapshot for one tenant.
	pub async fn status(&self, tenant: &TenantId) -> Option<TenantStatusSnapshot> {
		let slot = { self.slots.lock().await.get(tenant).cloned() }?;
		Some(self.snapshot(tenant, &slot))
	}

	/// Read-only snapshot for every known tenant.
	pub async fn status_all(&self) -> Vec<TenantStatusSnapshot> {
		let slots: Vec<(TenantId, Arc<TenantSlot>)> = {
			let slots = self.slots.lock().await;
			slots.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
		};

		let mut out: Vec<TenantStatusSnapshot> = slots
			.iter()
			.map(|(tenant, slot)| self.snapshot(tenant, slot))
			.collect();
		out.sort_by(|a, b| a.tenant.as_str().cmp(b.tenant.as_str()));
		out
	}

	fn snapshot(&self, tenant: &TenantId, slot: &TenantSlot) -> TenantStatusSnapshot {
		// Never blocks behind an in-flight subscribe; detail fields are
		// simply absent while the slot is busy.
		let (session_id, mut active_kinds, keepalive_secs) = match slot.state.try_lock() {
			Ok(st) => (
				st.session_id.clone(),
				st.subscriptions.keys().copied().collect::<Vec<_>>(),
				st.session_id.as_ref().map(|_| st.keepalive_timeout.as_secs()),
			),
			Err(_) => (None, Vec::new(), None),
		};
		active_kinds.sort_by_key(|k| k.as_subscription_type());

		let last_seen = slot.last_seen_unix_ms.load(Ordering::Relaxed);

		TenantStatusSnapshot {
			tenant: tenant.clone(),
			lifecycle: slot.lifecycle(),
			session_id,
			active_kinds,
			keepalive_secs,
			last_seen_unix_ms: if last_seen > 0 { Some(last_seen) } else { None },
		}
	}

	async fn recycle(&self, tenant: TenantId) {
		// A manual stop that raced the recycle queue wins; never resurrect a
		// stopped tenant.
		let lifecycle = {
			let slots = self.slots.lock().await;
			slots.get(&tenant).map(|s| s.lifecycle())
		};
		match lifecycle {
			None | Some(LifecycleState::Stopped) => {
				debug!(tenant = %tenant, "skipping recycle for stopped tenant");
				return;
			}
			_ => {}
		}

		metrics::counter!("tally_server_recycles_total").increment(1);

		if let Err(e) = self.unsubscribe(&tenant, false).await {
			warn!(tenant = %tenant, error = %e, "teardown failed during recycle");
		}

		sleep(self.cfg.restart_delay).await;

		if let Err(e) = self.subscribe(&tenant).await {
			warn!(tenant = %tenant, error = %e, "automatic resubscribe failed; tenant left disconnected");
		}
	}

	async fn slot(&self, tenant: &TenantId) -> Arc<TenantSlot> {
		let mut slots = self.slots.lock().await;
		Arc::clone(slots.entry(tenant.clone()).or_insert_with(|| Arc::new(TenantSlot::new())))
	}

	/// Reconciliation phase accessor for diagnostics.
	#[allow(dead_code)]
	pub fn pending_state(&self, tenant: &TenantId) -> Option<crate::live::reconciler::PendingState> {
		self.reconciler.pending_state(tenant)
	}
}
