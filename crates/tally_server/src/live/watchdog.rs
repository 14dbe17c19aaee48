#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tally_domain::TenantId;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Health monitor settings.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
	/// Slack added on top of the negotiated keepalive timeout.
	pub grace: Duration,
}

impl Default for HealthMonitorConfig {
	fn default() -> Self {
		Self {
			grace: Duration::from_secs(5),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerPhase {
	Armed,
	Fired,
}

#[derive(Debug)]
struct TimerState {
	generation: u64,
	phase: TimerPhase,
	abort: tokio::task::AbortHandle,
}

/// Per-tenant dead-connection watchdog.
///
/// The upstream protocol sends periodic keepalive frames; silence beyond the
/// negotiated timeout is the only reliable signal of a half-open connection,
/// since transport-level close events are not always delivered promptly.
/// A fire enqueues the tenant on the recycle channel; it never performs the
/// reconnect inline.
#[derive(Clone)]
pub struct HealthMonitor {
	cfg: HealthMonitorConfig,
	timers: Arc<Mutex<HashMap<TenantId, TimerState>>>,
	fired_tx: mpsc::Sender<TenantId>,
}

impl HealthMonitor {
	pub fn new(cfg: HealthMonitorConfig, fired_tx: mpsc::Sender<TenantId>) -> Self {
		Self {
			cfg,
			timers: Arc::new(Mutex::new(HashMap::new())),
			fired_tx,
		}
	}

	/// Arm the watchdog for `timeout + grace` of silence.
	pub fn start(&self, tenant: &TenantId, timeout: Duration) {
		self.arm(tenant, timeout);
	}

	/// Cancel and re-arm; called on every inbound session message, keepalive
	/// pings included.
	pub fn reset(&self, tenant: &TenantId, timeout: Duration) {
		self.arm(tenant, timeout);
	}

	/// Cancel the timer; called whenever the tenant's connection is
	/// deliberately torn down.
	pub fn stop(&self, tenant: &TenantId) {
		if let Some(state) = self.timers.lock().remove(tenant) {
			state.abort.abort();
			debug!(tenant = %tenant, "health watchdog stopped");
		}
	}

	/// Whether a timer is currently armed for the tenant.
	#[allow(dead_code)]
	pub fn is_armed(&self, tenant: &TenantId) -> bool {
		self.timers
			.lock()
			.get(tenant)
			.is_some_and(|s| s.phase == TimerPhase::Armed)
	}

	fn arm(&self, tenant: &TenantId, timeout: Duration) {
		let deadline = timeout + self.cfg.grace;

		let mut timers = self.timers.lock();

		let next_generation = timers.get(tenant).map(|s| s.generation + 1).unwrap_or(0);

		let task = {
			let tenant = tenant.clone();
			let timers = Arc::clone(&self.timers);
			let fired_tx = self.fired_tx.clone();

			tokio::spawn(async move {
				sleep(deadline).await;

				{
					let mut timers = timers.lock();
					let Some(state) = timers.get_mut(&tenant) else {
						return;
					};
					// A newer arm supersedes this sleeper.
					if state.generation != next_generation {
						return;
					}
					state.phase = TimerPhase::Fired;
				}

				warn!(tenant = %tenant, deadline_secs = deadline.as_secs(), "no upstream activity within keepalive window; scheduling reconnect");
				metrics::counter!("tally_server_watchdog_fires_total").increment(1);

				if fired_tx.try_send(tenant.clone()).is_err() {
					warn!(tenant = %tenant, "recycle queue full; dropping watchdog fire");
				}
			})
		};

		if let Some(prev) = timers.insert(
			tenant.clone(),
			TimerState {
				generation: next_generation,
				phase: TimerPhase::Armed,
				abort: task.abort_handle(),
			},
		) {
			prev.abort.abort();
		}
	}
}
