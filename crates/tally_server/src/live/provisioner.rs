#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tally_domain::{EventKind, TenantId};
use tally_platform::{
	SubscriptionHandle, TenantCredentials, UpstreamClient, UpstreamErrorCategory, categorize_upstream_error,
};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::store::TenantStore;

/// Subscription provisioner settings.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
	/// Attempt ceiling for rate-limited creates.
	pub max_attempts: u32,

	/// First retry delay; doubles per attempt.
	pub backoff_base: Duration,

	/// Pause between stale-subscription deletes.
	pub inter_delete_delay: Duration,
}

impl Default for ProvisionerConfig {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			backoff_base: Duration::from_secs(2),
			inter_delete_delay: Duration::from_millis(150),
		}
	}
}

/// Delay before retry `attempt` (0-based): `base` doubled per attempt, with
/// the shift clamped so large attempt counts cannot overflow.
pub(crate) fn backoff_delay(attempt: u32, base: Duration) -> Duration {
	base.saturating_mul(1u32 << attempt.min(16))
}

/// Retry `factory` until it succeeds, `is_retryable` rejects the error, or
/// `max_attempts` is exhausted. Backoff doubles from `backoff_base`.
pub async fn retry_with_backoff<T, F, Fut, P>(
	mut factory: F,
	is_retryable: P,
	max_attempts: u32,
	backoff_base: Duration,
) -> anyhow::Result<T>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = anyhow::Result<T>>,
	P: Fn(&anyhow::Error) -> bool,
{
	let mut attempt: u32 = 0;

	loop {
		match factory().await {
			Ok(v) => return Ok(v),
			Err(e) => {
				attempt += 1;
				if attempt >= max_attempts.max(1) || !is_retryable(&e) {
					return Err(e);
				}

				let delay = backoff_delay(attempt - 1, backoff_base);
				debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after backoff");
				sleep(delay).await;
			}
		}
	}
}

/// Provisions upstream event subscriptions for one tenant at a time while
/// keeping the aggregate cost below the platform ceiling.
pub struct Provisioner {
	upstream: Arc<dyn UpstreamClient>,
	cfg: ProvisionerConfig,
}

impl Provisioner {
	pub fn new(upstream: Arc<dyn UpstreamClient>, cfg: ProvisionerConfig) -> Self {
		Self { upstream, cfg }
	}

	/// Tear down every subscription currently held by the tenant's
	/// credentials, then re-list to confirm the ceiling has been freed.
	///
	/// Individual delete failures are logged, not fatal; a failing list is,
	/// since the ceiling state would be unknown.
	pub async fn cleanup_stale(&self, tenant: &TenantId, creds: &TenantCredentials) -> anyhow::Result<()> {
		let stale = self
			.upstream
			.list_subscriptions(creds)
			.await
			.context("list stale subscriptions")?;

		if stale.is_empty() {
			return Ok(());
		}

		info!(tenant = %tenant, count = stale.len(), "removing stale upstream subscriptions");

		for sub in &stale {
			if let Err(e) = self.upstream.delete_subscription(creds, &sub.id).await {
				warn!(tenant = %tenant, subscription_id = %sub.id, error = %e, "failed to delete stale subscription");
			}
			sleep(self.cfg.inter_delete_delay).await;
		}

		let remaining = self
			.upstream
			.list_subscriptions(creds)
			.await
			.context("verify stale subscriptions removed")?;

		if !remaining.is_empty() {
			warn!(
				tenant = %tenant,
				remaining = remaining.len(),
				"stale subscriptions still present after cleanup; ceiling may be tighter than expected"
			);
		}

		Ok(())
	}

	/// Create one subscription, retrying with backoff only on rate-limit
	/// errors.
	pub async fn create_with_retry(
		&self,
		tenant: &TenantId,
		creds: &TenantCredentials,
		kind: EventKind,
		session_id: &str,
	) -> anyhow::Result<SubscriptionHandle> {
		retry_with_backoff(
			|| self.upstream.create_subscription(creds, kind, session_id),
			|e| categorize_upstream_error(e) == UpstreamErrorCategory::RateLimit,
			self.cfg.max_attempts,
			self.cfg.backoff_base,
		)
		.await
		.with_context(|| format!("create subscription kind={kind} tenant={tenant}"))
	}

	/// Provision the tenant's desired subscriptions against `session_id`.
	///
	/// Core lifecycle kinds come first and are required; feature-gated kinds
	/// follow and degrade to omission on persistent failure.
	pub async fn provision(
		&self,
		tenant: &TenantId,
		creds: &TenantCredentials,
		session_id: &str,
		store: &dyn TenantStore,
	) -> anyhow::Result<HashMap<EventKind, SubscriptionHandle>> {
		self.cleanup_stale(tenant, creds).await?;

		let mut handles: HashMap<EventKind, SubscriptionHandle> = HashMap::new();
		let mut total_cost: u64 = 0;

		for kind in EventKind::all() {
			if let Some(flag) = kind.feature_flag() {
				let enabled = match store.has_feature(tenant, flag).await {
					Ok(v) => v,
					Err(e) => {
						warn!(tenant = %tenant, flag, error = %e, "feature lookup failed; skipping gated kind");
						false
					}
				};
				if !enabled {
					debug!(tenant = %tenant, kind = %kind, flag, "skipping subscription; feature disabled");
					continue;
				}
			}

			match self.create_with_retry(tenant, creds, kind, session_id).await {
				Ok(handle) => {
					total_cost = total_cost.saturating_add(handle.cost);
					handles.insert(kind, handle);
				}
				Err(e) if kind.is_core() => {
					return Err(e).with_context(|| format!("provision required lifecycle subscription {kind}"));
				}
				Err(e) => {
					metrics::counter!("tally_server_provision_failures_total").increment(1);
					warn!(tenant = %tenant, kind = %kind, error = %e, "omitting subscription kind after provisioning failure");
				}
			}
		}

		debug!(tenant = %tenant, kinds = handles.len(), total_cost, "provisioned subscriptions");
		Ok(handles)
	}
}
