#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tally_domain::TenantId;
use tally_platform::{SessionMessage, SessionMessageRx, TenantCredentials, UpstreamEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::hub::{AlertItem, TenantHub};
use crate::live::reconciler::Reconciler;
use crate::live::watchdog::HealthMonitor;
use crate::util::unix_ms_now;

/// Everything one tenant's dispatcher task needs.
pub(crate) struct DispatcherContext {
	pub tenant: TenantId,
	pub creds: TenantCredentials,
	pub keepalive_timeout: Duration,
	pub watchdog: HealthMonitor,
	pub reconciler: Arc<Reconciler>,
	pub hub: TenantHub,
	pub recycle_tx: mpsc::Sender<TenantId>,
	pub last_seen_unix_ms: Arc<AtomicI64>,
}

/// Spawn the per-tenant event loop: drain session messages in delivery
/// order, reset the watchdog on every one, and route follow-up work off the
/// delivery path.
pub(crate) fn spawn_dispatcher(mut messages: SessionMessageRx, ctx: DispatcherContext) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let tenant = ctx.tenant.clone();
		debug!(tenant = %tenant, "dispatcher started");

		while let Some(msg) = messages.recv().await {
			ctx.watchdog.reset(&tenant, ctx.keepalive_timeout);
			ctx.last_seen_unix_ms.store(unix_ms_now(), Ordering::Relaxed);

			match msg {
				SessionMessage::Keepalive => {}

				SessionMessage::Event(ev) => {
					metrics::counter!("tally_server_events_routed_total").increment(1);
					route_event(&ctx, &tenant, ev).await;
				}

				SessionMessage::ReconnectRequested => {
					info!(tenant = %tenant, "upstream requested session move; scheduling reconnect");
					enqueue_recycle(&ctx, &tenant);
				}

				SessionMessage::Revoked { subscription_type } => {
					warn!(tenant = %tenant, subscription_type = %subscription_type, "subscription revoked; scheduling reconnect");
					enqueue_recycle(&ctx, &tenant);
				}

				SessionMessage::Closed { reason } => {
					warn!(tenant = %tenant, reason = %reason, "session transport dropped; scheduling reconnect");
					enqueue_recycle(&ctx, &tenant);
					break;
				}
			}
		}

		// A deliberate close drains the channel without a Closed message, so
		// reaching this point on its own is not an error.
		debug!(tenant = %tenant, "dispatcher exiting");
	})
}

fn enqueue_recycle(ctx: &DispatcherContext, tenant: &TenantId) {
	if ctx.recycle_tx.try_send(tenant.clone()).is_err() {
		warn!(tenant = %tenant, "recycle queue full; dropping reconnect request");
	}
}

async fn route_event(ctx: &DispatcherContext, tenant: &TenantId, ev: UpstreamEvent) {
	match ev {
		UpstreamEvent::StreamOnline { stream_id, started_at } => {
			if let Err(e) = ctx
				.reconciler
				.handle_stream_online(tenant, &ctx.creds, stream_id, started_at)
				.await
			{
				warn!(tenant = %tenant, error = %e, "stream.online reconciliation failed");
			}
		}

		UpstreamEvent::StreamOffline => {
			if let Err(e) = ctx.reconciler.handle_stream_offline(tenant).await {
				warn!(tenant = %tenant, error = %e, "stream.offline bookkeeping failed");
			}
		}

		UpstreamEvent::Follow { user_name } => {
			ctx.hub.publish_alert(tenant, AlertItem::NewFollower { user_name }).await;
		}

		UpstreamEvent::Subscribe {
			user_name,
			tier,
			is_gift,
		} => {
			ctx.hub
				.publish_alert(
					tenant,
					AlertItem::NewSubscription {
						user_name,
						tier,
						is_gift,
					},
				)
				.await;
		}

		UpstreamEvent::Cheer {
			user_name,
			bits,
			is_anonymous: _,
		} => {
			ctx.hub.publish_alert(tenant, AlertItem::Cheer { user_name, bits }).await;
		}

		UpstreamEvent::RedemptionAdd {
			user_name,
			reward_title,
			reward_cost,
		} => {
			ctx.hub
				.publish_alert(
					tenant,
					AlertItem::Redemption {
						user_name,
						reward_title,
						reward_cost,
					},
				)
				.await;
		}
	}
}
