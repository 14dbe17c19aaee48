#![forbid(unsafe_code)]

pub mod memory;
pub mod sqlite;

use tally_domain::{StreamId, TenantId};
use tally_platform::TenantCredentials;

/// One tenant record as held by the store.
#[derive(Debug, Clone)]
pub struct Tenant {
	pub id: TenantId,
	pub display_name: String,
	pub credentials: TenantCredentials,
}

/// Persisted live-session bookkeeping for a tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveState {
	pub active: bool,
	pub stream_id: Option<StreamId>,
}

/// Persistent per-tenant state consumed by the connection manager.
///
/// Reads and writes are atomic per tenant; the manager relies on that to
/// avoid lost updates between a reconnect-driven write and a manual-stop
/// clear.
#[async_trait::async_trait]
pub trait TenantStore: Send + Sync + 'static {
	/// Fetch a tenant record; `None` when the tenant is unknown.
	async fn get_tenant(&self, id: &TenantId) -> anyhow::Result<Option<Tenant>>;

	async fn get_live_state(&self, id: &TenantId) -> anyhow::Result<LiveState>;

	async fn set_live_state(&self, id: &TenantId, active: bool, stream_id: Option<&StreamId>) -> anyhow::Result<()>;

	/// Last stream id an outbound notification was sent for (the dedup key).
	async fn get_notified_stream_id(&self, id: &TenantId) -> anyhow::Result<Option<StreamId>>;

	async fn set_notified_stream_id(&self, id: &TenantId, stream_id: &StreamId) -> anyhow::Result<()>;

	async fn clear_notified_stream_id(&self, id: &TenantId) -> anyhow::Result<()>;

	/// Whether a tenant feature flag is enabled.
	async fn has_feature(&self, id: &TenantId, flag: &str) -> anyhow::Result<bool>;
}
