#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tally_domain::{StreamId, TenantId};

use super::{LiveState, Tenant, TenantStore};

#[derive(Debug, Default)]
struct TenantState {
	live: LiveState,
	notified_stream_id: Option<StreamId>,
	features: HashSet<String>,
}

/// In-memory [`TenantStore`] for tests and single-process development.
#[derive(Default)]
pub struct MemoryTenantStore {
	tenants: Mutex<HashMap<TenantId, Tenant>>,
	state: Mutex<HashMap<TenantId, TenantState>>,
}

impl MemoryTenantStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Seed a tenant record (dev/test wiring; production tenants live in the
	/// persistent store).
	#[allow(dead_code)]
	pub fn insert_tenant(&self, tenant: Tenant) {
		self.tenants.lock().insert(tenant.id.clone(), tenant);
	}

	#[allow(dead_code)]
	pub fn enable_feature(&self, id: &TenantId, flag: &str) {
		self.state.lock().entry(id.clone()).or_default().features.insert(flag.to_string());
	}
}

#[async_trait::async_trait]
impl TenantStore for MemoryTenantStore {
	async fn get_tenant(&self, id: &TenantId) -> anyhow::Result<Option<Tenant>> {
		Ok(self.tenants.lock().get(id).cloned())
	}

	async fn get_live_state(&self, id: &TenantId) -> anyhow::Result<LiveState> {
		Ok(self.state.lock().get(id).map(|s| s.live.clone()).unwrap_or_default())
	}

	async fn set_live_state(&self, id: &TenantId, active: bool, stream_id: Option<&StreamId>) -> anyhow::Result<()> {
		let mut state = self.state.lock();
		let entry = state.entry(id.clone()).or_default();
		entry.live = LiveState {
			active,
			stream_id: stream_id.cloned(),
		};
		Ok(())
	}

	async fn get_notified_stream_id(&self, id: &TenantId) -> anyhow::Result<Option<StreamId>> {
		Ok(self.state.lock().get(id).and_then(|s| s.notified_stream_id.clone()))
	}

	async fn set_notified_stream_id(&self, id: &TenantId, stream_id: &StreamId) -> anyhow::Result<()> {
		self.state.lock().entry(id.clone()).or_default().notified_stream_id = Some(stream_id.clone());
		Ok(())
	}

	async fn clear_notified_stream_id(&self, id: &TenantId) -> anyhow::Result<()> {
		if let Some(st) = self.state.lock().get_mut(id) {
			st.notified_stream_id = None;
		}
		Ok(())
	}

	async fn has_feature(&self, id: &TenantId, flag: &str) -> anyhow::Result<bool> {
		Ok(self.state.lock().get(id).is_some_and(|s| s.features.contains(flag)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn tenant_id(id: &str) -> TenantId {
		TenantId::new(id.to_string()).expect("valid tenant id")
	}

	#[tokio::test]
	async fn unknown_tenant_reads_default_state() {
		let store = MemoryTenantStore::new();
		let t = tenant_id("t1");

		assert!(store.get_tenant(&t).await.unwrap().is_none());
		assert_eq!(store.get_live_state(&t).await.unwrap(), LiveState::default());
		assert!(store.get_notified_stream_id(&t).await.unwrap().is_none());
		assert!(!store.has_feature(&t, "follow_alerts").await.unwrap());
	}

	#[tokio::test]
	async fn notified_id_survives_live_flag_clear() {
		let store = MemoryTenantStore::new();
		let t = tenant_id("t1");
		let stream = StreamId::new("s-1").unwrap();

		store.set_notified_stream_id(&t, &stream).await.unwrap();
		store.set_live_state(&t, true, Some(&stream)).await.unwrap();
		store.set_live_state(&t, false, None).await.unwrap();

		assert_eq!(store.get_notified_stream_id(&t).await.unwrap(), Some(stream));

		store.clear_notified_stream_id(&t).await.unwrap();
		assert!(store.get_notified_stream_id(&t).await.unwrap().is_none());
	}
}
