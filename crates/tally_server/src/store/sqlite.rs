#![forbid(unsafe_code)]

use anyhow::Context;
use tally_domain::{StreamId, TenantId};
use tally_platform::{SecretString, TenantCredentials};

use super::{LiveState, Tenant, TenantStore};

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS tenants (\
	id TEXT PRIMARY KEY,\
	display_name TEXT NOT NULL,\
	client_id TEXT NOT NULL,\
	user_access_token TEXT NOT NULL,\
	broadcaster_user_id TEXT NOT NULL\
);\
CREATE TABLE IF NOT EXISTS tenant_stream_state (\
	tenant_id TEXT PRIMARY KEY,\
	live_active INTEGER NOT NULL DEFAULT 0,\
	live_stream_id TEXT,\
	notified_stream_id TEXT\
);\
CREATE TABLE IF NOT EXISTS tenant_features (\
	tenant_id TEXT NOT NULL,\
	flag TEXT NOT NULL,\
	PRIMARY KEY (tenant_id, flag)\
);";

/// Sqlite-backed [`TenantStore`].
pub struct SqliteTenantStore {
	pool: sqlx::SqlitePool,
}

impl SqliteTenantStore {
	/// Connect and apply the schema.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if !database_url.starts_with("sqlite:") {
			return Err(anyhow::anyhow!("unsupported database_url (use sqlite:)"));
		}

		let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
		sqlx::raw_sql(SCHEMA).execute(&pool).await.context("apply sqlite schema")?;

		Ok(Self { pool })
	}

	/// Seed or update a tenant row. The tenant CRUD surface lives outside
	/// this process; this exists for bootstrapping and tests.
	#[allow(dead_code)]
	pub async fn upsert_tenant(&self, tenant: &Tenant) -> anyhow::Result<()> {
		sqlx::query(
			"INSERT INTO tenants (id, display_name, client_id, user_access_token, broadcaster_user_id) \
			VALUES (?, ?, ?, ?, ?) \
			ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name, \
			client_id = excluded.client_id, user_access_token = excluded.user_access_token, \
			broadcaster_user_id = excluded.broadcaster_user_id",
		)
		.bind(tenant.id.as_str())
		.bind(&tenant.display_name)
		.bind(&tenant.credentials.client_id)
		.bind(tenant.credentials.user_access_token.expose())
		.bind(&tenant.credentials.broadcaster_user_id)
		.execute(&self.pool)
		.await
		.context("upsert tenant")?;

		Ok(())
	}

	/// Turn a feature flag on or off for a tenant.
	#[allow(dead_code)]
	pub async fn set_feature(&self, id: &TenantId, flag: &str, enabled: bool) -> anyhow::Result<()> {
		if enabled {
			sqlx::query("INSERT OR IGNORE INTO tenant_features (tenant_id, flag) VALUES (?, ?)")
				.bind(id.as_str())
				.bind(flag)
				.execute(&self.pool)
				.await
				.context("insert feature flag")?;
		} else {
			sqlx::query("DELETE FROM tenant_features WHERE tenant_id = ? AND flag = ?")
				.bind(id.as_str())
				.bind(flag)
				.execute(&self.pool)
				.await
				.context("delete feature flag")?;
		}

		Ok(())
	}
}

#[async_trait::async_trait]
impl TenantStore for SqliteTenantStore {
	async fn get_tenant(&self, id: &TenantId) -> anyhow::Result<Option<Tenant>> {
		let row: Option<(String, String, String, String, String)> = sqlx::query_as(
			"SELECT id, display_name, client_id, user_access_token, broadcaster_user_id FROM tenants WHERE id = ?",
		)
		.bind(id.as_str())
		.fetch_optional(&self.pool)
		.await
		.context("select tenant")?;

		let Some((id, display_name, client_id, user_access_token, broadcaster_user_id)) = row else {
			return Ok(None);
		};

		Ok(Some(Tenant {
			id: TenantId::new(id).context("tenant id from row")?,
			display_name,
			credentials: TenantCredentials {
				client_id,
				user_access_token: SecretString::new(user_access_token),
				broadcaster_user_id,
			},
		}))
	}

	async fn get_live_state(&self, id: &TenantId) -> anyhow::Result<LiveState> {
		let row: Option<(i64, Option<String>)> =
			sqlx::query_as("SELECT live_active, live_stream_id FROM tenant_stream_state WHERE tenant_id = ?")
				.bind(id.as_str())
				.fetch_optional(&self.pool)
				.await
				.context("select live state")?;

		let Some((active, stream_id)) = row else {
			return Ok(LiveState::default());
		};

		let stream_id = match stream_id {
			Some(s) => Some(StreamId::new(s).context("live stream id from row")?),
			None => None,
		};

		Ok(LiveState {
			active: active != 0,
			stream_id,
		})
	}

	async fn set_live_state(&self, id: &TenantId, active: bool, stream_id: Option<&StreamId>) -> anyhow::Result<()> {
		sqlx::query(
			"INSERT INTO tenant_stream_state (tenant_id, live_active, live_stream_id) VALUES (?, ?, ?) \
			ON CONFLICT(tenant_id) DO UPDATE SET live_active = excluded.live_active, live_stream_id = excluded.live_stream_id",
		)
		.bind(id.as_str())
		.bind(if active { 1i64 } else { 0i64 })
		.bind(stream_id.map(|s| s.as_str().to_string()))
		.execute(&self.pool)
		.await
		.context("upsert live state")?;

		Ok(())
	}

	async fn get_notified_stream_id(&self, id: &TenantId) -> anyhow::Result<Option<StreamId>> {
		let row: Option<(Option<String>,)> =
			sqlx::query_as("SELECT notified_stream_id FROM tenant_stream_state WHERE tenant_id = ?")
				.bind(id.as_str())
				.fetch_optional(&self.pool)
				.await
				.context("select notified stream id")?;

		match row.and_then(|(s,)| s) {
			Some(s) => Ok(Some(StreamId::new(s).context("notified stream id from row")?)),
			None => Ok(None),
		}
	}

	async fn set_notified_stream_id(&self, id: &TenantId, stream_id: &StreamId) -> anyhow::Result<()> {
		sqlx::query(
			"INSERT INTO tenant_stream_state (tenant_id, notified_stream_id) VALUES (?, ?) \
			ON CONFLICT(tenant_id) DO UPDATE SET notified_stream_id = excluded.notified_stream_id",
		)
		.bind(id.as_str())
		.bind(stream_id.as_str())
		.execute(&self.pool)
		.await
		.context("upsert notified stream id")?;

		Ok(())
	}

	async fn clear_notified_stream_id(&self, id: &TenantId) -> anyhow::Result<()> {
		sqlx::query("UPDATE tenant_stream_state SET notified_stream_id = NULL WHERE tenant_id = ?")
			.bind(id.as_str())
			.execute(&self.pool)
			.await
			.context("clear notified stream id")?;

		Ok(())
	}

	async fn has_feature(&self, id: &TenantId, flag: &str) -> anyhow::Result<bool> {
		let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM tenant_features WHERE tenant_id = ? AND flag = ?")
			.bind(id.as_str())
			.bind(flag)
			.fetch_optional(&self.pool)
			.await
			.context("select feature flag")?;

		Ok(row.is_some())
	}
}
