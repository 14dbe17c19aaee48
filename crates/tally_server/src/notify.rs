#![forbid(unsafe_code)]

use anyhow::Context;
use serde::Serialize;
use tally_domain::TenantId;
use url::Url;

/// Payload for the single outbound notification per live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStartNotification {
	pub stream_id: String,
	pub title: String,
	pub category: String,
	/// RFC3339.
	pub started_at: String,
	pub thumbnail_url: Option<String>,
	pub viewer_count: u64,
}

/// Outbound notification collaborator. Fire-and-forget: the manager logs
/// failures and surfaces a status event, but never retries.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync + 'static {
	async fn send(&self, tenant: &TenantId, notification: &SessionStartNotification) -> anyhow::Result<()>;
}

/// Notifier for deployments with no webhook configured: logs and succeeds.
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
	async fn send(&self, tenant: &TenantId, notification: &SessionStartNotification) -> anyhow::Result<()> {
		tracing::info!(
			tenant = %tenant,
			stream_id = %notification.stream_id,
			title = %notification.title,
			"session-start notification (no webhook configured)"
		);
		Ok(())
	}
}

#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
	tenant: &'a str,
	kind: &'static str,
	#[serde(flatten)]
	payload: &'a SessionStartNotification,
}

/// Posts notifications as JSON to a configured webhook endpoint.
pub struct WebhookNotifier {
	http: reqwest::Client,
	endpoint: Url,
}

impl WebhookNotifier {
	pub fn new(endpoint: Url) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("tally/0.x (webhook)")
			.build()
			.context("build reqwest client")?;

		Ok(Self { http, endpoint })
	}
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
	async fn send(&self, tenant: &TenantId, notification: &SessionStartNotification) -> anyhow::Result<()> {
		let body = WebhookBody {
			tenant: tenant.as_str(),
			kind: "session_start",
			payload: notification,
		};

		let resp = self
			.http
			.post(self.endpoint.clone())
			.json(&body)
			.send()
			.await
			.context("webhook send")?;

		let status = resp.status();
		if !status.is_success() {
			let body = resp.text().await.unwrap_or_default();
			anyhow::bail!("webhook rejected notification: status={status} body={body}");
		}

		Ok(())
	}
}
