#![forbid(unsafe_code)]

pub mod twitch;

use std::fmt;
use std::time::{Duration, SystemTime};

use tally_domain::{EventKind, StreamId};
use tokio::sync::{mpsc, oneshot};

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Per-tenant upstream credentials, owned by the tenant store.
#[derive(Debug, Clone)]
pub struct TenantCredentials {
	pub client_id: String,
	pub user_access_token: SecretString,
	/// Platform user id of the broadcaster the tenant streams as.
	pub broadcaster_user_id: String,
}

/// Handle for one provisioned upstream event subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
	pub id: String,
	pub kind: EventKind,
	/// Cost charged against the platform's per-credential ceiling.
	pub cost: u64,
}

/// One subscription as reported by the upstream list call.
///
/// Kept as the raw type string so cleanup can also tear down kinds this
/// build no longer recognizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSubscription {
	pub id: String,
	pub subscription_type: String,
	pub cost: u64,
}

/// Channel metadata fetched out-of-band of the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
	pub title: String,
	pub category: String,
}

/// Live-stream details, present only while the broadcaster is live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
	pub viewer_count: u64,
	pub thumbnail_url: Option<String>,
}

/// Decoded upstream event with display data already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
	StreamOnline {
		stream_id: StreamId,
		started_at: SystemTime,
	},
	StreamOffline,
	Follow {
		user_name: String,
	},
	Subscribe {
		user_name: String,
		tier: String,
		is_gift: bool,
	},
	Cheer {
		user_name: Option<String>,
		bits: u64,
		is_anonymous: bool,
	},
	RedemptionAdd {
		user_name: String,
		reward_title: String,
		reward_cost: u64,
	},
}

/// One inbound message from a tenant's event session.
///
/// Every variant counts as liveness for the health monitor, keepalives and
/// protocol pings included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMessage {
	Keepalive,
	Event(UpstreamEvent),

	/// Upstream asked us to move the session; treated like a transport drop.
	ReconnectRequested,

	/// Upstream revoked one subscription (authorization or version issues).
	Revoked {
		subscription_type: String,
	},

	/// The transport ended; no further messages will arrive.
	Closed {
		reason: String,
	},
}

/// Receiver half of a session's message stream.
pub type SessionMessageRx = mpsc::Receiver<SessionMessage>;
pub type SessionMessageTx = mpsc::Sender<SessionMessage>;

/// Handle used to close a running session's transport.
#[derive(Debug)]
pub struct SessionCloseHandle {
	tx: Option<oneshot::Sender<()>>,
}

impl SessionCloseHandle {
	pub fn new(tx: oneshot::Sender<()>) -> Self {
		Self { tx: Some(tx) }
	}

	/// Ask the session pump to close the transport. Idempotent.
	pub fn close(&mut self) {
		if let Some(tx) = self.tx.take() {
			let _ = tx.send(());
		}
	}
}

/// One open event-subscription session for a tenant.
#[derive(Debug)]
pub struct EventSession {
	/// Upstream-assigned session id; required when provisioning subscriptions.
	pub session_id: String,

	/// Negotiated keepalive interval; silence beyond this (plus grace) means
	/// the connection is dead.
	pub keepalive_timeout: Duration,

	pub messages: SessionMessageRx,

	pub close: SessionCloseHandle,
}

/// Upstream error classes relevant to retry/abort decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorCategory {
	Auth,
	RateLimit,
	Conflict,
	NotFound,
	BadRequest,
	ServerError,
	Other,
}

/// Categorize an upstream error from its message text.
///
/// The HTTP client folds status lines into the error chain, so matching on
/// the rendered text covers both transport and API-level failures.
pub fn categorize_upstream_error(err: &anyhow::Error) -> UpstreamErrorCategory {
	let err_str = err.to_string().to_ascii_lowercase();
	if err_str.contains("auth failed") || err_str.contains("401") || err_str.contains("403") {
		UpstreamErrorCategory::Auth
	} else if err_str.contains("too many requests") || err_str.contains("rate limit") || err_str.contains("429") {
		UpstreamErrorCategory::RateLimit
	} else if err_str.contains("conflict") || err_str.contains("409") {
		UpstreamErrorCategory::Conflict
	} else if err_str.contains("not found") || err_str.contains("404") {
		UpstreamErrorCategory::NotFound
	} else if err_str.contains("bad request") || err_str.contains("400") {
		UpstreamErrorCategory::BadRequest
	} else if err_str.contains("internal server error") || err_str.contains("500") || err_str.contains("503") {
		UpstreamErrorCategory::ServerError
	} else {
		UpstreamErrorCategory::Other
	}
}

/// The seam between the connection manager and the streaming platform.
///
/// The real implementation is [`twitch::TwitchUpstream`]; tests drive the
/// manager through an in-process double.
#[async_trait::async_trait]
pub trait UpstreamClient: Send + Sync + 'static {
	/// Open a real-time event session for the tenant's credentials.
	async fn open_session(&self, creds: &TenantCredentials) -> anyhow::Result<EventSession>;

	/// List every subscription currently held by the tenant's credentials.
	async fn list_subscriptions(&self, creds: &TenantCredentials) -> anyhow::Result<Vec<RemoteSubscription>>;

	/// Delete one subscription by id.
	async fn delete_subscription(&self, creds: &TenantCredentials, subscription_id: &str) -> anyhow::Result<()>;

	/// Create one subscription of `kind` bound to `session_id`.
	async fn create_subscription(
		&self,
		creds: &TenantCredentials,
		kind: EventKind,
		session_id: &str,
	) -> anyhow::Result<SubscriptionHandle>;

	/// Fetch channel title/category for the tenant's broadcaster.
	async fn channel_info(&self, creds: &TenantCredentials) -> anyhow::Result<ChannelInfo>;

	/// Fetch live-stream details; `None` when the broadcaster is not live
	/// (or the platform has not yet observed the stream).
	async fn stream_info(&self, creds: &TenantCredentials) -> anyhow::Result<Option<StreamInfo>>;
}

/// Generate an opaque session id (used by test doubles and diagnostics).
pub fn new_session_id() -> String {
	uuid::Uuid::new_v4().to_string()
}
