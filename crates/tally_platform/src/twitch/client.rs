#![forbid(unsafe_code)]

use anyhow::Context;
use tally_domain::EventKind;
use tracing::debug;
use url::Url;

use super::helix::HelixClient;
use super::session::{self, WsConnector};
use crate::{
	ChannelInfo, EventSession, RemoteSubscription, StreamInfo, SubscriptionHandle, TenantCredentials, UpstreamClient,
};

/// Twitch upstream configuration.
#[derive(Clone)]
pub struct TwitchConfig {
	pub eventsub_ws_url: String,
	pub helix_base_url: String,

	/// Capacity of each session's decoded-message channel.
	pub session_channel_capacity: usize,

	/// Injectable WebSocket connector (tests swap in an in-process stream).
	pub ws_connector: Option<WsConnector>,
}

impl Default for TwitchConfig {
	fn default() -> Self {
		Self {
			eventsub_ws_url: "wss://eventsub.wss.twitch.tv/ws".to_string(),
			helix_base_url: "https://api.twitch.tv".to_string(),
			session_channel_capacity: 256,
			ws_connector: None,
		}
	}
}

/// The real [`UpstreamClient`]: Helix REST plus the EventSub WebSocket.
pub struct TwitchUpstream {
	cfg: TwitchConfig,
}

impl TwitchUpstream {
	pub fn new(cfg: TwitchConfig) -> Self {
		Self { cfg }
	}

	fn helix_base_url(&self) -> anyhow::Result<Url> {
		Url::parse(&self.cfg.helix_base_url).context("parse helix_base_url")
	}

	fn helix_client(&self, creds: &TenantCredentials) -> anyhow::Result<HelixClient> {
		if creds.client_id.trim().is_empty() {
			return Err(anyhow::anyhow!("missing twitch client_id"));
		}
		if creds.user_access_token.expose().trim().is_empty() {
			return Err(anyhow::anyhow!("missing twitch user access token"));
		}

		HelixClient::new(
			self.helix_base_url()?,
			creds.client_id.clone(),
			creds.user_access_token.expose().to_string(),
		)
	}

	fn ws_connector(&self) -> WsConnector {
		match &self.cfg.ws_connector {
			Some(c) => c.clone(),
			None => session::default_ws_connector(),
		}
	}
}

#[async_trait::async_trait]
impl UpstreamClient for TwitchUpstream {
	async fn open_session(&self, creds: &TenantCredentials) -> anyhow::Result<EventSession> {
		// Credentials are validated up front so a bad tenant fails before the
		// socket is opened.
		let _ = self.helix_client(creds)?;

		session::connect_session(
			&self.cfg.eventsub_ws_url,
			self.ws_connector(),
			self.cfg.session_channel_capacity,
		)
		.await
	}

	async fn list_subscriptions(&self, creds: &TenantCredentials) -> anyhow::Result<Vec<RemoteSubscription>> {
		let helix = self.helix_client(creds)?;
		let subs = helix.list_all_eventsub_subscriptions().await?;

		Ok(subs
			.into_iter()
			.map(|s| RemoteSubscription {
				id: s.id,
				subscription_type: s.r#type,
				cost: s.cost,
			})
			.collect())
	}

	async fn delete_subscription(&self, creds: &TenantCredentials, subscription_id: &str) -> anyhow::Result<()> {
		let helix = self.helix_client(creds)?;
		helix.delete_subscription(subscription_id).await
	}

	async fn create_subscription(
		&self,
		creds: &TenantCredentials,
		kind: EventKind,
		session_id: &str,
	) -> anyhow::Result<SubscriptionHandle> {
		let helix = self.helix_client(creds)?;
		let created = helix
			.create_subscription(kind, &creds.broadcaster_user_id, session_id)
			.await?;

		if let (Some(total), Some(max)) = (created.total_cost, created.max_total_cost) {
			debug!(kind = %kind, total_cost = total, max_total_cost = max, "eventsub cost after create");
		}

		let sub = created
			.data
			.into_iter()
			.next()
			.context("helix create subscription returned empty data")?;

		Ok(SubscriptionHandle {
			id: sub.id,
			kind,
			cost: sub.cost,
		})
	}

	async fn channel_info(&self, creds: &TenantCredentials) -> anyhow::Result<ChannelInfo> {
		let helix = self.helix_client(creds)?;
		let info = helix.get_channel_info(&creds.broadcaster_user_id).await?;

		Ok(ChannelInfo {
			title: info.title,
			category: info.game_name,
		})
	}

	async fn stream_info(&self, creds: &TenantCredentials) -> anyhow::Result<Option<StreamInfo>> {
		let helix = self.helix_client(creds)?;
		let Some(stream) = helix.get_stream(&creds.broadcaster_user_id).await? else {
			return Ok(None);
		};

		// Thumbnail URLs arrive as a `{width}x{height}` template.
		let thumbnail_url = stream
			.thumbnail_url
			.map(|t| t.replace("{width}", "1280").replace("{height}", "720"));

		Ok(Some(StreamInfo {
			viewer_count: stream.viewer_count,
			thumbnail_url,
		}))
	}
}
