#![forbid(unsafe_code)]

use anyhow::Context;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tally_domain::EventKind;
use url::Url;

const EVENTSUB_SUBSCRIPTIONS_PATH: &str = "/helix/eventsub/subscriptions";
const CHANNELS_PATH: &str = "/helix/channels";
const STREAMS_PATH: &str = "/helix/streams";

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

async fn send_with_retry(req: reqwest::RequestBuilder, label: &'static str) -> anyhow::Result<reqwest::Response> {
	let retry_builder = req.try_clone();
	let resp = req.send().await.with_context(|| format!("helix {label} send"))?;
	let status = resp.status();

	if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
		let body = resp.text().await.unwrap_or_default();
		anyhow::bail!("helix auth failed (status={status}) body={body}");
	}

	if status == StatusCode::TOO_MANY_REQUESTS
		&& let Some(delay) = retry_delay_from_headers(resp.headers())
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(delay).await;
		let retry_resp = retry.send().await.with_context(|| format!("helix {label} retry send"))?;
		return Ok(retry_resp);
	}

	if status.is_server_error()
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(Duration::from_millis(250)).await;
		let retry_resp = retry.send().await.with_context(|| format!("helix {label} retry send"))?;
		return Ok(retry_resp);
	}

	Ok(resp)
}

#[derive(Clone, Debug)]
pub(crate) struct HelixClient {
	http: reqwest::Client,
	base_url: Url,
	client_id: String,
	bearer_token: String,
}

#[derive(Debug, Serialize)]
struct HelixBroadcasterOnlyCondition<'a> {
	broadcaster_user_id: &'a str,
}

#[derive(Debug, Serialize)]
struct HelixFollowCondition<'a> {
	broadcaster_user_id: &'a str,
	moderator_user_id: &'a str,
}

#[derive(Debug, Serialize)]
struct HelixCreateSubscriptionRequest<'a, TCondition> {
	#[serde(rename = "type")]
	r#type: &'static str,
	version: &'static str,
	condition: TCondition,
	transport: HelixWebsocketTransport<'a>,
}

#[derive(Debug, Serialize)]
pub(crate) struct HelixWebsocketTransport<'a> {
	pub(crate) method: &'a str,
	pub(crate) session_id: &'a str,
}

impl HelixClient {
	pub(crate) fn new(base_url: Url, client_id: String, bearer_token: String) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("tally/0.x (eventsub-ws)")
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			http,
			base_url,
			client_id,
			bearer_token,
		})
	}

	fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		req.header("Client-Id", &self.client_id)
			.header("Authorization", format!("Bearer {}", self.bearer_token))
	}

	fn url(&self, path_and_query: &str) -> anyhow::Result<Url> {
		self.base_url.join(path_and_query).context("join helix url")
	}

	const fn subscription_version(kind: EventKind) -> &'static str {
		match kind {
			// channel.follow v1 was retired; v2 requires a moderator in the condition.
			EventKind::Follow => "2",
			_ => "1",
		}
	}

	async fn create_eventsub_subscription<TCondition: Serialize>(
		&self,
		kind: &'static str,
		version: &'static str,
		session_id: &str,
		condition: TCondition,
	) -> anyhow::Result<HelixCreateSubscriptionResponse> {
		let url = self.url(EVENTSUB_SUBSCRIPTIONS_PATH)?;

		let req = HelixCreateSubscriptionRequest {
			r#type: kind,
			version,
			condition,
			transport: HelixWebsocketTransport {
				method: "websocket",
				session_id,
			},
		};

		let resp = send_with_retry(
			self.authed(self.http.post(url)).json(&req),
			"POST /helix/eventsub/subscriptions",
		)
		.await
		.with_context(|| format!("helix POST {EVENTSUB_SUBSCRIPTIONS_PATH} send (type={kind})"))?;

		let status = resp.status();
		let body = resp
			.text()
			.await
			.with_context(|| format!("helix POST {EVENTSUB_SUBSCRIPTIONS_PATH} read body (type={kind})"))?;

		if status == StatusCode::CONFLICT {
			anyhow::bail!("helix create subscription conflict (type={kind}): body={body}");
		}
		if status == StatusCode::TOO_MANY_REQUESTS {
			anyhow::bail!("helix create subscription rate limit (type={kind}): status={status} body={body}");
		}
		if !status.is_success() {
			anyhow::bail!("helix create subscription failed (type={kind}): status={status} body={body}");
		}

		serde_json::from_str(&body).with_context(|| format!("helix create subscription parse json (type={kind})"))
	}

	/// Create one EventSub subscription bound to a WebSocket session.
	pub(crate) async fn create_subscription(
		&self,
		kind: EventKind,
		broadcaster_user_id: &str,
		session_id: &str,
	) -> anyhow::Result<HelixCreateSubscriptionResponse> {
		let sub_type = kind.as_subscription_type();
		let version = Self::subscription_version(kind);

		match kind {
			EventKind::Follow => {
				self.create_eventsub_subscription(
					sub_type,
					version,
					session_id,
					HelixFollowCondition {
						broadcaster_user_id,
						moderator_user_id: broadcaster_user_id,
					},
				)
				.await
			}
			_ => {
				self.create_eventsub_subscription(
					sub_type,
					version,
					session_id,
					HelixBroadcasterOnlyCondition { broadcaster_user_id },
				)
				.await
			}
		}
	}

	pub(crate) async fn list_eventsub_subscriptions(
		&self,
		after: Option<&str>,
	) -> anyhow::Result<HelixListSubscriptionsResponse> {
		let mut path = EVENTSUB_SUBSCRIPTIONS_PATH.to_string();
		if let Some(after) = after {
			path.push_str("?after=");
			path.push_str(&urlencoding::encode(after));
		}

		let url = self.url(&path)?;

		let resp = send_with_retry(self.authed(self.http.get(url)), "GET /helix/eventsub/subscriptions")
			.await
			.context("helix GET /helix/eventsub/subscriptions send")?;

		let status = resp.status();
		let body = resp
			.text()
			.await
			.context("helix GET /helix/eventsub/subscriptions read body")?;

		if !status.is_success() {
			anyhow::bail!("helix list subscriptions failed: status={status} body={body}");
		}

		serde_json::from_str(&body).context("helix list subscriptions parse json")
	}

	/// List all subscriptions held by this client's credentials, following pagination.
	pub(crate) async fn list_all_eventsub_subscriptions(&self) -> anyhow::Result<Vec<HelixSubscriptionData>> {
		let mut out: Vec<HelixSubscriptionData> = Vec::new();
		let mut after: Option<String> = None;

		loop {
			let page = self.list_eventsub_subscriptions(after.as_deref()).await?;

			out.extend(page.data.into_iter());

			let next = page.pagination.and_then(|p| p.cursor);
			if next.is_none() {
				break;
			}
			after = next;
		}

		Ok(out)
	}

	pub(crate) async fn delete_subscription(&self, subscription_id: &str) -> anyhow::Result<()> {
		let url = self.url(&format!(
			"{base}?id={}",
			urlencoding::encode(subscription_id),
			base = EVENTSUB_SUBSCRIPTIONS_PATH
		))?;

		let resp = send_with_retry(self.authed(self.http.delete(url)), "DELETE /helix/eventsub/subscriptions")
			.await
			.context("helix DELETE /helix/eventsub/subscriptions send")?;

		let status = resp.status();
		if status == StatusCode::NO_CONTENT || status.is_success() {
			return Ok(());
		}

		let body = resp
			.text()
			.await
			.context("helix DELETE /helix/eventsub/subscriptions read body")?;
		anyhow::bail!("helix delete subscription failed: status={status} body={body}");
	}

	/// Fetch channel metadata (title + category) for a broadcaster.
	pub(crate) async fn get_channel_info(&self, broadcaster_id: &str) -> anyhow::Result<HelixChannelInfo> {
		let url = self.url(&format!(
			"{base}?broadcaster_id={b}",
			base = CHANNELS_PATH,
			b = urlencoding::encode(broadcaster_id),
		))?;

		let resp = send_with_retry(self.authed(self.http.get(url)), "GET /helix/channels")
			.await
			.context("helix GET /helix/channels send")?;

		let status = resp.status();
		let body = resp.text().await.context("helix GET /helix/channels read body")?;

		if !status.is_success() {
			anyhow::bail!("helix GET /helix/channels failed: status={status} body={body}");
		}

		let parsed: HelixChannelsResponse = serde_json::from_str(&body).context("helix channels parse json")?;
		parsed
			.data
			.into_iter()
			.next()
			.context("helix channels returned empty data")
	}

	/// Fetch live-stream details; `None` when the broadcaster is offline.
	pub(crate) async fn get_stream(&self, user_id: &str) -> anyhow::Result<Option<HelixStream>> {
		let url = self.url(&format!(
			"{base}?user_id={u}",
			base = STREAMS_PATH,
			u = urlencoding::encode(user_id),
		))?;

		let resp = send_with_retry(self.authed(self.http.get(url)), "GET /helix/streams")
			.await
			.context("helix GET /helix/streams send")?;

		let status = resp.status();
		let body = resp.text().await.context("helix GET /helix/streams read body")?;

		if !status.is_success() {
			anyhow::bail!("helix GET /helix/streams failed: status={status} body={body}");
		}

		let parsed: HelixStreamsResponse = serde_json::from_str(&body).context("helix streams parse json")?;
		Ok(parsed.data.into_iter().next())
	}
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixCreateSubscriptionResponse {
	pub(crate) data: Vec<HelixSubscriptionData>,

	#[allow(dead_code)]
	#[serde(default)]
	pub(crate) total: Option<u64>,

	#[serde(default)]
	pub(crate) total_cost: Option<u64>,

	#[serde(default)]
	pub(crate) max_total_cost: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixListSubscriptionsResponse {
	pub(crate) data: Vec<HelixSubscriptionData>,
	#[serde(default)]
	pub(crate) pagination: Option<HelixPagination>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixPagination {
	#[serde(default)]
	pub(crate) cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixSubscriptionData {
	pub(crate) id: String,

	#[allow(dead_code)]
	pub(crate) status: String,

	#[serde(rename = "type")]
	pub(crate) r#type: String,

	#[allow(dead_code)]
	pub(crate) version: String,

	#[allow(dead_code)]
	#[serde(default)]
	pub(crate) condition: serde_json::Value,

	#[allow(dead_code)]
	#[serde(default)]
	pub(crate) transport: Option<serde_json::Value>,

	#[serde(default)]
	pub(crate) cost: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixChannelsResponse {
	pub(crate) data: Vec<HelixChannelInfo>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixChannelInfo {
	#[allow(dead_code)]
	pub(crate) broadcaster_id: String,

	pub(crate) title: String,

	#[serde(default)]
	pub(crate) game_name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixStreamsResponse {
	pub(crate) data: Vec<HelixStream>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixStream {
	#[allow(dead_code)]
	pub(crate) id: String,

	pub(crate) viewer_count: u64,

	/// URL template containing `{width}`/`{height}` placeholders.
	#[serde(default)]
	pub(crate) thumbnail_url: Option<String>,
}
