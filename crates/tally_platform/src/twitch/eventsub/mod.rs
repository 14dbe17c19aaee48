#![forbid(unsafe_code)]

use std::time::SystemTime;

use anyhow::Context;
use serde::Deserialize;
use tally_domain::StreamId;

use crate::UpstreamEvent;

/// EventSub metadata (present on all WebSocket messages).
#[allow(dead_code)]
#[derive(Debug, Deserialize)]
pub(crate) struct EventSubMetadata {
	pub(crate) message_id: String,
	pub(crate) message_type: String,
	pub(crate) message_timestamp: String,

	#[serde(default)]
	pub(crate) subscription_type: Option<String>,
	#[serde(default)]
	pub(crate) subscription_version: Option<String>,
}

/// A lightweight peek struct to cheaply inspect message_type/subscription_type.
#[derive(Debug, Deserialize)]
pub(crate) struct EventSubMetadataPeek {
	pub(crate) metadata: EventSubMetadataPeekInner,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubMetadataPeekInner {
	pub(crate) message_type: String,
	#[serde(default)]
	pub(crate) subscription_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubWelcomeMessage {
	#[allow(dead_code)]
	pub(crate) metadata: EventSubMetadata,
	pub(crate) payload: EventSubWelcomePayload,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubWelcomePayload {
	pub(crate) session: EventSubWelcomeSession,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubWelcomeSession {
	pub(crate) id: String,

	#[allow(dead_code)]
	pub(crate) status: String,
	#[allow(dead_code)]
	pub(crate) connected_at: String,

	#[serde(default)]
	pub(crate) keepalive_timeout_seconds: Option<u64>,

	#[allow(dead_code)]
	#[serde(default)]
	pub(crate) reconnect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubRevocationMessage {
	#[allow(dead_code)]
	pub(crate) metadata: EventSubMetadata,
	pub(crate) payload: EventSubRevocationPayload,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubRevocationPayload {
	pub(crate) subscription: EventSubSubscription,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubNotification<TEvent> {
	#[allow(dead_code)]
	pub(crate) metadata: EventSubMetadata,
	pub(crate) payload: EventSubNotificationPayload<TEvent>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubNotificationPayload<TEvent> {
	#[allow(dead_code)]
	pub(crate) subscription: EventSubSubscription,
	pub(crate) event: TEvent,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubSubscription {
	#[allow(dead_code)]
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
	pub(crate) created_at: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StreamOnlineEvent {
	/// Platform stream id; the dedup key for outbound notifications.
	pub(crate) id: String,

	#[allow(dead_code)]
	pub(crate) broadcaster_user_id: String,
	#[allow(dead_code)]
	pub(crate) broadcaster_user_login: String,
	#[allow(dead_code)]
	pub(crate) broadcaster_user_name: String,

	#[serde(rename = "type")]
	#[allow(dead_code)]
	pub(crate) r#type: String,

	pub(crate) started_at: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StreamOfflineEvent {
	#[allow(dead_code)]
	pub(crate) broadcaster_user_id: String,
	#[allow(dead_code)]
	pub(crate) broadcaster_user_login: String,
	#[allow(dead_code)]
	pub(crate) broadcaster_user_name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChannelFollowEvent {
	#[allow(dead_code)]
	pub(crate) user_id: String,
	#[allow(dead_code)]
	pub(crate) user_login: String,
	pub(crate) user_name: String,

	#[allow(dead_code)]
	pub(crate) broadcaster_user_id: String,

	#[allow(dead_code)]
	pub(crate) followed_at: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChannelSubscribeEvent {
	#[allow(dead_code)]
	pub(crate) user_id: String,
	#[allow(dead_code)]
	pub(crate) user_login: String,
	pub(crate) user_name: String,

	#[allow(dead_code)]
	pub(crate) broadcaster_user_id: String,

	pub(crate) tier: String,
	pub(crate) is_gift: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChannelCheerEvent {
	pub(crate) is_anonymous: bool,

	#[allow(dead_code)]
	#[serde(default)]
	pub(crate) user_id: Option<String>,
	#[allow(dead_code)]
	#[serde(default)]
	pub(crate) user_login: Option<String>,
	#[serde(default)]
	pub(crate) user_name: Option<String>,

	#[allow(dead_code)]
	pub(crate) broadcaster_user_id: String,

	#[allow(dead_code)]
	#[serde(default)]
	pub(crate) message: Option<String>,

	pub(crate) bits: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RedemptionAddEvent {
	#[allow(dead_code)]
	pub(crate) id: String,

	#[allow(dead_code)]
	pub(crate) user_id: String,
	#[allow(dead_code)]
	pub(crate) user_login: String,
	pub(crate) user_name: String,

	#[allow(dead_code)]
	pub(crate) broadcaster_user_id: String,

	#[allow(dead_code)]
	#[serde(default)]
	pub(crate) user_input: Option<String>,

	pub(crate) reward: RedemptionReward,

	#[allow(dead_code)]
	pub(crate) redeemed_at: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RedemptionReward {
	#[allow(dead_code)]
	pub(crate) id: String,
	pub(crate) title: String,
	pub(crate) cost: u64,
}

/// Extract `metadata.message_type` from a raw EventSub WS JSON string.
pub(crate) fn peek_message_type(raw_json: &str) -> anyhow::Result<String> {
	let peek: EventSubMetadataPeek = serde_json::from_str(raw_json).context("parse EventSub metadata peek")?;
	Ok(peek.metadata.message_type)
}

/// Parse a raw WS message as `session_welcome`.
pub(crate) fn parse_welcome(raw_json: &str) -> anyhow::Result<EventSubWelcomeMessage> {
	serde_json::from_str(raw_json).context("parse session_welcome")
}

/// Parse a raw WS message as `revocation`.
pub(crate) fn parse_revocation(raw_json: &str) -> anyhow::Result<EventSubRevocationMessage> {
	serde_json::from_str(raw_json).context("parse revocation")
}

/// Convert an EventSub RFC3339 timestamp into `SystemTime`.
pub(crate) fn parse_timestamp_system_time(ts: &str) -> anyhow::Result<SystemTime> {
	let dt = chrono::DateTime::parse_from_rfc3339(ts).context("parse EventSub RFC3339 timestamp")?;
	Ok(SystemTime::from(dt.with_timezone(&chrono::Utc)))
}

fn parse_notification<TEvent: serde::de::DeserializeOwned>(
	raw_json: &str,
	label: &'static str,
) -> anyhow::Result<EventSubNotification<TEvent>> {
	serde_json::from_str(raw_json).with_context(|| format!("parse {label} notification"))
}

/// Decode a raw WS `notification` message into an [`UpstreamEvent`].
///
/// Returns `Ok(None)` for message or subscription types this system does not
/// consume, so new upstream kinds never break the read loop.
pub(crate) fn decode_notification(raw_json: &str) -> anyhow::Result<Option<UpstreamEvent>> {
	let peek: EventSubMetadataPeek = serde_json::from_str(raw_json).context("parse EventSub metadata peek")?;

	if peek.metadata.message_type != "notification" {
		return Ok(None);
	}

	match peek.metadata.subscription_type.as_deref() {
		Some("stream.online") => {
			let msg: EventSubNotification<StreamOnlineEvent> = parse_notification(raw_json, "stream.online")?;
			let stream_id =
				StreamId::new(msg.payload.event.id.clone()).context("construct StreamId from stream.online id")?;
			let started_at =
				parse_timestamp_system_time(&msg.payload.event.started_at).context("parse stream.online started_at")?;

			Ok(Some(UpstreamEvent::StreamOnline { stream_id, started_at }))
		}

		Some("stream.offline") => {
			let _msg: EventSubNotification<StreamOfflineEvent> = parse_notification(raw_json, "stream.offline")?;
			Ok(Some(UpstreamEvent::StreamOffline))
		}

		Some("channel.follow") => {
			let msg: EventSubNotification<ChannelFollowEvent> = parse_notification(raw_json, "channel.follow")?;
			Ok(Some(UpstreamEvent::Follow {
				user_name: msg.payload.event.user_name,
			}))
		}

		Some("channel.subscribe") => {
			let msg: EventSubNotification<ChannelSubscribeEvent> = parse_notification(raw_json, "channel.subscribe")?;
			Ok(Some(UpstreamEvent::Subscribe {
				user_name: msg.payload.event.user_name,
				tier: msg.payload.event.tier,
				is_gift: msg.payload.event.is_gift,
			}))
		}

		Some("channel.cheer") => {
			let msg: EventSubNotification<ChannelCheerEvent> = parse_notification(raw_json, "channel.cheer")?;
			let is_anonymous = msg.payload.event.is_anonymous;
			Ok(Some(UpstreamEvent::Cheer {
				user_name: if is_anonymous { None } else { msg.payload.event.user_name },
				bits: msg.payload.event.bits,
				is_anonymous,
			}))
		}

		Some("channel.channel_points_custom_reward_redemption.add") => {
			let msg: EventSubNotification<RedemptionAddEvent> =
				parse_notification(raw_json, "channel_points_custom_reward_redemption.add")?;
			Ok(Some(UpstreamEvent::RedemptionAdd {
				user_name: msg.payload.event.user_name,
				reward_title: msg.payload.event.reward.title,
				reward_cost: msg.payload.event.reward.cost,
			}))
		}

		_ => Ok(None),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn notification(subscription_type: &str, event: serde_json::Value) -> String {
		serde_json::json!({
			"metadata": {
				"message_id": "msg-1",
				"message_type": "notification",
				"message_timestamp": "2024-05-01T10:00:00.000000000Z",
				"subscription_type": subscription_type,
				"subscription_version": "1"
			},
			"payload": {
				"subscription": {
					"id": "sub-1",
					"status": "enabled",
					"type": subscription_type,
					"version": "1",
					"condition": {},
					"created_at": "2024-05-01T09:00:00Z"
				},
				"event": event
			}
		})
		.to_string()
	}

	#[test]
	fn decodes_stream_online_with_stream_id_and_start_time() {
		let raw = notification(
			"stream.online",
			serde_json::json!({
				"id": "9001",
				"broadcaster_user_id": "123",
				"broadcaster_user_login": "somestreamer",
				"broadcaster_user_name": "SomeStreamer",
				"type": "live",
				"started_at": "2024-05-01T10:00:00Z"
			}),
		);

		let decoded = decode_notification(&raw).unwrap().expect("stream.online decodes");
		match decoded {
			UpstreamEvent::StreamOnline { stream_id, started_at } => {
				assert_eq!(stream_id.as_str(), "9001");
				let expected = parse_timestamp_system_time("2024-05-01T10:00:00Z").unwrap();
				assert_eq!(started_at, expected);
			}
			other => panic!("expected StreamOnline, got {other:?}"),
		}
	}

	#[test]
	fn anonymous_cheer_drops_user_name() {
		let raw = notification(
			"channel.cheer",
			serde_json::json!({
				"is_anonymous": true,
				"user_id": null,
				"user_login": null,
				"user_name": null,
				"broadcaster_user_id": "123",
				"broadcaster_user_login": "somestreamer",
				"broadcaster_user_name": "SomeStreamer",
				"message": "cheer100",
				"bits": 100
			}),
		);

		let decoded = decode_notification(&raw).unwrap().expect("channel.cheer decodes");
		assert_eq!(
			decoded,
			UpstreamEvent::Cheer {
				user_name: None,
				bits: 100,
				is_anonymous: true
			}
		);
	}

	#[test]
	fn unknown_subscription_type_is_skipped_not_an_error() {
		let raw = notification("channel.some_future_thing", serde_json::json!({"whatever": 1}));
		assert!(decode_notification(&raw).unwrap().is_none());
	}

	proptest::proptest! {
		#[test]
		fn decode_never_panics_on_arbitrary_input(raw in "\\PC*") {
			// Garbage frames must fail as errors, not panics.
			let _ = decode_notification(&raw);
		}
	}

	#[test]
	fn keepalive_is_not_a_notification() {
		let raw = serde_json::json!({
			"metadata": {
				"message_id": "msg-2",
				"message_type": "session_keepalive",
				"message_timestamp": "2024-05-01T10:00:10Z"
			},
			"payload": {}
		})
		.to_string();

		assert!(decode_notification(&raw).unwrap().is_none());
	}
}
