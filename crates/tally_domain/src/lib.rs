#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown event kind: {0}")]
	UnknownEventKind(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// One independent broadcaster account using the system.
///
/// All connection and notification state is partitioned by this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
	/// Create a non-empty `TenantId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for TenantId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for TenantId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		TenantId::new(s.to_string())
	}
}

/// Platform-assigned identifier for one live stream.
///
/// Stable across transport reconnects within the same live session, which is
/// what makes it usable as the notification dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
	/// Create a non-empty `StreamId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for StreamId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for StreamId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		StreamId::new(s.to_string())
	}
}

/// Kinds of upstream real-time events a tenant session can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
	StreamOnline,
	StreamOffline,
	Follow,
	Subscribe,
	Cheer,
	RedemptionAdd,
}

impl EventKind {
	/// The upstream EventSub subscription type string.
	pub const fn as_subscription_type(self) -> &'static str {
		match self {
			EventKind::StreamOnline => "stream.online",
			EventKind::StreamOffline => "stream.offline",
			EventKind::Follow => "channel.follow",
			EventKind::Subscribe => "channel.subscribe",
			EventKind::Cheer => "channel.cheer",
			EventKind::RedemptionAdd => "channel.channel_points_custom_reward_redemption.add",
		}
	}

	/// Core lifecycle kinds are provisioned unconditionally; their failure
	/// fails the whole session bring-up.
	pub const fn is_core(self) -> bool {
		matches!(self, EventKind::StreamOnline | EventKind::StreamOffline)
	}

	/// Tenant feature flag gating this kind, if any.
	pub const fn feature_flag(self) -> Option<&'static str> {
		match self {
			EventKind::StreamOnline | EventKind::StreamOffline => None,
			EventKind::Follow => Some("follow_alerts"),
			EventKind::Subscribe => Some("sub_alerts"),
			EventKind::Cheer => Some("bit_alerts"),
			EventKind::RedemptionAdd => Some("channel_points"),
		}
	}

	/// All kinds in provisioning order: core lifecycle first.
	pub const fn all() -> [EventKind; 6] {
		[
			EventKind::StreamOnline,
			EventKind::StreamOffline,
			EventKind::Follow,
			EventKind::Subscribe,
			EventKind::Cheer,
			EventKind::RedemptionAdd,
		]
	}
}

impl fmt::Display for EventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_subscription_type())
	}
}

impl FromStr for EventKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s {
			"stream.online" => Ok(EventKind::StreamOnline),
			"stream.offline" => Ok(EventKind::StreamOffline),
			"channel.follow" => Ok(EventKind::Follow),
			"channel.subscribe" => Ok(EventKind::Subscribe),
			"channel.cheer" => Ok(EventKind::Cheer),
			"channel.channel_points_custom_reward_redemption.add" => Ok(EventKind::RedemptionAdd),
			other => Err(ParseIdError::UnknownEventKind(other.to_string())),
		}
	}
}

/// Lifecycle of one tenant's upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
	Disconnected,
	Provisioning,
	Active,
	Reconnecting,
	Stopped,
}

impl LifecycleState {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			LifecycleState::Disconnected => "disconnected",
			LifecycleState::Provisioning => "provisioning",
			LifecycleState::Active => "active",
			LifecycleState::Reconnecting => "reconnecting",
			LifecycleState::Stopped => "stopped",
		}
	}
}

impl fmt::Display for LifecycleState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// User-visible session status published to a tenant's UI room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
	Ready,
	Pending,
	Failed,
	Disabled,
	Sent,
}

impl SessionStatus {
	pub const fn as_str(self) -> &'static str {
		match self {
			SessionStatus::Ready => "ready",
			SessionStatus::Pending => "pending",
			SessionStatus::Failed => "failed",
			SessionStatus::Disabled => "disabled",
			SessionStatus::Sent => "sent",
		}
	}
}

impl fmt::Display for SessionStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn event_kind_parse_and_display() {
		assert_eq!("stream.online".parse::<EventKind>().unwrap(), EventKind::StreamOnline);
		assert_eq!(
			"channel.channel_points_custom_reward_redemption.add".parse::<EventKind>().unwrap(),
			EventKind::RedemptionAdd
		);
		assert_eq!(EventKind::Cheer.to_string(), "channel.cheer");
		assert!("stream.sideways".parse::<EventKind>().is_err());
	}

	#[test]
	fn core_kinds_lead_provisioning_order() {
		let kinds = EventKind::all();
		assert!(kinds[0].is_core());
		assert!(kinds[1].is_core());
		assert!(kinds[2..].iter().all(|k| !k.is_core()));
	}

	#[test]
	fn gated_kinds_have_flags_and_core_kinds_do_not() {
		assert_eq!(EventKind::StreamOnline.feature_flag(), None);
		assert_eq!(EventKind::Follow.feature_flag(), Some("follow_alerts"));
		assert_eq!(EventKind::RedemptionAdd.feature_flag(), Some("channel_points"));
	}

	#[test]
	fn rejects_empty_ids() {
		assert!(TenantId::new("").is_err());
		assert!(StreamId::new("   ").is_err());
		assert!("".parse::<TenantId>().is_err());
	}
}
