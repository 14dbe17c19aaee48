#![forbid(unsafe_code)]

mod client;
pub(crate) mod eventsub;
pub(crate) mod helix;
pub(crate) mod session;

pub use client::{TwitchConfig, TwitchUpstream};
pub use session::{EventSubWs, WsConnector};
