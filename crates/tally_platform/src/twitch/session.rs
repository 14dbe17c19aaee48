#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};
use url::Url;

use super::eventsub;
use crate::{EventSession, SessionCloseHandle, SessionMessage, SessionMessageTx};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type EventSubWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<EventSubWs>> + Send + Sync>;

/// Default keepalive when the welcome omits one.
const DEFAULT_KEEPALIVE_SECS: u64 = 10;

pub(crate) fn default_ws_connector() -> WsConnector {
	Arc::new(|url: Url| {
		Box::pin(async move {
			let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
				.await
				.context("connect_async to eventsub ws")?;
			Ok(ws)
		}) as BoxFuture<'static, anyhow::Result<EventSubWs>>
	})
}

async fn read_until_welcome(ws: &mut EventSubWs) -> anyhow::Result<eventsub::EventSubWelcomeSession> {
	loop {
		let Some(msg) = ws.next().await else {
			return Err(anyhow::anyhow!("ws closed before welcome"));
		};
		let msg = msg.context("ws read")?;

		match msg {
			Message::Text(t) => {
				let ty = eventsub::peek_message_type(&t)?;
				if ty == "session_welcome" {
					let welcome = eventsub::parse_welcome(&t)?;
					return Ok(welcome.payload.session);
				}
			}
			Message::Ping(p) => {
				let _ = ws.send(Message::Pong(p)).await;
			}
			Message::Close(c) => {
				anyhow::bail!("ws closed before welcome: close={c:?}");
			}
			_ => {}
		}
	}
}

/// Connect the EventSub WebSocket, wait for `session_welcome`, and spawn a
/// pump task feeding decoded [`SessionMessage`]s into a bounded channel.
pub(crate) async fn connect_session(
	ws_url: &str,
	connector: WsConnector,
	channel_capacity: usize,
) -> anyhow::Result<EventSession> {
	let url = Url::parse(ws_url).context("parse eventsub ws url")?;

	let mut ws = connector(url).await?;
	let welcome = read_until_welcome(&mut ws).await?;

	let keepalive_secs = welcome.keepalive_timeout_seconds.unwrap_or(DEFAULT_KEEPALIVE_SECS);
	let session_id = welcome.id;

	let (tx, rx) = mpsc::channel::<SessionMessage>(channel_capacity);
	let (close_tx, close_rx) = oneshot::channel::<()>();

	debug!(session_id = %session_id, keepalive_secs, "eventsub session established");

	tokio::spawn(pump(ws, tx, close_rx, session_id.clone()));

	Ok(EventSession {
		session_id,
		keepalive_timeout: Duration::from_secs(keepalive_secs),
		messages: rx,
		close: SessionCloseHandle::new(close_tx),
	})
}

fn forward(tx: &SessionMessageTx, session_id: &str, msg: SessionMessage) {
	if tx.try_send(msg).is_err() {
		metrics::counter!("tally_session_dropped_messages_total").increment(1);
		debug!(session_id = %session_id, "session channel full; dropping message");
	}
}

async fn pump(mut ws: EventSubWs, tx: SessionMessageTx, mut close_rx: oneshot::Receiver<()>, session_id: String) {
	let reason = loop {
		tokio::select! {
			_ = &mut close_rx => {
				let _ = ws.close(None).await;
				break None;
			}

			msg = ws.next() => {
				let Some(msg) = msg else {
					break Some("transport ended".to_string());
				};

				let msg = match msg {
					Ok(m) => m,
					Err(e) => break Some(format!("ws read error: {e}")),
				};

				match msg {
					Message::Text(t) => {
						let ty = match eventsub::peek_message_type(&t) {
							Ok(ty) => ty,
							Err(e) => {
								warn!(session_id = %session_id, error = %e, "unparseable eventsub frame");
								continue;
							}
						};

						match ty.as_str() {
							"session_keepalive" => {
								forward(&tx, &session_id, SessionMessage::Keepalive);
							}
							"session_reconnect" => {
								forward(&tx, &session_id, SessionMessage::ReconnectRequested);
							}
							"revocation" => match eventsub::parse_revocation(&t) {
								Ok(rev) => {
									forward(
										&tx,
										&session_id,
										SessionMessage::Revoked {
											subscription_type: rev.payload.subscription.r#type,
										},
									);
								}
								Err(e) => {
									warn!(session_id = %session_id, error = %e, "failed to parse revocation");
								}
							},
							"notification" => match eventsub::decode_notification(&t) {
								Ok(Some(ev)) => {
									forward(&tx, &session_id, SessionMessage::Event(ev));
								}
								Ok(None) => {}
								Err(e) => {
									warn!(session_id = %session_id, error = %e, "failed to decode notification");
								}
							},
							_ => {}
						}
					}

					Message::Ping(p) => {
						let _ = ws.send(Message::Pong(p)).await;
						forward(&tx, &session_id, SessionMessage::Keepalive);
					}

					Message::Pong(_) => {
						forward(&tx, &session_id, SessionMessage::Keepalive);
					}

					Message::Close(frame) => {
						break Some(format!("ws closed: {frame:?}"));
					}

					_ => {}
				}
			}
		}
	};

	if let Some(reason) = reason {
		// Deliberate close has no Closed message; the registry initiated it.
		let _ = tx.send(SessionMessage::Closed { reason }).await;
	}
}
