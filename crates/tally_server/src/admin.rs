#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tally_domain::TenantId;
use tokio::net::TcpListener;
use tracing::warn;

use crate::live::registry::ConnectionRegistry;

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Operational surface: lifecycle commands and status snapshots, plus
/// liveness/readiness probes.
pub struct AdminState {
	pub registry: Arc<ConnectionRegistry>,
	pub health: HealthState,
}

pub fn spawn_admin_server(bind: SocketAddr, state: Arc<AdminState>) {
	tokio::spawn(async move {
		if let Err(err) = run_admin_server(bind, state).await {
			warn!(error = %err, "admin server stopped");
		}
	});
}

async fn run_admin_server(bind: SocketAddr, state: Arc<AdminState>) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = Arc::clone(&state);
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_request(req, Arc::clone(&state)));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "admin connection error");
			}
		});
	}
}

fn plain(status: StatusCode, body: &'static [u8]) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.body(Full::new(Bytes::from_static(body)))
		.unwrap()
}

fn json(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.header("content-type", "application/json")
		.body(Full::new(Bytes::from(body.to_string())))
		.unwrap()
}

fn error_json(status: StatusCode, err: impl std::fmt::Display) -> Response<Full<Bytes>> {
	json(status, serde_json::json!({ "error": err.to_string() }))
}

async fn handle_request(req: Request<Incoming>, state: Arc<AdminState>) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let path = req.uri().path().to_string();
	let method = req.method().clone();

	match (method.clone(), path.as_str()) {
		(Method::GET, "/healthz") => return Ok(plain(StatusCode::OK, b"ok")),
		(Method::GET, "/readyz") => {
			return Ok(if state.health.is_ready() {
				plain(StatusCode::OK, b"ready")
			} else {
				plain(StatusCode::SERVICE_UNAVAILABLE, b"not-ready")
			});
		}
		(Method::GET, "/status") => {
			let all = state.registry.status_all().await;
			return Ok(json(
				StatusCode::OK,
				serde_json::to_value(all).unwrap_or_else(|_| serde_json::json!([])),
			));
		}
		_ => {}
	}

	// Tenant-scoped routes: /tenants/{id}/{action}
	let mut parts = path.trim_start_matches('/').splitn(3, '/');
	let (root, id, action) = (parts.next(), parts.next(), parts.next());

	if root != Some("tenants") {
		return Ok(plain(StatusCode::NOT_FOUND, b""));
	}

	let tenant = match id.map(TenantId::new) {
		Some(Ok(t)) => t,
		_ => return Ok(error_json(StatusCode::BAD_REQUEST, "invalid tenant id")),
	};

	match (method, action) {
		(Method::GET, Some("status")) => match state.registry.status(&tenant).await {
			Some(snapshot) => Ok(json(
				StatusCode::OK,
				serde_json::to_value(snapshot).unwrap_or_else(|_| serde_json::json!({})),
			)),
			None => Ok(error_json(StatusCode::NOT_FOUND, "no connection state for tenant")),
		},

		(Method::POST, Some("subscribe")) => match state.registry.subscribe(&tenant).await {
			Ok(()) => Ok(json(StatusCode::OK, serde_json::json!({ "ok": true }))),
			Err(e) => Ok(error_json(StatusCode::BAD_GATEWAY, e)),
		},

		(Method::POST, Some("unsubscribe")) => match state.registry.unsubscribe(&tenant, true).await {
			Ok(()) => Ok(json(StatusCode::OK, serde_json::json!({ "ok": true }))),
			Err(e) => Ok(error_json(StatusCode::BAD_GATEWAY, e)),
		},

		(Method::POST, Some("reconnect")) => match state.registry.force_reconnect(&tenant).await {
			Ok(()) => Ok(json(StatusCode::OK, serde_json::json!({ "ok": true }))),
			Err(e) => Ok(error_json(StatusCode::BAD_GATEWAY, e)),
		},

		(Method::POST, Some("reset-stream-state")) => match state.registry.reset_stream_state(&tenant).await {
			Ok(()) => Ok(json(StatusCode::OK, serde_json::json!({ "ok": true }))),
			Err(e) => Ok(error_json(StatusCode::BAD_GATEWAY, e)),
		},

		_ => Ok(plain(StatusCode::NOT_FOUND, b"")),
	}
}
