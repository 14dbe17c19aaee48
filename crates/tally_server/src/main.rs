#![forbid(unsafe_code)]

mod admin;
mod config;
mod hub;
mod live;
mod notify;
mod store;
mod util;


use std::path::PathBuf;
use std::sync::Arc;

use tally_domain::TenantId;
use tally_platform::twitch::{TwitchConfig, TwitchUpstream};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::admin::{AdminState, HealthState, spawn_admin_server};
use crate::hub::{TenantHub, TenantHubConfig};
use crate::live::registry::{ConnectionRegistry, RegistryConfig};
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::store::TenantStore;
use crate::store::memory::MemoryTenantStore;
use crate::store::sqlite::SqliteTenantStore;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: tally_server [--config path]\n\
\n\
Options:\n\
\t--config  Path to config TOML (default: ~/.tally/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path: Option<PathBuf> = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tally_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("tally_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let config_path = match parse_args() {
		Some(p) => p,
		None => config::default_config_path()?,
	};
	let server_cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let store: Arc<dyn TenantStore> = match server_cfg.store.database_url.as_deref() {
		Some(url) => {
			info!("connecting tenant store");
			Arc::new(SqliteTenantStore::connect(url).await?)
		}
		None => {
			warn!("no store.database_url configured; using in-memory tenant store");
			Arc::new(MemoryTenantStore::new())
		}
	};

	let mut twitch_cfg = TwitchConfig::default();
	if let Some(ws_url) = server_cfg.twitch.eventsub_ws_url.clone() {
		twitch_cfg.eventsub_ws_url = ws_url;
	}
	if let Some(base_url) = server_cfg.twitch.helix_base_url.clone() {
		twitch_cfg.helix_base_url = base_url;
	}
	if let Some(capacity) = server_cfg.twitch.session_channel_capacity {
		twitch_cfg.session_channel_capacity = capacity;
	}
	let upstream = Arc::new(TwitchUpstream::new(twitch_cfg));

	let notifier: Arc<dyn Notifier> = match server_cfg.notify.webhook_url.as_deref() {
		Some(url) => {
			let endpoint = url::Url::parse(url)?;
			info!(endpoint = %endpoint, "webhook notifier configured");
			Arc::new(WebhookNotifier::new(endpoint)?)
		}
		None => {
			warn!("no notify.webhook_url configured; session-start notifications will only be logged");
			Arc::new(LogNotifier)
		}
	};

	let hub = TenantHub::new(TenantHubConfig::default());

	let mut registry_cfg = RegistryConfig::default();
	if let Some(grace) = server_cfg.live.keepalive_grace {
		registry_cfg.keepalive_grace = grace;
	}
	if let Some(delay) = server_cfg.live.restart_delay {
		registry_cfg.restart_delay = delay;
	}
	if let Some(attempts) = server_cfg.live.provision_max_attempts {
		registry_cfg.provisioner.max_attempts = attempts;
	}
	if let Some(base) = server_cfg.live.provision_backoff_base {
		registry_cfg.provisioner.backoff_base = base;
	}

	let registry = ConnectionRegistry::start(registry_cfg, store, upstream, notifier, hub);

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.admin_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_admin_server(
					addr,
					Arc::new(AdminState {
						registry: Arc::clone(&registry),
						health: health_state.clone(),
					}),
				);
				info!(%addr, "admin server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid admin bind address (expected host:port)"),
		}
	}

	health_state.mark_ready();

	for tenant in &server_cfg.live.autostart_tenants {
		let tenant = match TenantId::new(tenant.clone()) {
			Ok(t) => t,
			Err(e) => {
				warn!(tenant = %tenant, error = %e, "invalid autostart tenant id");
				continue;
			}
		};

		if let Err(e) = registry.subscribe(&tenant).await {
			warn!(tenant = %tenant, error = %e, "autostart subscribe failed; retry via admin endpoint");
		}
	}

	info!("tally server running; ctrl-c to stop");
	tokio::signal::ctrl_c().await?;
	info!("shutdown requested");

	Ok(())
}
