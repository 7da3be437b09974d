//! Reference binary for the transparent gRPC forwarding proxy core: loads a
//! static YAML routing table, dials the configured backends, and serves the
//! transparent catch-all handler (§4.4) over plain-text HTTP/2.
//!
//! The accept loop is modeled on this repository's own HBONE test server
//! (`tests/common/hbone_server.rs`): a bare `TcpListener` accept loop feeding
//! `hyper::server::conn::http2`, one task per connection. `grpc-proxy-core`'s
//! `ProxyService` is a `tower::Service`, not a `hyper::service::Service`, so
//! it is wrapped with `hyper_util::service::TowerToHyperService` rather than
//! going through `tonic::transport::Server`, whose built-in router requires
//! statically-known per-RPC service names and cannot express a catch-all.

mod backend;
mod config;

use std::sync::Arc;

use clap::Parser;
use config::{Config, RawConfig};
use grpc_proxy_core::server::{ProxyService, Registration};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::backend::StaticDirector;

#[derive(Parser, Debug)]
#[command(
	name = "grpc-proxy-app",
	version,
	about = "Transparent gRPC forwarding proxy"
)]
struct Cli {
	/// Path to the YAML routing config.
	#[arg(long, value_name = "FILE")]
	config: std::path::PathBuf,
}

fn init_tracing() {
	use tracing_subscriber::prelude::*;
	use tracing_subscriber::{EnvFilter, fmt};

	tracing_subscriber::registry()
		.with(fmt::layer())
		.with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();
}

async fn load_config(path: &std::path::Path) -> anyhow::Result<Config> {
	let contents = fs_err::tokio::read_to_string(path).await?;
	let raw: RawConfig = serde_yaml::from_str(&contents)?;
	Config::try_from(raw)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let cli = Cli::parse();

	let config = load_config(&cli.config).await?;
	info!(listen_addr = %config.listen_addr, routes = config.routes.len(), "loaded config");

	let director = Arc::new(StaticDirector::dial(&config)?);
	let registration = config
		.routes
		.iter()
		.filter(|route| route.unary)
		.fold(Registration::new(), |reg, route| {
			reg.register_unary(route.prefix.clone())
		});
	let service = ProxyService::new(director, registration);

	let listener = TcpListener::bind(config.listen_addr).await?;
	info!(addr = %config.listen_addr, "listening");

	loop {
		let (stream, peer_addr) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(e) => {
				warn!(error = %e, "accept failed");
				continue;
			},
		};

		let service = service.clone();
		tokio::spawn(async move {
			let io = TokioIo::new(stream);
			let hyper_service = TowerToHyperService::new(service);
			if let Err(err) = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
				.serve_connection(io, hyper_service)
				.await
			{
				error!(%peer_addr, error = %err, "connection error");
			}
		});
	}
}
