//! cc-relay entry point: load the YAML config, install logging, build the
//! service container, serve until SIGINT/SIGTERM.

use std::path::PathBuf;

use anyhow::Context;
use cc_relay::{LogFormat, RawConfig, Services};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cc-relay", about = "Anthropic Messages API multi-backend relay")]
struct Args {
	/// Path to the YAML configuration file.
	#[arg(short = 'f', long = "config", default_value = "config.yaml")]
	config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let raw = std::fs::read_to_string(&args.config)
		.with_context(|| format!("reading {}", args.config.display()))?;
	let expanded = shellexpand::env(&raw).context("expanding environment variables")?;
	let raw_cfg: RawConfig = serde_yaml::from_str(&expanded).context("parsing config")?;
	let cfg = raw_cfg.validate().context("validating config")?;

	let filter = EnvFilter::try_from_default_env()
		.or_else(|_| EnvFilter::try_new(&cfg.logging.level))
		.context("building log filter")?;
	match cfg.logging.format {
		LogFormat::Json => tracing_subscriber::fmt()
			.json()
			.with_env_filter(filter)
			.init(),
		LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
	}

	let listen = cfg.listen;
	let services = Services::new(cfg).await.context("building services")?;
	services.spawn_health_checker();

	let listener = tokio::net::TcpListener::bind(listen)
		.await
		.with_context(|| format!("binding {listen}"))?;

	let shutdown = services.shutdown.clone();
	tokio::spawn(async move {
		let ctrl_c = tokio::signal::ctrl_c();
		#[cfg(unix)]
		{
			let mut term =
				tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
					.expect("installing SIGTERM handler");
			tokio::select! {
				_ = ctrl_c => {},
				_ = term.recv() => {},
			}
		}
		#[cfg(not(unix))]
		{
			let _ = ctrl_c.await;
		}
		info!("shutdown signal received");
		shutdown.cancel();
	});

	cc_relay::relay::serve(services, listener)
		.await
		.context("server error")?;
	Ok(())
}
