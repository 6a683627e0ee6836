//! # figlink
//!
//! Binary entry point: `figlink serve` runs the headless peer,
//! `figlink ping` measures round trips against a running one.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::{SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use figlink_core::envelope::PingPayload;
use figlink_core::logging;
use figlink_protocol::{ClientConfig, FiglinkClient, WsTransport};
use figlink_server::{FiglinkServer, ServerConfig};
use figlink_settings::{FiglinkSettings, LogFormat};

/// figlink protocol peer.
#[derive(Parser, Debug)]
#[command(name = "figlink", version, about = "figlink protocol peer")]
struct Cli {
    /// Settings file (defaults to `~/.figlink/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the headless-service peer.
    Serve {
        /// Host to bind (overrides settings).
        #[arg(long)]
        host: Option<String>,

        /// Port to bind, 0 for auto-assign (overrides settings).
        #[arg(long)]
        port: Option<u16>,

        /// Skip the Prometheus recorder and serve 404 on `/metrics`.
        #[arg(long)]
        no_metrics: bool,
    },
    /// Send PING requests to a running peer and print round-trip times.
    Ping {
        /// WebSocket address (overrides settings).
        #[arg(long)]
        url: Option<String>,

        /// Number of PINGs.
        #[arg(long, default_value = "3")]
        count: u32,

        /// Per-request timeout in milliseconds.
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,
    },
}

fn load_settings(path: Option<&PathBuf>) -> Result<FiglinkSettings> {
    let settings = match path {
        Some(path) => figlink_settings::load_settings_from_path(path),
        None => figlink_settings::load_settings(),
    }
    .context("Failed to load settings")?;
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

fn init_logging(settings: &FiglinkSettings) {
    match settings.logging.format {
        LogFormat::Compact => logging::init_subscriber(&settings.logging.level),
        LogFormat::Json => logging::init_json_subscriber(&settings.logging.level),
    }
}

fn server_config(settings: &FiglinkSettings, host: Option<String>, port: Option<u16>) -> ServerConfig {
    let defaults = ServerConfig::from(settings);
    ServerConfig {
        host: host.unwrap_or_else(|| defaults.host.clone()),
        port: port.unwrap_or(defaults.port),
        ..defaults
    }
}

async fn serve(config: ServerConfig, metrics: bool) -> Result<()> {
    let mut server = FiglinkServer::with_default_handlers(config);
    if metrics {
        let handle = figlink_server::metrics::install_recorder()
            .context("Failed to install metrics recorder")?;
        server = server.with_metrics(handle);
    }

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("figlink listening on ws://{addr}/ws");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.stop(vec![handle]).await;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Round-trip times of `count` PINGs, in order.
async fn ping(config: ClientConfig, url: &str, count: u32, timeout: Duration) -> Result<Vec<Duration>> {
    let client = FiglinkClient::spawn(config, Arc::new(WsTransport::new()));
    let session_id = client
        .connect(url)
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;
    tracing::debug!(%session_id, "connected");

    let mut rtts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let started = Instant::now();
        let payload = PingPayload {
            time: Some(now_rfc3339()),
        };
        let result = client.send_request_typed(&payload, Some(timeout)).await;
        match result {
            Ok(_) => rtts.push(started.elapsed()),
            Err(e) => {
                let _ = client.disconnect().await;
                bail!("PING failed: {e}");
            }
        }
    }

    client.disconnect().await.context("Failed to disconnect")?;
    Ok(rtts)
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(cli.settings.as_ref())?;
    init_logging(&settings);

    match cli.command {
        Command::Serve {
            host,
            port,
            no_metrics,
        } => serve(server_config(&settings, host, port), !no_metrics).await,
        Command::Ping {
            url,
            count,
            timeout_ms,
        } => {
            let url = url.unwrap_or_else(|| settings.client.url.clone());
            let rtts = ping(
                ClientConfig::from(&settings),
                &url,
                count,
                Duration::from_millis(timeout_ms),
            )
            .await?;
            for (seq, rtt) in rtts.iter().enumerate() {
                println!("PONG from {url}: seq={} time={:.1}ms", seq + 1, rtt.as_secs_f64() * 1000.0);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve_with_overrides() {
        let cli = Cli::try_parse_from(["figlink", "serve", "--host", "0.0.0.0", "--port", "0"]).unwrap();
        match cli.command {
            Command::Serve { host, port, no_metrics } => {
                assert_eq!(host.as_deref(), Some("0.0.0.0"));
                assert_eq!(port, Some(0));
                assert!(!no_metrics);
            }
            Command::Ping { .. } => panic!("expected serve"),
        }
    }

    #[test]
    fn parses_ping_defaults() {
        let cli = Cli::try_parse_from(["figlink", "ping"]).unwrap();
        match cli.command {
            Command::Ping { url, count, timeout_ms } => {
                assert!(url.is_none());
                assert_eq!(count, 3);
                assert_eq!(timeout_ms, 5000);
            }
            Command::Serve { .. } => panic!("expected ping"),
        }
    }

    #[test]
    fn settings_flag_is_global() {
        let cli = Cli::try_parse_from(["figlink", "ping", "--settings", "/tmp/s.json"]).unwrap();
        assert_eq!(cli.settings, Some(PathBuf::from("/tmp/s.json")));
    }

    #[test]
    fn cli_overrides_settings_for_bind_address() {
        let settings = FiglinkSettings::default();
        let config = server_config(&settings, Some("0.0.0.0".into()), None);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, settings.server.port);
    }

    #[test]
    fn settings_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": 9999}}"#).unwrap();
        let settings = load_settings(Some(&path)).unwrap();
        assert_eq!(settings.server.port, 9999);
    }

    #[tokio::test]
    async fn ping_against_running_server() {
        let server = FiglinkServer::with_default_handlers(ServerConfig::ephemeral());
        let (addr, handle) = server.listen().await.unwrap();

        let rtts = ping(
            ClientConfig::default(),
            &format!("ws://{addr}/ws"),
            2,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(rtts.len(), 2);

        server.stop(vec![handle]).await;
    }

    #[tokio::test]
    async fn ping_fails_without_server() {
        let config = ClientConfig {
            reconnect: figlink_core::ReconnectPolicy::disabled(),
            connect_timeout: Duration::from_secs(2),
            ..ClientConfig::default()
        };
        let err = ping(config, "ws://127.0.0.1:1/ws", 1, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to connect"));
    }
}
