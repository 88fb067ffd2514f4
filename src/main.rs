//! Hostgate - main entry point
//!
//! A host-routed HTTP/HTTPS reverse proxy and redirector

use anyhow::Result;
use clap::Parser;
use hostgate::{ProxyServer, RoutingEntry, Settings};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use url::Url;

/// Hostgate - a host-routed HTTP/HTTPS reverse proxy and redirector
#[derive(Parser, Debug)]
#[command(name = "hostgate")]
#[command(version)]
#[command(about = "Host-routed HTTP/HTTPS reverse proxy and redirector")]
struct Args {
    /// HTTP port to listen on (0 disables the plaintext listener)
    #[arg(long, env = "HTTP_PORT", default_value = "8080")]
    http_port: u16,

    /// HTTPS port to listen on (0 disables the TLS listener)
    #[arg(long, env = "HTTPS_PORT", default_value = "0")]
    https_port: u16,

    /// Bind address
    #[arg(long, env = "BIND_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Certificates directory (one subdirectory per domain)
    #[arg(long, env = "CERTS_DIR", default_value = "./certs")]
    certs_dir: PathBuf,

    /// Certificate file name inside each domain directory
    #[arg(long, env = "CERT_FILE", default_value = "fullchain.pem")]
    cert_file: String,

    /// Private key file name inside each domain directory
    #[arg(long, env = "KEY_FILE", default_value = "privkey.pem")]
    key_file: String,

    /// Certificate reload interval in milliseconds (0 disables)
    #[arg(long, env = "AUTO_RELOAD_MS", default_value = "0")]
    auto_reload: u64,

    /// Route of the form DOMAIN=TARGET, repeatable
    /// (e.g. example.com=http://127.0.0.1:3000/)
    #[arg(long = "route", value_name = "DOMAIN=TARGET")]
    routes: Vec<String>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable debug logging regardless of the log level
    #[arg(long, env = "DEBUG")]
    debug: bool,
}

fn parse_route(raw: &str) -> Result<RoutingEntry> {
    let (domain, target) = raw
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("route {:?} is not of the form DOMAIN=TARGET", raw))?;
    Ok(RoutingEntry {
        domain: domain.trim().to_string(),
        target: Some(Url::parse(target.trim())?),
        ..Default::default()
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug {
        Level::DEBUG
    } else {
        match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let proxies = args
        .routes
        .iter()
        .map(|raw| parse_route(raw))
        .collect::<Result<Vec<_>>>()?;

    let settings = Settings {
        host: args.host,
        http_port: args.http_port,
        https_port: args.https_port,
        certificates_folder: args.certs_dir,
        certificate_file: args.cert_file,
        key_file: args.key_file,
        auto_reload: args.auto_reload,
        proxies,
        ..Default::default()
    };

    let server = Arc::new(ProxyServer::new(settings));
    server.clone().start().await?;

    info!("Hostgate started");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    server.reset();

    Ok(())
}
