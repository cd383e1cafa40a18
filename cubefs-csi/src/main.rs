//! `cubefs-csi` — CubeFS CSI driver process.
//!
//! `serve` runs the controller and/or node services over QUIC; `probe` sends
//! an Identity probe to a running driver and exits non-zero unless it is
//! ready.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use libcubefs::config::{
    DEFAULT_CLIENT_BIN, DEFAULT_CLIENT_CONF_DIR, DEFAULT_CLIENT_LOG_DIR, DEFAULT_DRIVER_NAME,
};
use libcubefs::transport::{CsiClient, CsiServer};
use libcubefs::{BackendConfig, CsiMessage, CubeFsBackend, DriverOptions, ServiceMode};

#[derive(Parser, Debug)]
#[command(name = "cubefs-csi", version, about = "CubeFS CSI driver over QUIC")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, env = "CSI_LOG_FORMAT", default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the driver.
    Serve(ServeArgs),
    /// Check that a running driver answers its Identity probe.
    Probe(ProbeArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Services to expose: controller, node or all.
    #[arg(long, env = "CSI_MODE", default_value = "all")]
    mode: ServiceMode,
    /// QUIC listen address.
    #[arg(long, env = "CSI_ENDPOINT", default_value = "0.0.0.0:7443")]
    endpoint: SocketAddr,
    /// Identifier of this node.
    #[arg(long = "nodeid", env = "NODE_ID")]
    node_id: String,
    #[arg(long, env = "CSI_DRIVER_NAME", default_value = DEFAULT_DRIVER_NAME)]
    driver_name: String,
    /// PEM certificate chain served to clients.
    #[arg(long, env = "CSI_TLS_CERT")]
    tls_cert: PathBuf,
    /// PEM private key matching `--tls-cert`.
    #[arg(long, env = "CSI_TLS_KEY")]
    tls_key: PathBuf,
    /// Directory for the per-volume cfs-client configuration files.
    #[arg(long, env = "CFS_CONF_DIR", default_value = DEFAULT_CLIENT_CONF_DIR)]
    conf_dir: PathBuf,
    /// Root of the per-volume cfs-client log directories.
    #[arg(long, env = "CFS_LOG_DIR", default_value = DEFAULT_CLIENT_LOG_DIR)]
    log_dir: PathBuf,
    /// Path of the cfs-client executable.
    #[arg(long, env = "CFS_CLIENT_BIN", default_value = DEFAULT_CLIENT_BIN)]
    client_bin: PathBuf,
}

#[derive(clap::Args, Debug)]
struct ProbeArgs {
    #[arg(long, env = "CSI_ENDPOINT", default_value = "127.0.0.1:7443")]
    endpoint: SocketAddr,
    /// TLS name the server certificate is issued for.
    #[arg(long, default_value = "localhost")]
    server_name: String,
    /// PEM CA certificate used to verify the server.
    #[arg(long, env = "CSI_TLS_CA")]
    ca_cert: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let _ = rustls::crypto::ring::default_provider().install_default();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Probe(args) => probe(args).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let options = DriverOptions {
        driver_name: args.driver_name,
        node_id: args.node_id,
        version: env!("CARGO_PKG_VERSION").to_owned(),
        mode: args.mode,
    };
    options.validate()?;
    info!(
        driver = %options.driver_name,
        node_id = %options.node_id,
        version = %options.version,
        mode = %options.mode,
        "starting CubeFS CSI driver",
    );

    let config = BackendConfig {
        node_id: options.node_id,
        driver_name: options.driver_name,
        version: options.version,
        client_conf_dir: args.conf_dir,
        client_log_dir: args.log_dir,
        client_bin: args.client_bin,
        ..Default::default()
    };
    let backend = CubeFsBackend::with_host(config)?;

    let tls = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(load_certs(&args.tls_cert)?, load_key(&args.tls_key)?)
        .context("building TLS server config")?;
    let server = CsiServer::new(args.endpoint, tls, Arc::new(backend), options.mode)?;

    tokio::select! {
        res = server.serve() => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            server.endpoint().close(0u32.into(), b"shutdown");
        }
    }
    Ok(())
}

async fn probe(args: ProbeArgs) -> Result<()> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs(&args.ca_cert)? {
        roots.add(cert).context("adding CA certificate")?;
    }
    let tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let client = CsiClient::connect(args.endpoint, &args.server_name, tls).await?;
    let resp = client.request(&CsiMessage::Probe).await?;
    client.close().await;

    match resp {
        CsiMessage::ProbeResult(true) => {
            info!(endpoint = %args.endpoint, "driver is ready");
            Ok(())
        }
        CsiMessage::ProbeResult(false) => bail!("driver at {} is not ready", args.endpoint),
        CsiMessage::Error(e) => {
            error!(code = %e.code(), error = %e, "probe failed");
            Err(e.into())
        }
        other => Err(anyhow!("unexpected probe response: {other}")),
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing certificates in {}", path.display()))?;
    if certs.is_empty() {
        bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("parsing private key in {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}
