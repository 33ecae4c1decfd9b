//! uTP echo demo over libutp
//!
//! ```text
//! utp-echo server --bind 127.0.0.1:6881
//! utp-echo client --server 127.0.0.1:6881 --message hello
//! ```
//!
//! Set `RUST_LOG` to control verbosity.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use utp_bind::engine::libutp::LibUtp;
use utp_bind::{resolve, UtpBuilder, UtpConfig, UtpConn};

/// Echo bytes over uTP
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "UTP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Echo every connection back to its sender
    Server {
        /// Local UDP address to bind
        #[arg(short, long, default_value = "[::]:6881")]
        bind: String,
    },
    /// Send one message and print the echo
    Client {
        /// Server address, `host:port`
        #[arg(short, long)]
        server: String,
        /// Message to send
        #[arg(short, long, default_value = "hello over utp")]
        message: String,
    },
}

async fn serve(utp: &utp_bind::Utp) -> Result<()> {
    let mut listener = utp.listen()?;
    info!("Echo server ready on {}", utp.local_addr());

    loop {
        let conn = Arc::new(listener.accept().await?);
        info!("Connection from {}", conn.remote_addr());
        tokio::spawn(async move {
            if let Err(e) = echo(&conn).await {
                warn!("Connection from {} ended: {}", conn.remote_addr(), e);
            }
        });
    }
}

async fn echo(conn: &UtpConn) -> Result<()> {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            info!("{} finished sending", conn.remote_addr());
            conn.close()?;
            return Ok(());
        }
        write_all(conn, &buf[..n]).await?;
    }
}

async fn write_all(conn: &UtpConn, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        let n = conn.write(data).await?;
        data = &data[n..];
    }
    Ok(())
}

async fn request(utp: &utp_bind::Utp, server: &str, message: &str) -> Result<()> {
    let remote = resolve("utp", server).with_context(|| format!("resolving {server}"))?;
    let conn = utp.dial(&remote).await.with_context(|| format!("dialing {remote}"))?;
    conn.set_read_timeout(Some(Duration::from_secs(5)));

    write_all(&conn, message.as_bytes()).await?;
    let mut reply = Vec::with_capacity(message.len());
    let mut buf = [0u8; 4096];
    while reply.len() < message.len() {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        reply.extend_from_slice(&buf[..n]);
    }
    println!("{}", String::from_utf8_lossy(&reply));

    let stats = conn.socket().stats()?;
    info!("Socket stats: {:?}", stats);
    conn.close()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => UtpConfig::from_file(path)?,
        None => UtpConfig::from_env()?,
    };
    if let Mode::Server { bind } = &cli.mode {
        config.driver.bind_address = bind.parse().with_context(|| format!("bad bind address {bind}"))?;
    }

    let utp = UtpBuilder::new().with_config(config).build(LibUtp::new()?)?;
    let outcome = match &cli.mode {
        Mode::Server { .. } => {
            tokio::select! {
                result = serve(&utp) => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, shutting down");
                    Ok(())
                }
            }
        }
        Mode::Client { server, message } => request(&utp, server, message).await,
    };

    let stats = utp.context().binding_stats();
    info!("Binding stats: {}", serde_json::to_string(&stats)?);
    utp.shutdown().await?;
    outcome
}
