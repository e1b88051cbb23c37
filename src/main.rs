//! Signaling server binary.
//!
//! Usage:
//! ```bash
//! rendezvous-rs --bind 0.0.0.0:8080 -vv
//! ```
//!
//! Accepts WebRTC offers over HTTP and echoes whatever the peer sends once
//! its data channel is up.

use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rendezvous_rs::rtc::RtcGateway;
use rendezvous_rs::serve::{self, AppState};
use rendezvous_rs::transport::{WebRtcConn, WebRtcTransport};

#[derive(Parser, Debug)]
#[command(name = "rendezvous-rs")]
#[command(about = "HTTP offer/answer signaling gateway for WebRTC data channels")]
#[command(version)]
struct Cli {
    /// Address and port to listen on
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Seconds to wait for the peer's data channel before closing a
    /// half-open session
    #[arg(long, default_value_t = 15)]
    handshake_timeout: u64,

    /// Show verbose logging (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let transport = WebRtcTransport::new(WebRtcTransport::default_config())?;
    let gateway = RtcGateway::new(transport, Duration::from_secs(cli.handshake_timeout));

    gateway.register_connection_handler(|conn: WebRtcConn| {
        log::info!("new connection on data channel '{}'", conn.label());
        tokio::spawn(async move {
            if let Err(e) = echo(conn).await {
                log::warn!("connection ended: {e:#}");
            }
        });
    });

    serve::serve(cli.bind, Arc::new(AppState { gateway })).await
}

/// Echo every message back to the peer until it hangs up.
async fn echo(conn: WebRtcConn) -> Result<()> {
    let io = conn.detach().await?;

    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = io.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        io.write(&Bytes::copy_from_slice(&buf[..n])).await?;
    }

    conn.close().await
}
