mod responder;
mod session;

use anyhow::Context;
use session::DeviceSession;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Listen address, default `0.0.0.0:8080`
const ADDR_ENV: &str = "DEVICE_SIM_ADDR";
/// Optional delay in milliseconds applied to every reply
const DELAY_ENV: &str = "DEVICE_SIM_DELAY_MS";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr = std::env::var(ADDR_ENV).unwrap_or_else(|_| "0.0.0.0:8080".into());
    let delay = match std::env::var(DELAY_ENV) {
        Ok(raw) => Duration::from_millis(
            raw.parse()
                .with_context(|| format!("{} must be a number of milliseconds, got {:?}", DELAY_ENV, raw))?,
        ),
        Err(_) => Duration::ZERO,
    };

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Device simulator listening on {} (reply delay {}ms)", addr, delay.as_millis());

    loop {
        let (stream, peer) = listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        info!("Connection from: {}", peer);

        tokio::spawn(serve(DeviceSession::new(stream, peer), delay));
    }
}

/// Answer every request on one connection until it closes
async fn serve(mut session: DeviceSession, delay: Duration) {
    while let Some(envelope) = session.recv().await {
        let Some(reply) = responder::reply(&envelope) else {
            continue;
        };

        let handle = session.handle();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = handle.send(&reply).await {
                error!("Failed to reply to {}: {}", handle.addr, e);
            }
        });
    }
    info!("Client disconnected: {}", session.addr());
}
