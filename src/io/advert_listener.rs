//! TCP listener for advertisement records
//!
//! Radio front-ends connect and stream one JSON object per line:
//! `{"mac":"aa:bb:cc:dd:ee:ff","rssi":-61,"name":"Watch","service_uuids":["fd6f"]}`
//! Records are forwarded to the intake queue with `try_send`; malformed lines
//! and drops are counted in metrics.

use crate::domain::types::Advertisement;
use crate::infra::metrics::Metrics;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct AdvertListenerConfig {
    pub bind_address: String,
    pub port: u16,
    pub enabled: bool,
}

impl Default for AdvertListenerConfig {
    fn default() -> Self {
        Self { bind_address: "0.0.0.0".to_string(), port: 25804, enabled: true }
    }
}

/// Parse one intake line
pub fn parse_advert_line(line: &str) -> Result<Advertisement, serde_json::Error> {
    serde_json::from_str(line.trim())
}

/// Bind and serve until shutdown
pub async fn start_advert_listener(
    config: AdvertListenerConfig,
    advert_tx: mpsc::Sender<Advertisement>,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if !config.enabled {
        info!("advert_listener_disabled");
        return Ok(());
    }

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "advert_listener_started");

    serve_adverts(listener, advert_tx, metrics, shutdown).await;
    Ok(())
}

/// Accept loop on an already bound listener
pub async fn serve_adverts(
    listener: TcpListener,
    advert_tx: mpsc::Sender<Advertisement>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("advert_listener_shutdown");
                    return;
                }
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, addr)) => {
                        let tx = advert_tx.clone();
                        let m = metrics.clone();
                        tokio::spawn(async move {
                            handle_connection(socket, addr, tx, m).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "advert_listener_accept_failed");
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    addr: SocketAddr,
    advert_tx: mpsc::Sender<Advertisement>,
    metrics: Arc<Metrics>,
) {
    let peer = addr.to_string();
    debug!(peer = %peer, "advert_connection_accepted");

    let mut lines = BufReader::new(socket).lines();

    // Rate-limit drop and parse warnings to 1 per second
    let mut last_warn = Instant::now() - Duration::from_secs(2);

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }

        let advert = match parse_advert_line(&line) {
            Ok(advert) => advert,
            Err(e) => {
                metrics.record_parse_failure();
                if last_warn.elapsed() > Duration::from_secs(1) {
                    warn!(peer = %peer, error = %e, "advert_parse_failed");
                    last_warn = Instant::now();
                }
                continue;
            }
        };

        match advert_tx.try_send(advert) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                metrics.record_advert_dropped();
                if last_warn.elapsed() > Duration::from_secs(1) {
                    warn!(peer = %peer, "advert_dropped: queue full");
                    last_warn = Instant::now();
                }
            }
            Err(TrySendError::Closed(_)) => {
                warn!(peer = %peer, "advert_queue_closed");
                break;
            }
        }
    }

    debug!(peer = %peer, "advert_connection_closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_parse_advert_line() {
        let adv = parse_advert_line(r#"  {"mac":"AA:BB:CC:DD:EE:FF","rssi":-70,"tx_power":-59}  "#).unwrap();
        assert_eq!(adv.mac.to_id(), "aabbccddeeff");
        assert_eq!(adv.rssi, -70);
        assert_eq!(adv.tx_power, Some(-59));

        assert!(parse_advert_line(r#"{"mac":"aa:bb","rssi":-70}"#).is_err());
        assert!(parse_advert_line(r#"{"rssi":-70}"#).is_err());
        assert!(parse_advert_line("ACC 123").is_err());
    }

    #[tokio::test]
    async fn test_listener_forwards_and_counts_failures() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let metrics = Arc::new(Metrics::new());
        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = tokio::spawn(serve_adverts(listener, tx, metrics.clone(), shutdown_rx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"{\"mac\":\"aa:bb:cc:dd:ee:ff\",\"rssi\":-60}\nnot json\n\n{\"mac\":\"112233445566\",\"rssi\":-75}\n")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.rssi, -60);
        assert_eq!(second.mac.to_id(), "112233445566");
        assert_eq!(metrics.parse_failures_total(), 1);

        shutdown_tx.send(true).unwrap();
        server.await.unwrap();
    }
}
