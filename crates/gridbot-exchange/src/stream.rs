//! Account user-data stream.
//!
//! Holds one websocket per exchange account and fans execution reports
//! into a broadcast channel that every bot on the account subscribes to.
//! Reconnects with exponential backoff and renews the listen key.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use gridbot_core::{BoxFuture, FillEvent};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ExchangeError, ExchangeResult};
use crate::message::{parse_user_event, UserEvent};

/// Issues and renews listen keys for the stream.
pub trait StreamEndpoint: Send + Sync {
    fn create_listen_key(&self) -> BoxFuture<'_, ExchangeResult<String>>;

    fn keepalive_listen_key<'a>(&'a self, listen_key: &'a str) -> BoxFuture<'a, ExchangeResult<()>>;
}

/// Stream configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Websocket base URL; the listen key is appended as a path segment.
    pub url: String,
    /// Maximum reconnection attempts (0 = infinite).
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Listen keys expire after 60 minutes without a keepalive.
    pub keepalive_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "wss://stream.binance.com:9443/ws".to_string(),
            max_reconnect_attempts: 0,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 60_000,
            keepalive_interval: Duration::from_secs(30 * 60),
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// User-data stream for one account.
pub struct UserStream {
    config: StreamConfig,
    endpoint: Arc<dyn StreamEndpoint>,
    fills: broadcast::Sender<FillEvent>,
    state: RwLock<StreamState>,
    reconnect_count: RwLock<u32>,
    shutdown_token: CancellationToken,
}

impl UserStream {
    pub fn new(
        config: StreamConfig,
        endpoint: Arc<dyn StreamEndpoint>,
        fills: broadcast::Sender<FillEvent>,
    ) -> Self {
        Self {
            config,
            endpoint,
            fills,
            state: RwLock::new(StreamState::Disconnected),
            reconnect_count: RwLock::new(0),
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> StreamState {
        *self.state.read()
    }

    pub fn reconnect_count(&self) -> u32 {
        *self.reconnect_count.read()
    }

    /// Signal graceful shutdown of the connect loop.
    pub fn shutdown(&self) {
        info!("User stream shutdown requested");
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Spawn the connect loop on the current runtime.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let stream = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = stream.run().await {
                error!(error = %e, "User stream stopped");
            }
        })
    }

    /// Connect and keep reconnecting until shutdown or attempts run out.
    pub async fn run(&self) -> ExchangeResult<()> {
        let mut attempt = 0u32;

        loop {
            if self.is_shutdown() {
                *self.state.write() = StreamState::Disconnected;
                return Ok(());
            }

            *self.state.write() = StreamState::Connecting;
            match self.try_connect().await {
                Ok(()) => info!("User stream closed"),
                Err(e) => error!(error = %e, "User stream error"),
            }

            if self.is_shutdown() {
                info!("Shutdown requested after disconnect, not reconnecting");
                *self.state.write() = StreamState::Disconnected;
                return Ok(());
            }

            attempt += 1;
            *self.reconnect_count.write() = attempt;
            if self.config.max_reconnect_attempts > 0
                && attempt >= self.config.max_reconnect_attempts
            {
                error!(attempt, "Max reconnection attempts reached");
                *self.state.write() = StreamState::Disconnected;
                return Err(ExchangeError::ConnectionFailed(
                    "max reconnection attempts reached".to_string(),
                ));
            }

            *self.state.write() = StreamState::Reconnecting;
            let delay = self.backoff_delay(attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting user stream");

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.shutdown_token.cancelled() => {
                    *self.state.write() = StreamState::Disconnected;
                    return Ok(());
                }
            }
        }
    }

    async fn try_connect(&self) -> ExchangeResult<()> {
        let listen_key = self.endpoint.create_listen_key().await?;
        let url = format!("{}/{}", self.config.url.trim_end_matches('/'), listen_key);
        info!(url = %self.config.url, "Connecting user stream");

        let (ws_stream, _response) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        *self.state.write() = StreamState::Connected;
        *self.reconnect_count.write() = 0;
        info!("User stream connected");

        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        // First tick completes immediately
        keepalive.tick().await;

        loop {
            tokio::select! {
                () = self.shutdown_token.cancelled() => {
                    if let Err(e) = write.send(Message::Close(None)).await {
                        warn!(?e, "Failed to send Close frame during shutdown");
                    }
                    *self.state.write() = StreamState::Disconnected;
                    return Ok(());
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if self.handle_text(&text) {
                                // Listen key expired: reconnect with a fresh one
                                return Ok(());
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (f.code.into(), f.reason.to_string()))
                                .unwrap_or((1000, "Normal close".to_string()));
                            warn!(code, %reason, "User stream closed by server");
                            return Err(ExchangeError::ConnectionClosed { code, reason });
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            warn!("User stream ended");
                            return Ok(());
                        }
                        _ => {}
                    }
                }

                _ = keepalive.tick() => {
                    if let Err(e) = self.endpoint.keepalive_listen_key(&listen_key).await {
                        warn!(error = %e, "Listen key keepalive failed, reconnecting");
                        return Err(e);
                    }
                    debug!("Listen key refreshed");
                }
            }
        }
    }

    /// Returns `true` when the frame asks for a reconnect.
    fn handle_text(&self, text: &str) -> bool {
        match parse_user_event(text) {
            Ok(UserEvent::Fill(fill)) => {
                debug!(
                    symbol = %fill.symbol,
                    venue_order_id = %fill.venue_order_id,
                    trade_id = %fill.venue_trade_id,
                    "Fill received"
                );
                if self.fills.send(fill).is_err() {
                    debug!("No fill subscribers");
                }
                false
            }
            Ok(UserEvent::ListenKeyExpired) => {
                warn!("Listen key expired");
                true
            }
            Ok(UserEvent::Other) => false,
            Err(e) => {
                warn!(error = %e, "Unparseable user stream frame");
                false
            }
        }
    }

    /// `min(base * 2^(attempt-1), max)` plus up to 1s of jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(10);
        let delay = self
            .config
            .reconnect_base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.config.reconnect_max_delay_ms);
        Duration::from_millis(delay + rand_jitter())
    }
}

/// Jitter in 0-999ms from the clock's sub-second nanos.
fn rand_jitter() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    u64::from(nanos % 1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoEndpoint;

    impl StreamEndpoint for NoEndpoint {
        fn create_listen_key(&self) -> BoxFuture<'_, ExchangeResult<String>> {
            Box::pin(async { Err(ExchangeError::Network("offline".to_string())) })
        }

        fn keepalive_listen_key<'a>(&'a self, _listen_key: &'a str) -> BoxFuture<'a, ExchangeResult<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn stream(config: StreamConfig) -> (UserStream, broadcast::Receiver<FillEvent>) {
        let (tx, rx) = broadcast::channel(16);
        (UserStream::new(config, Arc::new(NoEndpoint), tx), rx)
    }

    #[test]
    fn test_backoff_is_capped() {
        let (stream, _rx) = stream(StreamConfig::default());
        let first = stream.backoff_delay(1);
        assert!(first >= Duration::from_millis(1000) && first < Duration::from_millis(2000));
        let third = stream.backoff_delay(3);
        assert!(third >= Duration::from_millis(4000) && third < Duration::from_millis(5000));
        let late = stream.backoff_delay(30);
        assert!(late >= Duration::from_millis(60_000) && late < Duration::from_millis(61_000));
    }

    #[test]
    fn test_fill_frames_broadcast() {
        let (stream, mut rx) = stream(StreamConfig::default());
        let frame = r#"{"e":"executionReport","s":"ETHUSDT","c":"gb_1_x","S":"SELL",
            "x":"TRADE","i":42,"l":"0.5","L":"2100","n":"1.05","N":"USDT","T":1700000000000,"t":7}"#;
        assert!(!stream.handle_text(frame));
        let fill = rx.try_recv().unwrap();
        assert_eq!(fill.symbol, "ETH/USDT");
        assert_eq!(fill.venue_trade_id, "7");

        assert!(stream.handle_text(r#"{"e":"listenKeyExpired"}"#));
        assert!(!stream.handle_text("not json"));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (stream, _rx) = stream(StreamConfig {
            max_reconnect_attempts: 1,
            ..StreamConfig::default()
        });
        let result = stream.run().await;
        assert!(matches!(result, Err(ExchangeError::ConnectionFailed(_))));
        assert_eq!(stream.state(), StreamState::Disconnected);
    }

    #[tokio::test]
    async fn test_shutdown_before_run() {
        let (stream, _rx) = stream(StreamConfig::default());
        stream.shutdown();
        assert!(stream.run().await.is_ok());
    }
}
