//! Voice gateway connection with heartbeat and auto-reconnect.
//!
//! The gateway owns the socket. Everything above it talks through two
//! channels: [`SignalOutbox`] for outbound [`ClientSignal`]s and a receiver of
//! [`GatewayEvent`]s. One socket carries every signal in send order, which is
//! what keeps ICE candidates behind the offer/answer they belong to.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parley_common::signal::{ClientSignal, ServerSignal};
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::error::{ClientError, Result};
use crate::SignalOutbox;

const DEFAULT_GW: &str = "ws://localhost:8082/voice";

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Signal(ServerSignal),
    /// The socket dropped. The server treats this as leaving voice, at the
    /// latest when the next session identifies; a new session follows if
    /// reconnecting succeeds.
    Disconnected,
}

/// Why a single connection ended.
enum Exit {
    /// Server closed the socket or the stream ended.
    Closed,
    /// Nobody holds the outbox any more.
    Shutdown,
}

/// Voice gateway client.
///
/// ```rust,no_run
/// use parley_client::gateway::{GatewayClient, GatewayEvent};
///
/// # async fn run() {
/// let (outbox, mut events) = GatewayClient::new("my-access-token", None).spawn();
/// outbox.send(parley_common::signal::ClientSignal::LeaveChannel).ok();
/// while let Some(event) = events.recv().await {
///     if let GatewayEvent::Signal(signal) = event {
///         println!("{signal:?}");
///     }
/// }
/// # }
/// ```
pub struct GatewayClient {
    token: String,
    gateway_url: String,
    heartbeat_interval: Duration,
    max_reconnect: u32,
}

impl GatewayClient {
    pub fn new(token: impl Into<String>, gateway_url: Option<&str>) -> Self {
        Self {
            token: token.into(),
            gateway_url: gateway_url.unwrap_or(DEFAULT_GW).to_owned(),
            heartbeat_interval: Duration::from_secs(15),
            max_reconnect: 10,
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_max_reconnect(mut self, attempts: u32) -> Self {
        self.max_reconnect = attempts;
        self
    }

    /// Spawn the background task that maintains the connection.
    ///
    /// The task stops once every clone of the returned outbox is dropped, or
    /// after `max_reconnect` consecutive failed attempts.
    pub fn spawn(self) -> (SignalOutbox, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (outbox, mut outbound) = mpsc::unbounded_channel();
        let (events, inbound) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut attempts = 0u32;
            loop {
                match run_once(&self, &mut outbound, &events).await {
                    Ok(Exit::Shutdown) => {
                        debug!("Gateway: outbox dropped, stopping");
                        break;
                    }
                    Ok(Exit::Closed) => {
                        attempts = 0;
                        info!("Gateway: connection closed by server, reconnecting");
                        sleep(Duration::from_secs(1)).await;
                    }
                    Err(e) => {
                        attempts += 1;
                        if attempts > self.max_reconnect {
                            error!("Gateway: max reconnect attempts reached: {e}");
                            break;
                        }
                        let delay = Duration::from_secs(u64::min(2u64.pow(attempts), 30));
                        warn!("Gateway: disconnected ({e}), reconnecting in {delay:?} (attempt {attempts})");
                        sleep(delay).await;
                    }
                }
                if events.is_closed() {
                    break;
                }
            }
        });

        (outbox, inbound)
    }
}

async fn run_once(
    gateway: &GatewayClient,
    outbound: &mut mpsc::UnboundedReceiver<ClientSignal>,
    events: &mpsc::UnboundedSender<GatewayEvent>,
) -> Result<Exit> {
    let (ws, _) = connect_async(gateway.gateway_url.as_str()).await?;
    let (mut sink, mut stream) = ws.split();

    // Signals queued while offline addressed a session that no longer exists.
    while outbound.try_recv().is_ok() {}

    let identify = ClientSignal::Identify {
        token: gateway.token.clone(),
    };
    sink.send(Message::Text(serde_json::to_string(&identify)?.into()))
        .await?;

    let mut heartbeat = interval_at(
        Instant::now() + gateway.heartbeat_interval,
        gateway.heartbeat_interval,
    );

    let result = async {
        loop {
            tokio::select! {
                signal = outbound.recv() => {
                    let Some(signal) = signal else {
                        let _ = sink.send(Message::Close(None)).await;
                        return Ok::<_, ClientError>(Exit::Shutdown);
                    };
                    let text = serde_json::to_string(&signal)?;
                    sink.send(Message::Text(text.into())).await?;
                }
                _ = heartbeat.tick() => {
                    let text = serde_json::to_string(&ClientSignal::Heartbeat)?;
                    sink.send(Message::Text(text.into())).await?;
                }
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        return Ok(Exit::Closed);
                    };
                    let text = match msg? {
                        Message::Text(t) => t,
                        Message::Close(_) => return Ok(Exit::Closed),
                        _ => continue,
                    };
                    match serde_json::from_str::<ServerSignal>(text.as_str()) {
                        Ok(ServerSignal::HeartbeatAck) => debug!("Gateway: heartbeat ack"),
                        Ok(signal) => {
                            let _ = events.send(GatewayEvent::Signal(signal));
                        }
                        Err(e) => warn!("Gateway: undecodable signal: {e}"),
                    }
                }
            }
        }
    }
    .await;

    let _ = events.send(GatewayEvent::Disconnected);
    result
}
