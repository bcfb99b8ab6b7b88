//! Bi-directional, reconnecting message channel between a host and its
//! clients (C1). In-process stand-in for the `MessagePort`/`BroadcastChannel`
//! boundary a browser extension would use: a [`TransportPair`] wires two
//! [`Transport`] handles together with an mpsc in each direction, and
//! [`Transport::subscribe`] hands out broadcast receivers so late
//! subscribers never see messages that arrived before they subscribed.
//!
//! Grounded on the in-process pub/sub idiom of an `EventBus` over
//! `Arc<RwLock<HashMap<_, Vec<Handler>>>>` with semaphore-bounded
//! backpressure — generalized here to an opaque payload (the transport
//! never inspects message contents) dispatched over channels instead of
//! per-type handler maps.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use common::error::AppError;
use common::shared_kv::{ChangeNotifier, StorageChanged};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_retry::strategy::jitter;
use tracing::{debug, warn};
use uuid::Uuid;

const RECONNECT_INITIAL_DELAY_MS: u64 = 100;
const RECONNECT_BACKOFF_FACTOR: u64 = 2;
const RECONNECT_CAP_MS: u64 = 2_000;
const RECONNECT_MAX_ATTEMPTS: usize = 5;
const SUBSCRIBER_BUFFER: usize = 256;

/// An opaque message. The transport never looks inside `payload` — callers
/// (RPC, the job queue, shared storage) impose their own schema on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
        }
    }
}

/// One end of an in-process host↔client channel. Delivery is ordered
/// per-connection and at-most-once per connection instance: each `Transport`
/// owns a single outbound mpsc sender and fans inbound messages out over a
/// `broadcast` channel so every live subscriber sees every message exactly
/// once, in arrival order.
pub struct Transport {
    outbound: mpsc::Sender<Envelope>,
    inbound: broadcast::Sender<Envelope>,
    closed: Arc<AtomicBool>,
}

impl Transport {
    /// Creates a linked pair of transports: messages posted on one side
    /// arrive as inbound messages on the other.
    pub fn pair(buffer: usize) -> (Transport, Transport) {
        let (a_to_b_tx, a_to_b_rx) = mpsc::channel(buffer);
        let (b_to_a_tx, b_to_a_rx) = mpsc::channel(buffer);

        let a_inbound = broadcast::Sender::new(SUBSCRIBER_BUFFER);
        let b_inbound = broadcast::Sender::new(SUBSCRIBER_BUFFER);

        let a_closed = Arc::new(AtomicBool::new(false));
        let b_closed = Arc::new(AtomicBool::new(false));

        spawn_pump(b_to_a_rx, a_inbound.clone(), a_closed.clone());
        spawn_pump(a_to_b_rx, b_inbound.clone(), b_closed.clone());

        let a = Transport {
            outbound: a_to_b_tx,
            inbound: a_inbound,
            closed: a_closed,
        };
        let b = Transport {
            outbound: b_to_a_tx,
            inbound: b_inbound,
            closed: b_closed,
        };
        (a, b)
    }

    /// Posts a message to the other end. Fails with `TransportClosed` once
    /// the peer has disconnected and reconnection has been exhausted.
    pub async fn post(&self, envelope: Envelope) -> Result<(), AppError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::TransportClosed);
        }
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| AppError::TransportClosed)
    }

    /// Subscribes to inbound messages. The returned receiver only observes
    /// messages posted after this call; dropping it is the unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inbound.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn spawn_pump(
    mut rx: mpsc::Receiver<Envelope>,
    out: broadcast::Sender<Envelope>,
    closed: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            // A `SendError` here just means there are currently no
            // subscribers; the message is not redelivered, matching
            // at-most-once-per-handler semantics.
            let _ = out.send(envelope);
        }
        closed.store(true, Ordering::SeqCst);
        debug!("transport pump closed: peer disconnected");
    });
}

/// Wraps a `Transport` with reconnect-with-backoff: initial delay 100ms,
/// factor 2, capped at 2s, up to 5 attempts before giving up with
/// `TransportClosed`. Outbound messages queued during a reconnect attempt
/// flush once the replacement transport is installed.
pub struct ReconnectingTransport<F> {
    current: Mutex<Transport>,
    reconnect: F,
}

impl<F, Fut> ReconnectingTransport<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Transport, AppError>> + Send,
{
    pub fn new(initial: Transport, reconnect: F) -> Self {
        Self {
            current: Mutex::new(initial),
            reconnect,
        }
    }

    pub async fn post(&self, envelope: Envelope) -> Result<(), AppError> {
        {
            let transport = self.current.lock().await;
            if transport.post(envelope.clone()).await.is_ok() {
                return Ok(());
            }
        }
        self.reconnect_and_post(envelope).await
    }

    async fn reconnect_and_post(&self, envelope: Envelope) -> Result<(), AppError> {
        let delays = (0..RECONNECT_MAX_ATTEMPTS).map(|attempt| {
            let factor = RECONNECT_BACKOFF_FACTOR.saturating_pow(u32::try_from(attempt).unwrap_or(u32::MAX));
            let raw = Duration::from_millis(RECONNECT_INITIAL_DELAY_MS.saturating_mul(factor));
            jitter(raw.min(Duration::from_millis(RECONNECT_CAP_MS)))
        });

        for delay in delays {
            tokio::time::sleep(delay).await;
            match (self.reconnect)().await {
                Ok(replacement) => {
                    let mut transport = self.current.lock().await;
                    *transport = replacement;
                    return transport.post(envelope).await;
                }
                Err(err) => {
                    warn!(error = ?err, "transport reconnect attempt failed");
                }
            }
        }

        Err(AppError::TransportClosed)
    }

    pub async fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.current.lock().await.subscribe()
    }
}

/// Wraps a `Transport` as a `shared_kv::ChangeNotifier`, posting a
/// `STORAGE_CHANGED` envelope for every local mutation so other contexts
/// connected over the same transport converge without polling. `notify` is
/// synchronous (the trait predates any particular executor); the actual
/// post is spawned onto the current tokio runtime and its failure merely
/// logged, since a storage-change broadcast is best-effort.
pub struct TransportChangeNotifier {
    transport: Arc<Transport>,
}

impl TransportChangeNotifier {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }
}

impl ChangeNotifier for TransportChangeNotifier {
    fn notify(&self, change: &StorageChanged) {
        let payload = serde_json::json!({
            "type": "STORAGE_CHANGED",
            "key": change.key,
            "old_value": change.old_value,
            "new_value": change.new_value,
            "ts": change.ts,
        });
        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(err) = transport.post(Envelope::new(payload)).await {
                warn!(error = ?err, "failed to broadcast storage change");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn posted_message_is_delivered_to_subscriber() {
        let (a, b) = Transport::pair(8);
        let mut rx = b.subscribe();

        a.post(Envelope::new(serde_json::json!({"kind": "ping"})))
            .await
            .expect("post");

        let received = rx.recv().await.expect("message delivered");
        assert_eq!(received.payload["kind"], "ping");
    }

    #[tokio::test]
    async fn late_subscriber_does_not_see_earlier_messages() {
        let (a, b) = Transport::pair(8);

        a.post(Envelope::new(serde_json::json!({"kind": "early"})))
            .await
            .expect("post");
        tokio::task::yield_now().await;

        let mut rx = b.subscribe();
        a.post(Envelope::new(serde_json::json!({"kind": "late"})))
            .await
            .expect("post");

        let received = rx.recv().await.expect("message delivered");
        assert_eq!(received.payload["kind"], "late");
    }

    #[tokio::test]
    async fn post_fails_with_transport_closed_after_peer_drop() {
        let (a, b) = Transport::pair(1);
        drop(b);

        // The pump task needs a beat to observe the closed receiver.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = a.post(Envelope::new(serde_json::json!({}))).await;
        assert!(matches!(result, Err(AppError::TransportClosed)));
    }

    #[tokio::test]
    async fn reconnecting_transport_flushes_after_reconnect() {
        let (a, b) = Transport::pair(1);
        drop(b);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (replacement_a, replacement_b) = Transport::pair(8);
        let mut rx = replacement_b.subscribe();
        let replacement_a = Arc::new(Mutex::new(Some(replacement_a)));

        let reconnecting = ReconnectingTransport::new(a, move || {
            let replacement_a = replacement_a.clone();
            async move {
                replacement_a
                    .lock()
                    .await
                    .take()
                    .ok_or(AppError::TransportClosed)
            }
        });

        reconnecting
            .post(Envelope::new(serde_json::json!({"kind": "after-reconnect"})))
            .await
            .expect("post succeeds after reconnect");

        let received = rx.recv().await.expect("message delivered on new transport");
        assert_eq!(received.payload["kind"], "after-reconnect");
    }

    #[tokio::test]
    async fn change_notifier_broadcasts_storage_changed_envelope() {
        let (a, b) = Transport::pair(8);
        let mut rx = b.subscribe();
        let notifier = TransportChangeNotifier::new(Arc::new(a));

        notifier.notify(&StorageChanged {
            key: "current_model".to_string(),
            old_value: None,
            new_value: Some(serde_json::json!("gpt-4o")),
            ts: chrono::Utc::now(),
        });

        let received = rx.recv().await.expect("storage change delivered");
        assert_eq!(received.payload["type"], "STORAGE_CHANGED");
        assert_eq!(received.payload["key"], "current_model");
    }
}
