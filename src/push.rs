//! UDP push listener
//!
//! The second, asynchronous writer into the registry store. The control
//! plane sends unsolicited update notifications over UDP, optionally
//! gzip-compressed; each datagram carries a push envelope whose `data`
//! field is a JSON-encoded service record, parsed with the same parser as
//! the pull path.
//!
//! Every decodable envelope is acknowledged with its `lastRefTime` echoed
//! back, whether or not the payload parsed, so the control plane can track
//! delivery (at-most-once semantics; malformed payloads are logged and
//! dropped, never retried). Writes go through the same store primitive as
//! the pull loop with no reconciliation beyond last-write-wins.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{error, info, warn};

use crate::compress::try_decompress;
use crate::error::{RegistryError, RegistryResult};
use crate::record::{cache_key, parse_record};
use crate::registry::ServiceRegistry;

/// Lowest port probed for the listener
const PORT_RANGE_BASE: u16 = 54_951;

/// Width of the probed port range
const PORT_RANGE_WIDTH: u16 = 1000;

/// Number of random bind attempts before giving up
const BIND_ATTEMPTS: u32 = 3;

/// Push envelope wire format
#[derive(Debug, Deserialize)]
struct PushEnvelope {
    #[serde(rename = "type", default)]
    push_type: String,
    #[serde(default)]
    data: String,
    #[serde(rename = "lastRefTime", default)]
    last_ref_time: i64,
}

/// Acknowledgment sent back for every decodable envelope
///
/// `lastRefTime` is echoed as a decimal string, matching what control
/// planes expect on the ack path even though the envelope carries it as a
/// number.
#[derive(Debug, Serialize)]
struct PushAck {
    #[serde(rename = "type")]
    ack_type: &'static str,
    #[serde(rename = "lastRefTime")]
    last_ref_time: String,
    data: &'static str,
}

/// Long-lived UDP listener receiving push notifications from the registry
pub struct PushListener {
    socket: UdpSocket,
    registry: Arc<ServiceRegistry>,
}

impl PushListener {
    /// Bind on an ephemeral port probed from a fixed range
    ///
    /// Up to three random candidates in `54951..55951` are tried; the
    /// bound port is published through the registry's [`PushPort`] cell so
    /// outbound fetches advertise it as the push target.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ListenerBindExhausted`] when every probe
    /// fails. Fatal at startup only: the host may disable push and degrade
    /// to pull-only operation.
    ///
    /// [`PushPort`]: crate::fetch::PushPort
    pub async fn bind(registry: Arc<ServiceRegistry>) -> RegistryResult<Self> {
        for attempt in 1..=BIND_ATTEMPTS {
            let port = PORT_RANGE_BASE + rand::thread_rng().gen_range(0..PORT_RANGE_WIDTH);

            match UdpSocket::bind(("0.0.0.0", port)).await {
                Ok(socket) => {
                    info!("push listener bound on port {port}");
                    registry.push_port().set(port);
                    return Ok(Self { socket, registry });
                }
                Err(e) => {
                    warn!("push listener bind attempt {attempt} on port {port} failed: {e}");
                }
            }
        }

        Err(RegistryError::ListenerBindExhausted {
            attempts: BIND_ATTEMPTS,
        })
    }

    /// The port this listener is bound to
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the socket has no local address.
    pub fn local_port(&self) -> std::io::Result<u16> {
        self.socket.local_addr().map(|addr| addr.port())
    }

    /// Receive loop; runs until the registry's cancellation token fires
    pub async fn run(self) {
        let cancel = self.registry.cancellation();
        let mut buffer = [0u8; 4096];

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("push listener stopped");
                    break;
                }
                result = self.socket.recv_from(&mut buffer) => match result {
                    Ok((n, peer)) => self.handle_datagram(&buffer[..n], peer).await,
                    Err(e) => {
                        error!("push listener recv error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }
    }

    async fn handle_datagram(&self, data: &[u8], peer: SocketAddr) {
        let Some(text) = try_decompress(data) else {
            return;
        };

        let envelope: PushEnvelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("failed to parse push envelope from {peer}: {e}");
                return;
            }
        };

        info!(
            "received push ({}) from {peer}, lastRefTime {}",
            envelope.push_type, envelope.last_ref_time
        );

        match parse_record(&envelope.data) {
            Ok(mut record) => {
                let key = cache_key(&record.name, self.registry.client_identity());
                record.last_ref_millis = envelope.last_ref_time;
                self.registry.store().insert(key, record);
            }
            Err(e) => {
                // Dropped, not retried: the next pull pass reconverges.
                warn!("failed to process push payload from {peer}: {e}");
            }
        }

        let ack = PushAck {
            ack_type: "push-ack",
            last_ref_time: envelope.last_ref_time.to_string(),
            data: "",
        };

        match serde_json::to_vec(&ack) {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, peer).await {
                    warn!("failed to send push ack to {peer}: {e}");
                }
            }
            Err(e) => error!("failed to serialize push ack: {e}"),
        }
    }
}
