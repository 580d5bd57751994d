//! Local network identity
//!
//! Detects the non-loopback IPv4 address used to reach the network, which
//! serves as the default client-affinity key and the push-path cache key.

use std::net::UdpSocket;
use std::sync::OnceLock;

static LOCAL_IP: OnceLock<String> = OnceLock::new();

/// The local non-loopback IPv4 address, empty if detection fails
///
/// Detection routes a UDP socket toward a public address without sending
/// any packet; the kernel's source-address selection answers the question.
/// Cached for the process lifetime.
#[must_use]
pub fn local_ip() -> &'static str {
    LOCAL_IP.get_or_init(|| detect_local_ip().unwrap_or_default())
}

fn detect_local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let addr = socket.local_addr().ok()?;
    if addr.ip().is_loopback() {
        return None;
    }
    Some(addr.ip().to_string())
}
