//! Push payload decompression
//!
//! Push datagrams are optionally gzip-compressed. Compression is detected
//! by sniffing the gzip magic bytes (`1F 8B`); uncompressed payloads pass
//! through unchanged.

use std::io::Read;

use flate2::read::GzDecoder;
use tracing::warn;

/// Gzip magic bytes
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Check whether `data` starts with the gzip magic bytes
#[must_use]
pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[..2] == GZIP_MAGIC
}

/// Decompress `data` if it is gzip-compressed, otherwise return it as a
/// UTF-8 string unchanged
///
/// Returns `None` when decompression fails or the payload is not valid
/// UTF-8; failures are logged, not propagated, because a malformed push
/// datagram is dropped rather than retried.
#[must_use]
pub fn try_decompress(data: &[u8]) -> Option<String> {
    if !is_gzip(data) {
        return match String::from_utf8(data.to_vec()) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("push payload is not valid utf-8: {e}");
                None
            }
        };
    }

    let mut decoder = GzDecoder::new(data);
    let mut out = String::new();
    match decoder.read_to_string(&mut out) {
        Ok(_) => Some(out),
        Err(e) => {
            warn!("failed to decompress gzip push payload: {e}");
            None
        }
    }
}
