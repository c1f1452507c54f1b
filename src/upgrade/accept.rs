//! Accept-token derivation (RFC 6455 §1.3).

use base64::engine::Engine as _;
use sha1::{Digest, Sha1};

const WEBSOCKET_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `base64(sha1(key ++ "258EAFA5-E914-47DA-95CA-C5AB0DC85B11"))`.
///
/// A pure function of `key`: equal keys always produce equal accept tokens.
pub(crate) fn accept_token(key: &str) -> String {
    let mut sha1 = Sha1::default();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_GUID);
    base64::engine::general_purpose::STANDARD.encode(sha1.finalize())
}
