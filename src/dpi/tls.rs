//! TLS `ClientHello` SNI extraction
//!
//! Minimal hand-written walker over the TLS record layer, just deep
//! enough to pull the Server Name Indication out of an initial
//! `ClientHello`. No other handshake messages are interpreted.
//!
//! ```text
//! ContentType (1) | Version (2) | Length (2)
//! HandshakeType (1) = 0x01 | Length (3) | Version (2) | Random (32)
//! SessionID | CipherSuites | CompressionMethods | Extensions
//! ```

use tracing::trace;

/// TLS `ContentType` for Handshake records
const TLS_CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// `HandshakeType` for `ClientHello`
const TLS_HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;

/// Record header: type + version + length
const TLS_RECORD_HEADER_SIZE: usize = 5;

/// SNI extension type
const TLS_EXTENSION_TYPE_SNI: u16 = 0x0000;

/// SNI name type for a DNS hostname
const TLS_SNI_NAME_TYPE_HOSTNAME: u8 = 0x00;

/// Fixed `ClientHello` prefix: type (1) + length (3) + version (2) +
/// random (32)
const CLIENT_HELLO_FIXED_PREFIX: usize = 38;

/// RFC 5246 record length ceiling
const MAX_TLS_RECORD_LEN: usize = 16384;

/// Quick check: does this payload start a TLS handshake record?
#[must_use]
pub fn is_tls_handshake(data: &[u8]) -> bool {
    if data.len() < TLS_RECORD_HEADER_SIZE {
        return false;
    }
    let version = u16::from_be_bytes([data[1], data[2]]);
    data[0] == TLS_CONTENT_TYPE_HANDSHAKE && (0x0301..=0x0304).contains(&version)
}

/// Extract the SNI hostname from a `ClientHello`, if present and valid.
#[must_use]
pub fn extract_sni(data: &[u8]) -> Option<String> {
    if !is_tls_handshake(data) {
        return None;
    }

    let record_len = usize::from(u16::from_be_bytes([data[3], data[4]]));
    if record_len > MAX_TLS_RECORD_LEN {
        trace!("TLS record length {record_len} exceeds RFC 5246 limit");
        return None;
    }

    let handshake = &data[TLS_RECORD_HEADER_SIZE..];
    if handshake.first() != Some(&TLS_HANDSHAKE_TYPE_CLIENT_HELLO)
        || handshake.len() < CLIENT_HELLO_FIXED_PREFIX
    {
        return None;
    }

    let mut pos = CLIENT_HELLO_FIXED_PREFIX;

    // Session ID
    let session_id_len = usize::from(*handshake.get(pos)?);
    pos += 1 + session_id_len;

    // Cipher suites
    let cipher_len = read_u16(handshake, pos)?;
    pos += 2 + cipher_len;

    // Compression methods
    let compression_len = usize::from(*handshake.get(pos)?);
    pos += 1 + compression_len;

    // Extensions
    let extensions_len = read_u16(handshake, pos)?;
    pos += 2;
    let extensions_end = pos + extensions_len;

    while pos + 4 <= handshake.len() && pos < extensions_end {
        let ext_type = u16::from_be_bytes([handshake[pos], handshake[pos + 1]]);
        let ext_len = usize::from(u16::from_be_bytes([handshake[pos + 2], handshake[pos + 3]]));
        pos += 4;

        if pos + ext_len > handshake.len() {
            trace!("TLS extension data exceeds buffer");
            return None;
        }

        if ext_type == TLS_EXTENSION_TYPE_SNI {
            return parse_sni_extension(&handshake[pos..pos + ext_len]);
        }
        pos += ext_len;
    }

    None
}

/// Walk the server name list and return the first hostname entry.
fn parse_sni_extension(data: &[u8]) -> Option<String> {
    let list_len = read_u16(data, 0)?;
    if list_len + 2 > data.len() {
        return None;
    }

    let mut pos = 2;
    let end = 2 + list_len;

    while pos + 3 <= end {
        let name_type = data[pos];
        let name_len = usize::from(u16::from_be_bytes([data[pos + 1], data[pos + 2]]));
        pos += 3;

        if pos + name_len > data.len() {
            return None;
        }

        if name_type == TLS_SNI_NAME_TYPE_HOSTNAME {
            let name = std::str::from_utf8(&data[pos..pos + name_len]).ok()?;
            if is_valid_hostname(name) {
                return Some(name.to_string());
            }
            return None;
        }
        pos += name_len;
    }

    None
}

fn read_u16(data: &[u8], pos: usize) -> Option<usize> {
    if pos + 2 > data.len() {
        return None;
    }
    Some(usize::from(u16::from_be_bytes([data[pos], data[pos + 1]])))
}

/// RFC 1123 shape check: ASCII alphanumerics, hyphens and dots.
fn is_valid_hostname(hostname: &str) -> bool {
    !hostname.is_empty()
        && hostname.len() <= 253
        && hostname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

/// Test helper building a `ClientHello` with the given SNI.
#[cfg(test)]
pub(crate) fn build_client_hello(sni: &str) -> Vec<u8> {
    // SNI extension body
    let name = sni.as_bytes();
    let mut sni_ext = Vec::new();
    sni_ext.extend_from_slice(&u16::try_from(name.len() + 3).unwrap().to_be_bytes());
    sni_ext.push(TLS_SNI_NAME_TYPE_HOSTNAME);
    sni_ext.extend_from_slice(&u16::try_from(name.len()).unwrap().to_be_bytes());
    sni_ext.extend_from_slice(name);

    let mut extensions = Vec::new();
    extensions.extend_from_slice(&TLS_EXTENSION_TYPE_SNI.to_be_bytes());
    extensions.extend_from_slice(&u16::try_from(sni_ext.len()).unwrap().to_be_bytes());
    extensions.extend_from_slice(&sni_ext);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]); // client version
    body.extend_from_slice(&[0u8; 32]); // random
    body.push(0); // session id
    body.extend_from_slice(&2u16.to_be_bytes()); // one cipher suite
    body.extend_from_slice(&[0x13, 0x01]);
    body.push(1); // one compression method
    body.push(0);
    body.extend_from_slice(&u16::try_from(extensions.len()).unwrap().to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![TLS_HANDSHAKE_TYPE_CLIENT_HELLO];
    let body_len = u32::try_from(body.len()).unwrap();
    handshake.extend_from_slice(&body_len.to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![TLS_CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
    record.extend_from_slice(&u16::try_from(handshake.len()).unwrap().to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
