/// Utility functions and helpers
use std::time::{SystemTime, UNIX_EPOCH};

/// Generate a unique ID based on timestamp and random component
pub fn generate_id(prefix: &str) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();

    let random: u32 = rand::random();
    format!("{}-{}-{:x}", prefix, timestamp, random)
}

/// Calculate CRC16/XMODEM checksum (used for Redis slot calculation)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Extract the hashed portion of a key.
///
/// The tag is the content between the first `open` and the first `close`
/// that follows it. An empty or unterminated tag hashes the whole key.
pub fn extract_hash_tag(key: &[u8], open: u8, close: u8) -> &[u8] {
    if let Some(start) = key.iter().position(|&b| b == open) {
        if let Some(len) = key[start + 1..].iter().position(|&b| b == close) {
            if len > 0 {
                return &key[start + 1..start + 1 + len];
            }
        }
    }
    key
}

/// Split a `host:port` address, rejecting empty hosts and bad ports
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let colon = addr.rfind(':')?;
    let host = &addr[..colon];
    if host.is_empty() {
        return None;
    }
    let port = addr[colon + 1..].parse::<u16>().ok()?;
    Some((host, port))
}
