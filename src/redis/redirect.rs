/// Cluster redirection replies (MOVED and ASK)
///
/// Error replies are scanned with an Aho-Corasick automaton over the two
/// redirect codes; only a match at the very start of the error text counts.
use crate::utils::split_host_port;
use aho_corasick::AhoCorasick;
use bytes::Bytes;
use lazy_static::lazy_static;

/// A redirect signalled by a cluster node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectType {
    /// The slot has permanently moved; safe to cache
    Moved { slot: u16, address: String },
    /// Slot migration in progress; applies to the current request only
    Ask { slot: u16, address: String },
}

impl RedirectType {
    pub fn slot(&self) -> u16 {
        match self {
            RedirectType::Moved { slot, .. } | RedirectType::Ask { slot, .. } => *slot,
        }
    }

    pub fn address(&self) -> &str {
        match self {
            RedirectType::Moved { address, .. } | RedirectType::Ask { address, .. } => address,
        }
    }

    pub fn is_ask(&self) -> bool {
        matches!(self, RedirectType::Ask { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RedirectType::Moved { .. } => "MOVED",
            RedirectType::Ask { .. } => "ASK",
        }
    }
}

const BYTE_SPACE: u8 = b' ';
const PATTERNS: &[&str] = &["ASK", "MOVED"];
const ASKING_FRAME: &[u8] = b"*1\r\n$6\r\nASKING\r\n";

lazy_static! {
    static ref FINDER: AhoCorasick =
        AhoCorasick::new(PATTERNS).expect("Failed to create AhoCorasick pattern finder");
}

#[derive(Debug, thiserror::Error)]
pub enum RedirectError {
    #[error("Invalid redirect target: {0}")]
    InvalidAddress(String),
}

pub struct RedirectParser;

impl RedirectParser {
    /// Parse the text of an error reply (without the leading `-`).
    ///
    /// Returns `None` for ordinary application errors, including ones that
    /// merely mention MOVED or ASK somewhere after the start.
    pub fn parse_redirect_bytes(data: &[u8]) -> Option<RedirectType> {
        let mat = FINDER.find(data)?;
        if mat.start() != 0 {
            return None;
        }

        let end = mat.end();
        if end >= data.len() || data[end] != BYTE_SPACE {
            return None;
        }

        let rdata = &data[end + 1..];
        let pos = rdata.iter().position(|&x| x == BYTE_SPACE)?;
        let slot = btoi::btoi::<u16>(&rdata[..pos]).ok()?;
        if slot as usize >= crate::redis::slots::SLOT_COUNT {
            return None;
        }

        let to = String::from_utf8_lossy(&rdata[pos + 1..]);
        let address = to.trim_end_matches(['\r', '\n']).to_string();
        if address.is_empty() {
            return None;
        }

        if mat.pattern().as_u32() == 0 {
            Some(RedirectType::Ask { slot, address })
        } else {
            Some(RedirectType::Moved { slot, address })
        }
    }

    /// Check a redirect target is a usable `host:port`
    pub fn validate_node_address(address: &str) -> Result<(), RedirectError> {
        match split_host_port(address) {
            Some((host, port)) if !host.is_empty() && port != 0 => Ok(()),
            _ => Err(RedirectError::InvalidAddress(address.to_string())),
        }
    }

    /// Frame sent ahead of a request retried after ASK
    pub fn asking_frame() -> Bytes {
        Bytes::from_static(ASKING_FRAME)
    }
}
