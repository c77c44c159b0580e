use std::fmt::{Display, Formatter};

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::{interaction::BlockResponse, utils::strip_hex_prefix};

/// A candidate private key waiting to be submitted to the pool.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingKey(pub String);

impl PendingKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PendingKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PendingKey {
    fn from(value: &str) -> Self {
        PendingKey(value.to_string())
    }
}

/// A key whose address is on the watch list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundPair {
    pub address: String,
    pub private_key: String,
}

impl Display for FoundPair {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.private_key)
    }
}

/// Half-open range `[start, end)` as the hex strings handed to the search program,
/// without the `0x` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Keyspace {
    pub start: String,
    pub end: String,
}

impl Keyspace {
    pub fn new(start: &str, end: &str) -> Self {
        Keyspace {
            start: strip_hex_prefix(start.trim()).to_string(),
            end: strip_hex_prefix(end.trim()).to_string(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.start.is_empty() && !self.end.is_empty()
    }

    /// numeric bounds, `None` when either side is not valid hex
    pub fn bounds(&self) -> Option<(BigUint, BigUint)> {
        let start = BigUint::parse_bytes(self.start.as_bytes(), 16)?;
        let end = BigUint::parse_bytes(self.end.as_bytes(), 16)?;
        Some((start, end))
    }

    /// `end - start`, `None` for unparsable or inverted ranges
    pub fn length(&self) -> Option<BigUint> {
        let (start, end) = self.bounds()?;
        if end < start {
            return None;
        }
        Some(end - start)
    }
}

impl Display for Keyspace {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.start, self.end)
    }
}

/// One unit of work handed out by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkBlock {
    pub keyspace: Keyspace,
    pub watch_addresses: Vec<String>,
    pub candidate_addresses: Vec<String>,
}

impl WorkBlock {
    pub fn from_response(response: BlockResponse, watch_addresses: &[String]) -> Self {
        WorkBlock {
            keyspace: Keyspace::new(&response.range.start, &response.range.end),
            watch_addresses: watch_addresses.to_vec(),
            candidate_addresses: response.checkwork_addresses,
        }
    }

    /// Service addresses first, then watch addresses not already present.
    pub fn combined_addresses(&self) -> Vec<String> {
        let mut all = self.candidate_addresses.clone();
        for address in &self.watch_addresses {
            if address.trim().is_empty() {
                continue;
            }
            if !all.contains(address) {
                all.push(address.clone());
            }
        }
        all
    }
}
