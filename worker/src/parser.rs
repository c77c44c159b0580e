use std::collections::HashSet;

use shared::{
    types::{FoundPair, PendingKey},
    utils::is_hex_key,
};
use tracing::*;

const PUB_ADDR: &str = "Pub Addr: ";
const PRIV_HEX: &str = "Priv (HEX): ";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParseResult {
    /// keys for watch list addresses
    pub hits: Vec<FoundPair>,
    /// everything else, queued for the pool
    pub keys: Vec<PendingKey>,
}

/// Extracts keys from the search program's result file.
///
/// Understands the two-line `Pub Addr:` / `Priv (HEX):` layout, `<address> <hex>` lines
/// and bare 64-digit hex lines. Anything else is ignored.
#[derive(Debug, Clone, Default)]
pub struct ResultParser {
    watchlist: HashSet<String>,
}

impl ResultParser {
    pub fn new(watch_addresses: &[String]) -> Self {
        ResultParser { watchlist: watch_addresses.iter().cloned().collect() }
    }

    fn classify(&self, result: &mut ParseResult, address: &str, key: &str) {
        if self.watchlist.contains(address) {
            result.hits.push(FoundPair { address: address.to_string(), private_key: key.to_string() });
        } else {
            result.keys.push(PendingKey(key.to_string()));
        }
    }

    pub fn parse<I, S>(&self, lines: I) -> ParseResult
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>, {
        let mut result = ParseResult::default();
        let mut pending_address: Option<String> = None;

        for line in lines {
            let line = line.as_ref();

            if let Some((_, address)) = line.split_once(PUB_ADDR) {
                pending_address = Some(address.trim().to_string()).filter(|a| !a.is_empty());
                continue;
            }

            if let Some((_, key)) = line.split_once(PRIV_HEX) {
                if let Some(address) = pending_address.take() {
                    self.classify(&mut result, &address, key.trim());
                    continue;
                }
            }

            let raw = line.trim();
            if raw.is_empty() {
                continue;
            }
            let parts: Vec<&str> = raw.split_whitespace().collect();
            if parts.len() >= 2 {
                if is_hex_key(parts[1]) {
                    self.classify(&mut result, parts[0], parts[1]);
                } else {
                    trace!("skipping line: {raw}");
                }
            } else if is_hex_key(raw) {
                result.keys.push(PendingKey(raw.to_string()));
            }
        }

        result
    }
}
