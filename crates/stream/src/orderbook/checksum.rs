//! CRC32 book checksum.
//!
//! The common exchange scheme: take the top N levels of each side, interleave
//! them as `bid_price:bid_amount:ask_price:ask_amount:...` (a side that runs
//! out simply stops contributing), and CRC32 the resulting string. Prices and
//! amounts are rendered exactly as received, which is why levels are kept as
//! [`Decimal`](rust_decimal::Decimal) with their original scale.

use super::side::Level;

/// Levels per side most exchanges checksum.
pub const DEFAULT_CHECKSUM_DEPTH: usize = 25;

/// The string that is hashed, exposed for debugging mismatches.
pub fn checksum_payload(bids: &[Level], asks: &[Level]) -> String {
    let mut parts = Vec::with_capacity((bids.len() + asks.len()) * 2);
    for i in 0..bids.len().max(asks.len()) {
        if let Some(bid) = bids.get(i) {
            parts.push(bid.price.to_string());
            parts.push(bid.amount.to_string());
        }
        if let Some(ask) = asks.get(i) {
            parts.push(ask.price.to_string());
            parts.push(ask.amount.to_string());
        }
    }
    parts.join(":")
}

/// Unsigned CRC32 of [`checksum_payload`]. Exchanges that publish a signed
/// value compare against `computed as i32`.
pub fn crc32_checksum(bids: &[Level], asks: &[Level]) -> u32 {
    crc32fast::hash(checksum_payload(bids, asks).as_bytes())
}
