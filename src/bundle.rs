//! Bundle identity and lifecycle types.
//!
//! A bundle is the unit of transfer: one file submitted for delivery.
//! Chunk ranges are inclusive `(start, end)` pairs used by custody
//! records to describe which chunk ids a holder is responsible for.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque 16-byte bundle identifier, globally unique across nodes.
///
/// Treated as an opaque key everywhere: hashed for map lookups and
/// ordered lexicographically in the store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BundleId(pub [u8; 16]);

impl BundleId {
    /// Generate a new random bundle ID from OS randomness.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create a BundleId from exactly 16 bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Parse from a 32-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let decoded = hex::decode(s).ok()?;
        let bytes: [u8; 16] = decoded.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Format as a 32-character hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BundleId({}..)", &self.to_hex()[..8])
    }
}

/// Bundle lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundleState {
    /// Created, not yet transmitted.
    New,
    /// Transfer in progress (sending or receiving).
    InFlight,
    /// Fully assembled at the destination, or confirmed delivered.
    Delivered,
    /// TTL elapsed before delivery.
    Expired,
    /// Unrecoverable failure.
    Failed,
}

impl BundleState {
    /// Check whether this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Expired | Self::Failed)
    }
}

impl fmt::Display for BundleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BundleState::New => "new",
            BundleState::InFlight => "in_flight",
            BundleState::Delivered => "delivered",
            BundleState::Expired => "expired",
            BundleState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Chunk Ranges
// ============================================================================

/// Inclusive chunk-id range list, as carried by custody messages.
pub type ChunkRanges = Vec<(u32, u32)>;

/// Normalize ranges: drop inverted pairs, sort, and merge overlaps.
pub fn normalize_ranges(ranges: &[(u32, u32)]) -> ChunkRanges {
    let mut valid: Vec<(u32, u32)> = ranges.iter().copied().filter(|(s, e)| s <= e).collect();
    valid.sort_unstable();

    let mut merged: ChunkRanges = Vec::with_capacity(valid.len());
    for (start, end) in valid {
        match merged.last_mut() {
            // Merge adjacent and overlapping spans
            Some((_, last_end)) if start <= last_end.saturating_add(1) => {
                *last_end = (*last_end).max(end);
            }
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// Check whether `covering` covers every id in `covered`.
pub fn ranges_cover(covering: &[(u32, u32)], covered: &[(u32, u32)]) -> bool {
    let covering = normalize_ranges(covering);
    // After normalization spans are disjoint and non-adjacent, so each
    // covered span must sit inside a single covering span.
    normalize_ranges(covered).iter().all(|&(start, end)| {
        covering
            .iter()
            .any(|&(s, e)| s <= start && end <= e)
    })
}

/// Subtract `removed` from `base`, returning the ids still held.
pub fn subtract_ranges(base: &[(u32, u32)], removed: &[(u32, u32)]) -> ChunkRanges {
    let removed = normalize_ranges(removed);
    let mut result: ChunkRanges = Vec::new();

    for &(start, end) in &normalize_ranges(base) {
        let mut cursor = start;
        for &(rs, re) in &removed {
            if re < cursor || rs > end {
                continue;
            }
            if rs > cursor {
                result.push((cursor, rs - 1));
            }
            cursor = re.saturating_add(1);
            if cursor > end {
                break;
            }
        }
        if cursor <= end {
            result.push((cursor, end));
        }
    }
    result
}

/// Total number of chunk ids covered by the ranges.
pub fn ranges_len(ranges: &[(u32, u32)]) -> u64 {
    normalize_ranges(ranges)
        .iter()
        .map(|(s, e)| u64::from(e - s) + 1)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_id_hex_roundtrip() {
        let id = BundleId::generate();
        let restored = BundleId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, restored);
    }

    #[test]
    fn test_bundle_id_from_hex_invalid() {
        assert!(BundleId::from_hex("not hex").is_none());
        assert!(BundleId::from_hex("abcd").is_none()); // too short
    }

    #[test]
    fn test_bundle_ids_unique() {
        let a = BundleId::generate();
        let b = BundleId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_state_terminal() {
        assert!(!BundleState::New.is_terminal());
        assert!(!BundleState::InFlight.is_terminal());
        assert!(BundleState::Delivered.is_terminal());
        assert!(BundleState::Expired.is_terminal());
        assert!(BundleState::Failed.is_terminal());
    }

    #[test]
    fn test_normalize_merges_overlaps() {
        let ranges = vec![(5, 10), (0, 3), (8, 15), (4, 4)];
        assert_eq!(normalize_ranges(&ranges), vec![(0, 15)]);
    }

    #[test]
    fn test_normalize_keeps_gaps() {
        let ranges = vec![(0, 3), (10, 12)];
        assert_eq!(normalize_ranges(&ranges), vec![(0, 3), (10, 12)]);
    }

    #[test]
    fn test_normalize_drops_inverted() {
        let ranges = vec![(10, 5), (0, 2)];
        assert_eq!(normalize_ranges(&ranges), vec![(0, 2)]);
    }

    #[test]
    fn test_ranges_cover_full() {
        assert!(ranges_cover(&[(0, 99)], &[(0, 99)]));
        assert!(ranges_cover(&[(0, 50), (51, 99)], &[(0, 99)]));
        assert!(ranges_cover(&[(0, 99)], &[(10, 20), (30, 40)]));
    }

    #[test]
    fn test_ranges_cover_partial() {
        assert!(!ranges_cover(&[(0, 50)], &[(0, 99)]));
        assert!(!ranges_cover(&[(0, 40), (60, 99)], &[(0, 99)]));
        assert!(!ranges_cover(&[], &[(0, 0)]));
    }

    #[test]
    fn test_subtract_middle() {
        assert_eq!(
            subtract_ranges(&[(0, 99)], &[(40, 59)]),
            vec![(0, 39), (60, 99)]
        );
    }

    #[test]
    fn test_subtract_all() {
        assert!(subtract_ranges(&[(0, 99)], &[(0, 99)]).is_empty());
        assert!(subtract_ranges(&[(5, 10)], &[(0, 20)]).is_empty());
    }

    #[test]
    fn test_subtract_none() {
        assert_eq!(subtract_ranges(&[(0, 9)], &[(20, 30)]), vec![(0, 9)]);
    }

    #[test]
    fn test_ranges_len() {
        assert_eq!(ranges_len(&[(0, 9)]), 10);
        assert_eq!(ranges_len(&[(0, 9), (5, 14)]), 15); // overlap merged
        assert_eq!(ranges_len(&[]), 0);
    }
}
