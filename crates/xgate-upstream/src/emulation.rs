//! Browser TLS/HTTP2 fingerprint emulation.
//!
//! The upstream bans clients by TLS fingerprint; a stock hyper stack is
//! trivially identifiable. Each token is pinned to one Chrome profile so
//! its traffic looks like a single consistent browser session.

use wreq_util::Emulation;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

const EMULATION_POOL: &[Emulation] = &[
    Emulation::Chrome132,
    Emulation::Chrome133,
    Emulation::Chrome134,
    Emulation::Chrome135,
    Emulation::Chrome136,
    Emulation::Chrome137,
];

pub(crate) fn fnv1a(data: &str) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in data.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Deterministic profile for a token: same credential, same fingerprint.
/// Returns the pool index too, used as the client-cache key.
pub(crate) fn emulation_for_token(token_id: &str) -> (usize, Emulation) {
    let index = (fnv1a(token_id) as usize) % EMULATION_POOL.len();
    (index, EMULATION_POOL[index])
}

pub(crate) fn default_emulation() -> (usize, Emulation) {
    (
        EMULATION_POOL.len() - 1,
        EMULATION_POOL[EMULATION_POOL.len() - 1],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_token_same_profile() {
        let (a, _) = emulation_for_token("sso-token-1");
        let (b, _) = emulation_for_token("sso-token-1");
        assert_eq!(a, b);
    }

    #[test]
    fn tokens_spread_over_the_pool() {
        let indexes: std::collections::HashSet<usize> = (0..32)
            .map(|n| emulation_for_token(&format!("token-{n}")).0)
            .collect();
        assert!(indexes.len() >= 2);
    }
}
