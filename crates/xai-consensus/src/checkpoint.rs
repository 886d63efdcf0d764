//! Header checkpoint verification.
//!
//! Checkpoints pin known-good block hashes at fixed heights. Sync uses them
//! to fast-forward trustably, and the chain manager refuses any reorg that
//! would unwind at or below the newest pin — a cheap defence against
//! long-range history rewrites. The compiled lists below are per-network;
//! they are empty until a release ships pins.

use xai_core::address::Network;
use xai_core::error::ChainError;
use xai_core::types::Hash256;

/// Compiled-in checkpoints for mainnet: `(height, block_hash)`.
pub const MAINNET_CHECKPOINTS: &[(u64, [u8; 32])] = &[];

/// Compiled-in checkpoints for testnet.
pub const TESTNET_CHECKPOINTS: &[(u64, [u8; 32])] = &[];

/// The compiled checkpoint list for a network. Regtest never pins.
pub fn checkpoints_for(network: Network) -> &'static [(u64, [u8; 32])] {
    match network {
        Network::Mainnet => MAINNET_CHECKPOINTS,
        Network::Testnet => TESTNET_CHECKPOINTS,
        Network::Regtest => &[],
    }
}

/// Verify that a block at `height` matches the checkpoint there, if any.
///
/// Heights without a checkpoint always pass.
pub fn check_checkpoint(
    checkpoints: &[(u64, [u8; 32])],
    height: u64,
    hash: &Hash256,
) -> Result<(), ChainError> {
    for &(cp_height, cp_hash) in checkpoints {
        if cp_height == height {
            if hash.0 != cp_hash {
                return Err(ChainError::CheckpointMismatch(height));
            }
            return Ok(());
        }
    }
    Ok(())
}

/// Height of the most recent checkpoint, or 0 with no checkpoints.
pub fn last_checkpoint_height(checkpoints: &[(u64, [u8; 32])]) -> u64 {
    checkpoints.iter().map(|(h, _)| *h).max().unwrap_or(0)
}

/// Whether `height` sits at or below the newest checkpoint (and therefore
/// must never be reverted).
pub fn is_below_checkpoint(checkpoints: &[(u64, [u8; 32])], height: u64) -> bool {
    let last = last_checkpoint_height(checkpoints);
    last > 0 && height <= last
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CHECKPOINTS: &[(u64, [u8; 32])] = &[(10, [0xAA; 32]), (50, [0xBB; 32])];

    #[test]
    fn matching_hash_passes() {
        check_checkpoint(TEST_CHECKPOINTS, 10, &Hash256([0xAA; 32])).unwrap();
        check_checkpoint(TEST_CHECKPOINTS, 50, &Hash256([0xBB; 32])).unwrap();
    }

    #[test]
    fn wrong_hash_fails() {
        assert_eq!(
            check_checkpoint(TEST_CHECKPOINTS, 10, &Hash256([0xFF; 32])),
            Err(ChainError::CheckpointMismatch(10))
        );
    }

    #[test]
    fn unpinned_heights_pass_any_hash() {
        let arbitrary = Hash256([0xDE; 32]);
        for height in [0, 5, 11, 49, 100, u64::MAX] {
            check_checkpoint(TEST_CHECKPOINTS, height, &arbitrary).unwrap();
        }
    }

    #[test]
    fn last_height_and_floor() {
        assert_eq!(last_checkpoint_height(TEST_CHECKPOINTS), 50);
        assert_eq!(last_checkpoint_height(&[]), 0);

        assert!(is_below_checkpoint(TEST_CHECKPOINTS, 50));
        assert!(is_below_checkpoint(TEST_CHECKPOINTS, 1));
        assert!(!is_below_checkpoint(TEST_CHECKPOINTS, 51));
        assert!(!is_below_checkpoint(&[], 0));
    }

    #[test]
    fn compiled_lists_are_currently_empty() {
        assert!(checkpoints_for(Network::Mainnet).is_empty());
        assert!(checkpoints_for(Network::Regtest).is_empty());
    }
}
