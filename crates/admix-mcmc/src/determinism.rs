use admix_core::derive_substream_seed;

const SWAP_STREAM_SALT: u64 = 0xA5A5_A5A5_A5A5_A5A5;

/// Derives the seed of one chain in an ensemble.
pub fn chain_seed(master_seed: u64, chain_index: usize) -> u64 {
    derive_substream_seed(master_seed, chain_index as u64)
}

/// Derives the seed of the heat-swap stream, distinct from every chain stream.
pub fn swap_seed(master_seed: u64) -> u64 {
    derive_substream_seed(master_seed ^ SWAP_STREAM_SALT, u64::MAX)
}

/// Seed a chain continues with after resuming at `generation`.
pub fn resume_seed(master_seed: u64, chain_index: usize, generation: u64) -> u64 {
    derive_substream_seed(chain_seed(master_seed, chain_index), generation)
}

/// Seed of the heat-swap stream after resuming at `generation`.
pub fn resume_swap_seed(master_seed: u64, generation: u64) -> u64 {
    derive_substream_seed(swap_seed(master_seed), generation)
}
