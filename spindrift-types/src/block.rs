//! Block sizing and the optional weak hash.

/// Smallest block size: 128 KiB.
pub const MIN_BLOCK_SIZE: u32 = 128 * 1024;

/// Largest block size: 16 MiB.
pub const MAX_BLOCK_SIZE: u32 = 16 * 1024 * 1024;

/// Aim for roughly this many blocks per file when picking a block size.
const DESIRED_BLOCKS: u64 = 2000;

/// Pick the power-of-two block size for a file of the given length.
///
/// Scales from 128 KiB up to 16 MiB so that files stay near
/// [`DESIRED_BLOCKS`] blocks.
pub fn block_size_for(file_size: u64) -> u32 {
    let mut size = MIN_BLOCK_SIZE as u64;
    while size < MAX_BLOCK_SIZE as u64 && file_size / size > DESIRED_BLOCKS {
        size *= 2;
    }
    size as u32
}

/// Number of blocks a file of `file_size` occupies at `block_size`.
pub fn block_count(file_size: u64, block_size: u32) -> u64 {
    if file_size == 0 {
        0
    } else {
        (file_size + block_size as u64 - 1) / block_size as u64
    }
}

/// Adler-style 32-bit weak hash over a block.
pub fn weak_hash(data: &[u8]) -> u32 {
    const MOD: u32 = 65521;
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for chunk in data.chunks(4096) {
        for &byte in chunk {
            a += byte as u32;
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_files_use_min_block_size() {
        assert_eq!(block_size_for(0), MIN_BLOCK_SIZE);
        assert_eq!(block_size_for(5), MIN_BLOCK_SIZE);
        assert_eq!(block_size_for(100 * 1024 * 1024), MIN_BLOCK_SIZE);
    }

    #[test]
    fn block_size_scales_up_in_powers_of_two() {
        let size = block_size_for(8 * 1024 * 1024 * 1024);
        assert!(size > MIN_BLOCK_SIZE);
        assert!(size <= MAX_BLOCK_SIZE);
        assert!(size.is_power_of_two());
    }

    #[test]
    fn huge_files_cap_at_max_block_size() {
        assert_eq!(block_size_for(u64::MAX / 2), MAX_BLOCK_SIZE);
    }

    #[test]
    fn block_count_rounds_up() {
        assert_eq!(block_count(0, MIN_BLOCK_SIZE), 0);
        assert_eq!(block_count(1, MIN_BLOCK_SIZE), 1);
        assert_eq!(block_count(MIN_BLOCK_SIZE as u64, MIN_BLOCK_SIZE), 1);
        assert_eq!(block_count(MIN_BLOCK_SIZE as u64 + 1, MIN_BLOCK_SIZE), 2);
    }

    #[test]
    fn weak_hash_matches_adler32_vector() {
        // adler32("Wikipedia") from the algorithm's reference description
        assert_eq!(weak_hash(b"Wikipedia"), 0x11E60398);
    }

    #[test]
    fn weak_hash_distinguishes_content() {
        assert_ne!(weak_hash(b"12345"), weak_hash(b"12344"));
    }
}
