//! Content hashing for damage tiles.
//!
//! Tiles are hashed with 32-bit MurmurHash3 (x86 variant). A tile's rows are
//! not contiguous in memory, so each row is hashed on its own with the
//! previous row's result as the seed.

/// Seed for the first row of every tile.
pub const TILE_HASH_SEED: u32 = 0;

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

#[inline(always)]
fn mix_k(mut k: u32) -> u32 {
    k = k.wrapping_mul(C1);
    k = k.rotate_left(15);
    k.wrapping_mul(C2)
}

#[inline(always)]
fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^ (h >> 16)
}

pub fn murmurhash3_32(data: &[u8], seed: u32) -> u32 {
    let mut h = seed;
    let mut blocks = data.chunks_exact(4);
    for block in &mut blocks {
        let k = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        h ^= mix_k(k);
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (shift, byte) in tail.iter().enumerate() {
            k |= u32::from(*byte) << (8 * shift);
        }
        h ^= mix_k(k);
    }

    // Only the low 32 bits of the length take part, as in the reference.
    h ^= data.len() as u32;
    fmix32(h)
}

/// Hash a sequence of row slices, chaining each row's hash into the next.
pub fn chained_rows_hash<'a, I>(rows: I) -> u32
where
    I: IntoIterator<Item = &'a [u8]>,
{
    rows.into_iter()
        .fold(TILE_HASH_SEED, |seed, row| murmurhash3_32(row, seed))
}
