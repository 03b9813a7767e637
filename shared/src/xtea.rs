//! XTEA block cipher used for game traffic.
//!
//! Blocks are two little-endian `u32` words, keys four little-endian words.

const DELTA: u32 = 0x9E37_79B9;
const ROUNDS: u32 = 32;

/// A 128-bit XTEA key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct XteaKey([u32; 4]);

impl XteaKey {
    pub fn new(words: [u32; 4]) -> Self {
        Self(words)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let mut words = [0u32; 4];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self(words)
    }

    pub fn words(&self) -> [u32; 4] {
        self.0
    }
}

impl std::fmt::Debug for XteaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("XteaKey(..)")
    }
}

fn load(block: &[u8]) -> (u32, u32) {
    (
        u32::from_le_bytes([block[0], block[1], block[2], block[3]]),
        u32::from_le_bytes([block[4], block[5], block[6], block[7]]),
    )
}

fn store(block: &mut [u8], v0: u32, v1: u32) {
    block[..4].copy_from_slice(&v0.to_le_bytes());
    block[4..8].copy_from_slice(&v1.to_le_bytes());
}

/// Encrypts `data` in place. `data.len()` must be a multiple of 8.
pub fn encrypt(data: &mut [u8], key: &XteaKey) {
    debug_assert_eq!(data.len() % 8, 0);
    let k = key.0;
    for block in data.chunks_exact_mut(8) {
        let (mut v0, mut v1) = load(block);
        let mut sum: u32 = 0;
        for _ in 0..ROUNDS {
            v0 = v0.wrapping_add(
                ((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1) ^ sum.wrapping_add(k[(sum & 3) as usize]),
            );
            sum = sum.wrapping_add(DELTA);
            v1 = v1.wrapping_add(
                ((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0)
                    ^ sum.wrapping_add(k[((sum >> 11) & 3) as usize]),
            );
        }
        store(block, v0, v1);
    }
}

/// Decrypts `data` in place. `data.len()` must be a multiple of 8.
pub fn decrypt(data: &mut [u8], key: &XteaKey) {
    debug_assert_eq!(data.len() % 8, 0);
    let k = key.0;
    for block in data.chunks_exact_mut(8) {
        let (mut v0, mut v1) = load(block);
        let mut sum = DELTA.wrapping_mul(ROUNDS);
        for _ in 0..ROUNDS {
            v1 = v1.wrapping_sub(
                ((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0)
                    ^ sum.wrapping_add(k[((sum >> 11) & 3) as usize]),
            );
            sum = sum.wrapping_sub(DELTA);
            v0 = v0.wrapping_sub(
                ((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1) ^ sum.wrapping_add(k[(sum & 3) as usize]),
            );
        }
        store(block, v0, v1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> XteaKey {
        XteaKey::new([0x0123_4567, 0x89AB_CDEF, 0xFEDC_BA98, 0x7654_3210])
    }

    #[test]
    fn test_round_trip_multiple_blocks() {
        let original: Vec<u8> = (0..64u8).collect();
        let mut data = original.clone();
        encrypt(&mut data, &key());
        assert_ne!(data, original);
        decrypt(&mut data, &key());
        assert_eq!(data, original);
    }

    #[test]
    fn test_wrong_key_does_not_decrypt() {
        let original = b"secret!!".to_vec();
        let mut data = original.clone();
        encrypt(&mut data, &key());
        decrypt(&mut data, &XteaKey::new([1, 2, 3, 4]));
        assert_ne!(data, original);
    }

    #[test]
    fn test_blocks_are_independent() {
        let mut data = [7u8; 16];
        encrypt(&mut data, &key());
        assert_eq!(data[..8], data[8..]);
    }

    #[test]
    fn test_key_from_bytes_is_little_endian() {
        let mut bytes = [0u8; 16];
        bytes[0] = 1;
        bytes[4] = 2;
        bytes[15] = 0x80;
        assert_eq!(XteaKey::from_bytes(bytes).words(), [1, 2, 0, 0x8000_0000]);
    }
}
