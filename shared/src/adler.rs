//! Adler-32 packet checksum.

const MOD_ADLER: u32 = 65521;
// Largest n such that 255n(n+1)/2 + (n+1)(MOD_ADLER-1) fits in a u32.
const NMAX: usize = 5552;

/// Computes the Adler-32 checksum of `data`.
pub fn adler_checksum(data: &[u8]) -> u32 {
    let mut a: u32 = 1;
    let mut b: u32 = 0;

    for chunk in data.chunks(NMAX) {
        for &byte in chunk {
            a += byte as u32;
            b += a;
        }
        a %= MOD_ADLER;
        b %= MOD_ADLER;
    }

    (b << 16) | a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        assert_eq!(adler_checksum(b""), 1);
        assert_eq!(adler_checksum(b"a"), 0x0062_0062);
        assert_eq!(adler_checksum(b"Wikipedia"), 0x11E6_0398);
    }

    #[test]
    fn test_long_input_spans_chunks() {
        let data = vec![0xFFu8; NMAX * 3 + 17];
        let mut a: u64 = 1;
        let mut b: u64 = 0;
        for &byte in &data {
            a = (a + byte as u64) % MOD_ADLER as u64;
            b = (b + a) % MOD_ADLER as u64;
        }
        assert_eq!(adler_checksum(&data), ((b << 16) | a) as u32);
    }

    #[test]
    fn test_single_byte_change_changes_checksum() {
        let original = b"move 10 20 north".to_vec();
        let base = adler_checksum(&original);
        for i in 0..original.len() {
            let mut corrupted = original.clone();
            corrupted[i] ^= 0x01;
            assert_ne!(adler_checksum(&corrupted), base, "byte {} flip undetected", i);
        }
    }
}
