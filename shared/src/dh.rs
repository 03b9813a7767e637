//! Diffie-Hellman key agreement over a 128-bit prime field.
//!
//! Each side draws a fresh private key per connection, sends its public
//! key in the clear and derives the same 16-byte secret, which becomes the
//! connection's XTEA key.

use crate::xtea::XteaKey;
use rand::Rng;

/// Field prime, 2^128 - 159.
pub const DH_PRIME: u128 = u128::MAX - 158;
pub const DH_GENERATOR: u128 = 5;
pub const DH_KEY_LENGTH: usize = 16;

fn add_mod(a: u128, b: u128) -> u128 {
    let (sum, overflow) = a.overflowing_add(b);
    if overflow || sum >= DH_PRIME {
        sum.wrapping_sub(DH_PRIME)
    } else {
        sum
    }
}

fn mul_mod(a: u128, b: u128) -> u128 {
    let a = a % DH_PRIME;
    let mut result = 0u128;
    for bit in (0..128).rev() {
        result = add_mod(result, result);
        if (b >> bit) & 1 == 1 {
            result = add_mod(result, a);
        }
    }
    result
}

fn pow_mod(base: u128, exponent: u128) -> u128 {
    let mut result = 1u128;
    let mut base = base % DH_PRIME;
    let mut exponent = exponent;
    while exponent > 0 {
        if exponent & 1 == 1 {
            result = mul_mod(result, base);
        }
        base = mul_mod(base, base);
        exponent >>= 1;
    }
    result
}

fn is_valid_public(value: u128) -> bool {
    value >= 2 && value <= DH_PRIME - 2
}

/// One side's key pair.
pub struct DhKeyPair {
    private: u128,
    public: u128,
}

impl DhKeyPair {
    /// Generates a fresh key pair from the thread-local RNG.
    pub fn generate() -> Self {
        let private = rand::thread_rng().gen_range(2..DH_PRIME - 1);
        Self::from_private(private)
    }

    pub fn from_private(private: u128) -> Self {
        Self {
            private,
            public: pow_mod(DH_GENERATOR, private),
        }
    }

    pub fn public_key(&self) -> [u8; DH_KEY_LENGTH] {
        self.public.to_le_bytes()
    }

    /// Derives the shared XTEA key from the peer's public key.
    ///
    /// Returns `None` for degenerate public keys.
    pub fn shared_key(&self, peer_public: &[u8; DH_KEY_LENGTH]) -> Option<XteaKey> {
        let peer = u128::from_le_bytes(*peer_public);
        if !is_valid_public(peer) {
            return None;
        }
        let secret = pow_mod(peer, self.private);
        Some(XteaKey::from_bytes(secret.to_le_bytes()))
    }
}
