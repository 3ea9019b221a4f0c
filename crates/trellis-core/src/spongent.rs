//! SPONGENT-128/128/8 sponge-wrap AEAD
//!
//! Sancus event managers authenticate and wrap connection keys with a
//! SPONGENT-based duplex construction in hardware; this is the deployer-side
//! counterpart. The permutation is SPONGENT-128/128/8 (136-bit state, 8-bit
//! rate, 70 rounds). Keys and tags are both 16 bytes, the Sancus security
//! parameter.

use crate::crypto::{ct_eq, CryptoError};

/// Sancus security parameter in bytes (SECURITY = 128)
pub const KEY_SIZE: usize = 16;
/// Authentication tag length, equal to the security parameter
pub const TAG_SIZE: usize = 16;

/// Permutation width in bytes (b = 136 bits)
const STATE_BYTES: usize = 17;
/// Number of permutation rounds
const ROUNDS: usize = 70;
/// Initial lCounter value for the 136-bit variant
const LFSR_IV: u8 = 0x7a;

/// SPONGENT 4-bit S-box
const SBOX: [u8; 16] = [
    0xe, 0xd, 0xb, 0x0, 0x2, 0x1, 0x4, 0xf, 0x7, 0xa, 0x8, 0x5, 0x9, 0xc, 0x3, 0x6,
];

// Domain-separation bytes injected between absorb phases
const DOMAIN_KEY: u8 = 0x01;
const DOMAIN_AD: u8 = 0x02;
const DOMAIN_TAG: u8 = 0x04;

/// Wrap `data` under `key`, authenticating `ad`. Returns `cipher || tag`.
pub fn wrap(key: &[u8], ad: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut state = init(key)?;
    absorb(&mut state, ad, DOMAIN_AD);

    let mut out = Vec::with_capacity(data.len() + TAG_SIZE);
    for &p in data {
        let c = p ^ state[0];
        state[0] = c;
        permute(&mut state);
        out.push(c);
    }

    out.extend_from_slice(&squeeze_tag(&mut state));
    Ok(out)
}

/// Unwrap `cipher || tag`, verifying the tag against `key` and `ad`.
pub fn unwrap(key: &[u8], ad: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < TAG_SIZE {
        return Err(CryptoError::TruncatedCiphertext);
    }
    let (cipher, tag) = data.split_at(data.len() - TAG_SIZE);

    let mut state = init(key)?;
    absorb(&mut state, ad, DOMAIN_AD);

    let mut out = Vec::with_capacity(cipher.len());
    for &c in cipher {
        out.push(c ^ state[0]);
        state[0] = c;
        permute(&mut state);
    }

    if !ct_eq(&squeeze_tag(&mut state), tag) {
        return Err(CryptoError::DecryptionFailed);
    }
    Ok(out)
}

/// MAC of `ad` alone: the tag of an empty plaintext.
pub fn mac(key: &[u8], ad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    wrap(key, ad, &[])
}

fn init(key: &[u8]) -> Result<[u8; STATE_BYTES], CryptoError> {
    if key.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            got: key.len(),
        });
    }
    let mut state = [0u8; STATE_BYTES];
    absorb(&mut state, key, DOMAIN_KEY);
    Ok(state)
}

/// Duplex one byte at a time through the rate portion of the state,
/// closing the phase with a domain-separation byte.
fn absorb(state: &mut [u8; STATE_BYTES], data: &[u8], domain: u8) {
    for &b in data {
        state[0] ^= b;
        permute(state);
    }
    state[1] ^= domain;
    permute(state);
}

fn squeeze_tag(state: &mut [u8; STATE_BYTES]) -> [u8; TAG_SIZE] {
    state[1] ^= DOMAIN_TAG;
    permute(state);

    let mut tag = [0u8; TAG_SIZE];
    for byte in tag.iter_mut() {
        *byte = state[0];
        permute(state);
    }
    tag
}

/// The SPONGENT permutation: counter injection, S-box layer, bit permutation.
fn permute(state: &mut [u8; STATE_BYTES]) {
    let mut lfsr = LFSR_IV;
    for _ in 0..ROUNDS {
        // lCounter into the low end, its bit-reversal into the high end
        state[0] ^= lfsr;
        state[STATE_BYTES - 1] ^= reverse7(lfsr) << 1;

        for b in state.iter_mut() {
            *b = SBOX[(*b >> 4) as usize] << 4 | SBOX[(*b & 0x0f) as usize];
        }

        p_layer(state);

        lfsr = ((lfsr << 1) | (((lfsr >> 6) ^ (lfsr >> 5)) & 1)) & 0x7f;
    }
}

/// pLayer: bit j moves to (j * b/4) mod (b-1); the last bit is fixed.
fn p_layer(state: &mut [u8; STATE_BYTES]) {
    const BITS: usize = STATE_BYTES * 8;
    let mut out = [0u8; STATE_BYTES];
    for j in 0..BITS {
        let bit = (state[j / 8] >> (j % 8)) & 1;
        let to = if j == BITS - 1 {
            j
        } else {
            j * (BITS / 4) % (BITS - 1)
        };
        out[to / 8] |= bit << (to % 8);
    }
    *state = out;
}

fn reverse7(v: u8) -> u8 {
    let mut out = 0u8;
    for i in 0..7 {
        out |= ((v >> i) & 1) << (6 - i);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_SIZE] = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee,
        0xff,
    ];

    #[test]
    fn test_wrap_roundtrip() {
        let ad = [0x00, 0x07, 0x00, 0x05, 0x00, 0x00];
        let data = b"sixteen byte key";

        let wrapped = wrap(&KEY, &ad, data).unwrap();
        assert_eq!(wrapped.len(), data.len() + TAG_SIZE);

        let plain = unwrap(&KEY, &ad, &wrapped).unwrap();
        assert_eq!(plain, data);
    }

    #[test]
    fn test_wrap_is_deterministic() {
        let a = wrap(&KEY, b"ad", b"data").unwrap();
        let b = wrap(&KEY, b"ad", b"data").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unwrap_rejects_bit_flips() {
        let wrapped = wrap(&KEY, b"ad", b"payload").unwrap();

        for i in 0..wrapped.len() {
            let mut tampered = wrapped.clone();
            tampered[i] ^= 1;
            assert!(unwrap(&KEY, b"ad", &tampered).is_err());
        }
    }

    #[test]
    fn test_unwrap_rejects_altered_ad() {
        let wrapped = wrap(&KEY, b"nonce=0", b"payload").unwrap();
        assert!(matches!(
            unwrap(&KEY, b"nonce=1", &wrapped),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_different_keys_diverge() {
        let mut other = KEY;
        other[0] ^= 1;
        assert_ne!(
            wrap(&KEY, b"ad", b"data").unwrap(),
            wrap(&other, b"ad", b"data").unwrap()
        );
    }

    #[test]
    fn test_mac_matches_empty_wrap() {
        let challenge = [0xab; 16];
        assert_eq!(
            mac(&KEY, &challenge).unwrap(),
            wrap(&KEY, &challenge, &[]).unwrap()
        );
        assert_eq!(mac(&KEY, &challenge).unwrap().len(), TAG_SIZE);
    }

    #[test]
    fn test_one_bit_challenge_flip_changes_mac() {
        let mut challenge = [0u8; 16];
        let before = mac(&KEY, &challenge).unwrap();
        challenge[15] ^= 1;
        let after = mac(&KEY, &challenge).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_short_key_rejected() {
        assert!(matches!(
            wrap(&KEY[..8], b"", b""),
            Err(CryptoError::InvalidKeyLength { expected: 16, got: 8 })
        ));
    }

    #[test]
    fn test_truncated_ciphertext_rejected() {
        assert!(matches!(
            unwrap(&KEY, b"", &[0u8; 8]),
            Err(CryptoError::TruncatedCiphertext)
        ));
    }
}
