//! Block cipher transform: RC4 keystream XOR under a fixed shared key.
//!
//! The permutation is rebuilt from the key on every call, so every block is
//! encrypted from the start of the same keystream. No nonce, no state between
//! calls; the keystream repeats across blocks. Encrypt and decrypt are the same
//! function.

/// Key length in bytes.
pub const KEY_LEN: usize = 16;

/// Key shared by both peers.
const SHARED_KEY: [u8; KEY_LEN] = [
    0x00, 0x03, 0x00, 0x02, 0x07, 0x00, 0x05, 0x06, 0x0a, 0x05, 0x06, 0x0b, 0x05, 0x06, 0x06, 0x0b,
];

/// Immutable cipher key. Cheap to copy; safe to share across tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherKey([u8; KEY_LEN]);

impl CipherKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// XOR `buf` with the keystream, in place.
    pub fn apply_in_place(&self, buf: &mut [u8]) {
        let mut s = self.permutation();
        let (mut i, mut j) = (0u8, 0u8);
        for byte in buf.iter_mut() {
            i = i.wrapping_add(1);
            j = j.wrapping_add(s[i as usize]);
            s.swap(i as usize, j as usize);
            let t = s[i as usize].wrapping_add(s[j as usize]);
            *byte ^= s[t as usize];
        }
    }

    /// XOR a copy of `input` with the keystream.
    pub fn apply(&self, input: &[u8]) -> Vec<u8> {
        let mut out = input.to_vec();
        self.apply_in_place(&mut out);
        out
    }

    /// Key scheduling: identity permutation shuffled by the repeated key.
    fn permutation(&self) -> [u8; 256] {
        let mut s = [0u8; 256];
        for (i, slot) in s.iter_mut().enumerate() {
            *slot = i as u8;
        }
        let mut j = 0u8;
        for i in 0..256 {
            j = j.wrapping_add(s[i]).wrapping_add(self.0[i % KEY_LEN]);
            s.swap(i, j as usize);
        }
        s
    }
}

impl Default for CipherKey {
    fn default() -> Self {
        CipherKey(SHARED_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn roundtrip_fixed_key() {
        let key = CipherKey::default();
        let plain = b"hello world!".to_vec();
        let cipher = key.apply(&plain);
        assert_ne!(cipher, plain);
        assert_eq!(key.apply(&cipher), plain);
    }

    #[test]
    fn empty_input() {
        assert!(CipherKey::default().apply(&[]).is_empty());
    }

    #[test]
    fn keystream_restarts_per_call() {
        let key = CipherKey::default();
        let a = key.apply(&[0u8; 32]);
        let b = key.apply(&[0u8; 32]);
        assert_eq!(a, b);
        // Shorter input sees a prefix of the same keystream.
        assert_eq!(key.apply(&[0u8; 8])[..], a[..8]);
    }

    /// Straight index-arithmetic form of the same schedule and keystream.
    fn reference(key: &[u8; KEY_LEN], input: &[u8]) -> Vec<u8> {
        let mut s: Vec<usize> = (0..256).collect();
        let k: Vec<usize> = (0..256).map(|i| key[i % KEY_LEN] as usize).collect();
        let mut j = 0;
        for i in 0..256 {
            j = (j + s[i] + k[i]) % 256;
            s.swap(i, j);
        }
        let (mut i, mut j) = (0, 0);
        input
            .iter()
            .map(|b| {
                i = (i + 1) % 256;
                j = (j + s[i]) % 256;
                s.swap(i, j);
                b ^ s[(s[i] + s[j]) % 256] as u8
            })
            .collect()
    }

    #[test]
    fn matches_reference_schedule() {
        let key = CipherKey::default();
        let input: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        assert_eq!(key.apply(&input), reference(key.as_bytes(), &input));
    }

    proptest! {
        #[test]
        fn roundtrip_any_payload(payload in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let key = CipherKey::default();
            let mut buf = payload.clone();
            key.apply_in_place(&mut buf);
            key.apply_in_place(&mut buf);
            prop_assert_eq!(buf, payload);
        }
    }
}
