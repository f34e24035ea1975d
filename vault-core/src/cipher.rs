//! File encryption: AES-256-CBC with PKCS#7 padding, processed in fixed windows.
//!
//! Ciphertext layout for one file: `iv[16] | cbc(plaintext ++ padding)`. The IV is
//! random per file.

use aes::Aes256;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::identity::SessionKey;

pub const BLOCK_SIZE: usize = 16;
pub const IV_SIZE: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Exact ciphertext length for a plaintext of `plaintext_len` bytes.
pub fn ciphertext_len(plaintext_len: u64) -> u64 {
    IV_SIZE as u64 + (plaintext_len / BLOCK_SIZE as u64 + 1) * BLOCK_SIZE as u64
}

/// Encrypt a whole buffer.
pub fn encrypt(key: &SessionKey, plaintext: &[u8]) -> Vec<u8> {
    let mut enc = StreamEncryptor::new(key);
    let mut out = enc.update(plaintext);
    out.extend_from_slice(&enc.finish());
    out
}

/// Decrypt a whole buffer produced by [`encrypt`] or [`StreamEncryptor`].
pub fn decrypt(key: &SessionKey, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
    let mut dec = StreamDecryptor::new(key);
    let mut out = dec.update(ciphertext);
    out.extend_from_slice(&dec.finish()?);
    Ok(out)
}

/// Incremental encryptor. Output of successive `update` calls followed by `finish`
/// concatenates to the full ciphertext.
pub struct StreamEncryptor {
    inner: Aes256CbcEnc,
    iv: [u8; IV_SIZE],
    iv_emitted: bool,
    pending: Vec<u8>,
}

impl StreamEncryptor {
    pub fn new(key: &SessionKey) -> Self {
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);
        Self::with_iv(key, iv)
    }

    pub fn with_iv(key: &SessionKey, iv: [u8; IV_SIZE]) -> Self {
        let inner = Aes256CbcEnc::new(
            GenericArray::from_slice(key.as_bytes()),
            GenericArray::from_slice(&iv),
        );
        Self {
            inner,
            iv,
            iv_emitted: false,
            pending: Vec::with_capacity(BLOCK_SIZE),
        }
    }

    /// Encrypt every complete block available; a partial tail waits for more input.
    pub fn update(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(IV_SIZE + plaintext.len() + BLOCK_SIZE);
        self.emit_iv(&mut out);
        self.pending.extend_from_slice(plaintext);
        let full = self.pending.len() / BLOCK_SIZE * BLOCK_SIZE;
        let mut blocks: Vec<u8> = self.pending.drain(..full).collect();
        for block in blocks.chunks_exact_mut(BLOCK_SIZE) {
            self.inner
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        out.extend_from_slice(&blocks);
        out
    }

    /// Pad the tail and encrypt the last block. Always emits at least one block.
    pub fn finish(mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IV_SIZE + BLOCK_SIZE);
        self.emit_iv(&mut out);
        let pad = BLOCK_SIZE - self.pending.len();
        let mut last = std::mem::take(&mut self.pending);
        last.resize(BLOCK_SIZE, pad as u8);
        self.inner
            .encrypt_block_mut(GenericArray::from_mut_slice(&mut last));
        out.extend_from_slice(&last);
        out
    }

    fn emit_iv(&mut self, out: &mut Vec<u8>) {
        if !self.iv_emitted {
            out.extend_from_slice(&self.iv);
            self.iv_emitted = true;
        }
    }
}

/// Incremental decryptor. The final block is held back until `finish` so its padding
/// can be checked and stripped.
pub struct StreamDecryptor {
    key: SessionKey,
    inner: Option<Aes256CbcDec>,
    pending: Vec<u8>,
}

impl StreamDecryptor {
    pub fn new(key: &SessionKey) -> Self {
        Self {
            key: key.clone(),
            inner: None,
            pending: Vec::new(),
        }
    }

    /// Decrypt every block that is not the last one seen so far. Buffers at most one block
    /// (plus the IV before it is complete); input is copied once, into the output.
    pub fn update(&mut self, ciphertext: &[u8]) -> Vec<u8> {
        let mut input = ciphertext;
        if self.inner.is_none() {
            let take = (IV_SIZE - self.pending.len()).min(input.len());
            self.pending.extend_from_slice(&input[..take]);
            input = &input[take..];
            if self.pending.len() < IV_SIZE {
                return Vec::new();
            }
            self.inner = Some(Aes256CbcDec::new(
                GenericArray::from_slice(self.key.as_bytes()),
                GenericArray::from_slice(&self.pending),
            ));
            self.pending.clear();
        }
        let held = self.pending.len();
        let ready = (held + input.len()).saturating_sub(1) / BLOCK_SIZE * BLOCK_SIZE;
        let from_held = held.min(ready);
        let from_input = ready - from_held;

        let mut out = Vec::with_capacity(ready);
        out.extend_from_slice(&self.pending[..from_held]);
        out.extend_from_slice(&input[..from_input]);
        self.pending.drain(..from_held);
        self.pending.extend_from_slice(&input[from_input..]);

        if let Some(inner) = self.inner.as_mut() {
            for block in out.chunks_exact_mut(BLOCK_SIZE) {
                inner.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
        }
        out
    }

    pub fn finish(mut self) -> Result<Vec<u8>, CipherError> {
        let Some(mut inner) = self.inner.take() else {
            return Err(CipherError::Truncated);
        };
        match self.pending.len() {
            0 => return Err(CipherError::Truncated),
            BLOCK_SIZE => {}
            _ => return Err(CipherError::Misaligned),
        }
        let mut last = std::mem::take(&mut self.pending);
        inner.decrypt_block_mut(GenericArray::from_mut_slice(&mut last));
        let pad = last[BLOCK_SIZE - 1] as usize;
        if pad == 0 || pad > BLOCK_SIZE {
            return Err(CipherError::BadPadding);
        }
        if last[BLOCK_SIZE - pad..].iter().any(|&b| b as usize != pad) {
            return Err(CipherError::BadPadding);
        }
        last.truncate(BLOCK_SIZE - pad);
        Ok(last)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("ciphertext truncated")]
    Truncated,
    #[error("ciphertext not block aligned")]
    Misaligned,
    #[error("invalid padding")]
    BadPadding,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn lengths_are_block_aligned() {
        let key = SessionKey::generate();
        for len in [0usize, 1, 15, 16, 17, 31, 32, 1000] {
            let ct = encrypt(&key, &vec![0xAB; len]);
            assert_eq!(ct.len() as u64, ciphertext_len(len as u64));
            assert_eq!((ct.len() - IV_SIZE) % BLOCK_SIZE, 0);
        }
    }

    #[test]
    fn random_iv_per_file() {
        let key = SessionKey::generate();
        let a = encrypt(&key, b"same plaintext");
        let b = encrypt(&key, b"same plaintext");
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_or_garbles() {
        let key = SessionKey::generate();
        let other = SessionKey::generate();
        let ct = encrypt(&key, b"secret contents of a file");
        match decrypt(&other, &ct) {
            Ok(p) => assert_ne!(p, b"secret contents of a file"),
            Err(e) => assert_eq!(e, CipherError::BadPadding),
        }
    }

    #[test]
    fn rejects_truncated_and_misaligned() {
        let key = SessionKey::generate();
        let ct = encrypt(&key, b"0123456789abcdef0123");
        assert_eq!(decrypt(&key, &ct[..10]), Err(CipherError::Truncated));
        assert_eq!(decrypt(&key, &ct[..IV_SIZE]), Err(CipherError::Truncated));
        assert_eq!(decrypt(&key, &ct[..ct.len() - 3]), Err(CipherError::Misaligned));
    }

    #[test]
    fn rejects_bad_padding() {
        let key = SessionKey::generate();
        let iv = [9u8; IV_SIZE];
        // Encrypt a raw block whose last byte is not a valid pad length.
        let mut enc = Aes256CbcEnc::new(
            GenericArray::from_slice(key.as_bytes()),
            GenericArray::from_slice(&iv),
        );
        let mut block = [0u8; BLOCK_SIZE];
        enc.encrypt_block_mut(GenericArray::from_mut_slice(&mut block));
        let mut ct = iv.to_vec();
        ct.extend_from_slice(&block);
        assert_eq!(decrypt(&key, &ct), Err(CipherError::BadPadding));
    }

    #[test]
    fn streaming_windows_match_one_shot() {
        let key = SessionKey::generate();
        let iv = [3u8; IV_SIZE];
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        let mut one = StreamEncryptor::with_iv(&key, iv);
        let mut expected = one.update(&data);
        expected.extend_from_slice(&one.finish());

        let mut enc = StreamEncryptor::with_iv(&key, iv);
        let mut ct = Vec::new();
        for window in data.chunks(333) {
            ct.extend_from_slice(&enc.update(window));
        }
        ct.extend_from_slice(&enc.finish());
        assert_eq!(ct, expected);

        let mut dec = StreamDecryptor::new(&key);
        let mut plain = Vec::new();
        for window in ct.chunks(100) {
            plain.extend_from_slice(&dec.update(window));
        }
        plain.extend_from_slice(&dec.finish().unwrap());
        assert_eq!(plain, data);
    }

    #[test]
    fn decryptor_holds_back_at_most_one_block() {
        let key = SessionKey::generate();
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 239) as u8).collect();
        let ct = encrypt(&key, &data);
        let mut dec = StreamDecryptor::new(&key);
        let mut plain = Vec::new();
        for (i, window) in ct.chunks(1000).enumerate() {
            let out = dec.update(window);
            assert_eq!(out.len() % BLOCK_SIZE, 0);
            assert!(dec.pending.len() <= BLOCK_SIZE, "window {i} left {}", dec.pending.len());
            plain.extend_from_slice(&out);
        }
        plain.extend_from_slice(&dec.finish().unwrap());
        assert_eq!(plain, data);
    }

    proptest! {
        #[test]
        fn split_points_do_not_matter(
            data in prop::collection::vec(any::<u8>(), 0..600),
            cuts in prop::collection::vec(0usize..700, 0..6),
        ) {
            let key = SessionKey::generate();
            let ct = encrypt(&key, &data);
            let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c.min(ct.len())).collect();
            cuts.sort_unstable();
            let mut dec = StreamDecryptor::new(&key);
            let mut plain = Vec::new();
            let mut start = 0;
            for cut in cuts.into_iter().chain(std::iter::once(ct.len())) {
                plain.extend_from_slice(&dec.update(&ct[start..cut]));
                start = cut;
            }
            plain.extend_from_slice(&dec.finish().unwrap());
            prop_assert_eq!(plain, data);
        }

        #[test]
        fn encrypt_decrypt_roundtrip(data in prop::collection::vec(any::<u8>(), 0..4096)) {
            let key = SessionKey::generate();
            let ct = encrypt(&key, &data);
            prop_assert_eq!(decrypt(&key, &ct).unwrap(), data);
        }
    }
}
