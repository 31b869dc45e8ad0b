//! # Secure Frame Pipeline
//!
//! Turns plaintext packet bytes into wire frames and back.
//!
//! ## Send path
//! 1. Raw deflate at the configured level
//! 2. Append `checksum(send_counter, compressed, key)`
//! 3. AES-256-CFB8, continuing the keystream of earlier frames
//! 4. Increment the send counter
//!
//! ## Receive path
//! 1. AES-256-CFB8 decrypt, continuing the keystream
//! 2. Split off the trailing 8-byte checksum and verify it against the receive counter
//! 3. Increment the receive counter, then inflate
//!
//! Counters are never transmitted, so a dropped, duplicated or reordered frame
//! fails verification. A checksum or inflate failure poisons the decryptor: every
//! later frame is rejected because the keystream can no longer be trusted.
//!
//! Each direction owns its own cipher state and counter, so the two halves of a
//! [`FramePipeline`] can be moved to different tasks.

use crate::config::{FrameConfig, CHECKSUM_LEN, IV_LEN, KEY_LEN};
use crate::core::checksum;
use crate::error::{constants, ProtocolError, Result};
use crate::utils::compression::{self, DeflateOptions};
use crate::utils::crypto::{Cfb8, CipherBackend};
use crate::utils::metrics::global_metrics;
use std::fmt;
use tracing::{debug, error};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Shared key and IV established by the session layer
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretMaterial {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl SecretMaterial {
    pub fn new(key: [u8; KEY_LEN], iv: [u8; IV_LEN]) -> Self {
        Self { key, iv }
    }

    /// Copy key material out of slices, checking their lengths.
    pub fn from_slices(key: &[u8], iv: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] = key
            .try_into()
            .map_err(|_| ProtocolError::SecurityError(constants::ERR_BAD_KEY_LENGTH.into()))?;
        let iv: [u8; IV_LEN] = iv
            .try_into()
            .map_err(|_| ProtocolError::SecurityError(constants::ERR_BAD_IV_LENGTH.into()))?;
        Ok(Self { key, iv })
    }

    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }
}

impl fmt::Debug for SecretMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretMaterial([REDACTED])")
    }
}

/// Outbound half: compress, checksum, encrypt.
#[derive(Debug)]
pub struct FrameEncryptor {
    secret: SecretMaterial,
    cipher: Cfb8,
    counter: u64,
    options: DeflateOptions,
}

impl FrameEncryptor {
    pub fn new(secret: SecretMaterial, config: &FrameConfig) -> Result<Self> {
        compression::checked_level(config.compression_level)?;
        let cipher = Cfb8::encryptor(secret.key(), secret.iv(), config.cipher_backend)?;
        Ok(Self {
            secret,
            cipher,
            counter: 0,
            options: deflate_options(config),
        })
    }

    /// Frames sealed so far.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn options(&self) -> DeflateOptions {
        self.options
    }

    pub fn backend(&self) -> CipherBackend {
        self.cipher.backend()
    }

    /// Compress and seal one plaintext packet.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let compressed = compression::compress(plaintext, self.options.level)?;
        self.seal(compressed)
    }

    /// Checksum and encrypt an already compressed payload.
    ///
    /// The counter only advances once the frame is complete.
    pub fn seal(&mut self, mut compressed: Vec<u8>) -> Result<Vec<u8>> {
        let next = self
            .counter
            .checked_add(1)
            .ok_or_else(|| ProtocolError::SecurityError(constants::ERR_COUNTER_EXHAUSTED.into()))?;
        let sum = checksum::compute(self.counter, &compressed, self.secret.key());
        compressed.extend_from_slice(&sum);
        self.cipher.apply(&mut compressed);
        debug!(counter = self.counter, frame_len = compressed.len(), "Frame sealed");
        self.counter = next;
        global_metrics().frame_sealed(compressed.len() as u64);
        Ok(compressed)
    }
}

/// Inbound half: decrypt, verify, decompress.
#[derive(Debug)]
pub struct FrameDecryptor {
    secret: SecretMaterial,
    cipher: Cfb8,
    counter: u64,
    options: DeflateOptions,
    poisoned: bool,
}

impl FrameDecryptor {
    pub fn new(secret: SecretMaterial, config: &FrameConfig) -> Result<Self> {
        let cipher = Cfb8::decryptor(secret.key(), secret.iv(), config.cipher_backend)?;
        Ok(Self {
            secret,
            cipher,
            counter: 0,
            options: deflate_options(config),
            poisoned: false,
        })
    }

    /// Frames verified so far.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn options(&self) -> DeflateOptions {
        self.options
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Refuse every later frame.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    /// Open and inflate one frame.
    pub fn decrypt(&mut self, frame: Vec<u8>) -> Result<Vec<u8>> {
        let compressed = self.open(frame)?;
        let result = compression::decompress(&compressed, self.options.max_output);
        self.settle(result)
    }

    /// Decrypt and verify one frame, returning the compressed payload.
    pub fn open(&mut self, mut frame: Vec<u8>) -> Result<Vec<u8>> {
        if self.poisoned {
            return Err(ProtocolError::SecurityError(
                constants::ERR_PIPELINE_POISONED.into(),
            ));
        }
        self.cipher.apply(&mut frame);
        let Some(body_len) = frame.len().checked_sub(CHECKSUM_LEN) else {
            return Err(self.integrity_violation(frame.len()));
        };
        let expected = checksum::compute(self.counter, &frame[..body_len], self.secret.key());
        if !checksum::verify(&expected, &frame[body_len..]) {
            return Err(self.integrity_violation(frame.len()));
        }
        let next = self
            .counter
            .checked_add(1)
            .ok_or_else(|| ProtocolError::SecurityError(constants::ERR_COUNTER_EXHAUSTED.into()))?;
        debug!(counter = self.counter, frame_len = frame.len(), "Frame verified");
        self.counter = next;
        global_metrics().frame_opened(frame.len() as u64);
        frame.truncate(body_len);
        Ok(frame)
    }

    /// Record the outcome of inflating an opened payload.
    pub fn settle(&mut self, inflated: Result<Vec<u8>>) -> Result<Vec<u8>> {
        inflated.map_err(|e| {
            self.poisoned = true;
            global_metrics().corrupt_payload();
            error!(counter = self.counter, error = %e, "Verified frame failed to inflate");
            e
        })
    }

    fn integrity_violation(&mut self, frame_len: usize) -> ProtocolError {
        self.poisoned = true;
        global_metrics().integrity_failure();
        error!(counter = self.counter, frame_len, "Frame checksum mismatch");
        ProtocolError::IntegrityViolation {
            counter: self.counter,
        }
    }
}

fn deflate_options(config: &FrameConfig) -> DeflateOptions {
    DeflateOptions {
        level: config.compression_level,
        max_output: config.max_decompressed_size,
    }
}

/// Both directions of one connection.
#[derive(Debug)]
pub struct FramePipeline {
    encryptor: FrameEncryptor,
    decryptor: FrameDecryptor,
}

impl FramePipeline {
    pub fn new(secret: SecretMaterial, config: &FrameConfig) -> Result<Self> {
        Ok(Self {
            encryptor: FrameEncryptor::new(secret.clone(), config)?,
            decryptor: FrameDecryptor::new(secret, config)?,
        })
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.encryptor.encrypt(plaintext)
    }

    pub fn decrypt(&mut self, frame: Vec<u8>) -> Result<Vec<u8>> {
        self.decryptor.decrypt(frame)
    }

    pub fn send_counter(&self) -> u64 {
        self.encryptor.counter()
    }

    pub fn recv_counter(&self) -> u64 {
        self.decryptor.counter()
    }

    /// Separate the directions so they can run in parallel.
    pub fn into_split(self) -> (FrameEncryptor, FrameDecryptor) {
        (self.encryptor, self.decryptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(backend: CipherBackend) -> FrameConfig {
        FrameConfig {
            cipher_backend: backend,
            ..FrameConfig::default()
        }
    }

    fn pair() -> (FrameEncryptor, FrameDecryptor) {
        let secret = SecretMaterial::new([7; KEY_LEN], [3; IV_LEN]);
        let (tx, _) = FramePipeline::new(secret.clone(), &FrameConfig::default())
            .unwrap()
            .into_split();
        let (_, rx) = FramePipeline::new(secret, &FrameConfig::default())
            .unwrap()
            .into_split();
        (tx, rx)
    }

    #[test]
    fn test_frames_roundtrip_in_order() {
        let (mut tx, mut rx) = pair();
        for i in 0..5u8 {
            let payload = vec![i; 100 + i as usize];
            let frame = tx.encrypt(&payload).unwrap();
            assert_eq!(rx.decrypt(frame).unwrap(), payload);
        }
        assert_eq!(tx.counter(), 5);
        assert_eq!(rx.counter(), 5);
    }

    #[test]
    fn test_frame_layout() {
        let secret = SecretMaterial::new([0; KEY_LEN], [0; IV_LEN]);
        let mut tx = FrameEncryptor::new(secret, &config(CipherBackend::Software)).unwrap();
        let plaintext = b"abc";
        let compressed = compression::compress(plaintext, 7).unwrap();
        let frame = tx.encrypt(plaintext).unwrap();
        assert_eq!(frame.len(), compressed.len() + CHECKSUM_LEN);

        let mut cipher = Cfb8::decryptor(&[0; KEY_LEN], &[0; IV_LEN], CipherBackend::Software).unwrap();
        let mut clear = frame;
        cipher.apply(&mut clear);
        assert_eq!(&clear[..compressed.len()], compressed.as_slice());
        assert_eq!(
            &clear[compressed.len()..],
            &checksum::compute(0, &compressed, &[0; KEY_LEN])
        );
    }

    #[test]
    fn test_replayed_frame_rejected_and_poisons() {
        let (mut tx, mut rx) = pair();
        let frames: Vec<_> = (0..3u8).map(|i| tx.encrypt(&[i; 10]).unwrap()).collect();
        for frame in &frames {
            rx.decrypt(frame.clone()).unwrap();
        }
        let err = rx.decrypt(frames[1].clone()).unwrap_err();
        assert!(matches!(err, ProtocolError::IntegrityViolation { counter: 3 }));
        assert!(err.is_fatal());
        assert_eq!(rx.counter(), 3);

        let next = tx.encrypt(b"fine").unwrap();
        assert!(matches!(
            rx.decrypt(next),
            Err(ProtocolError::SecurityError(_))
        ));
    }

    #[test]
    fn test_tampered_byte_rejected() {
        let (mut tx, mut rx) = pair();
        let mut frame = tx.encrypt(b"hello world").unwrap();
        frame[0] ^= 0x01;
        assert!(matches!(
            rx.decrypt(frame),
            Err(ProtocolError::IntegrityViolation { counter: 0 })
        ));
        assert!(rx.is_poisoned());
    }

    #[test]
    fn test_short_frame_rejected() {
        let (_, mut rx) = pair();
        assert!(matches!(
            rx.decrypt(vec![1, 2, 3]),
            Err(ProtocolError::IntegrityViolation { .. })
        ));
    }

    #[test]
    fn test_verified_garbage_is_corrupt_payload() {
        let (mut tx, mut rx) = pair();
        let frame = tx.seal(vec![0xff, 0xff, 0xff]).unwrap();
        let err = rx.decrypt(frame).unwrap_err();
        assert!(matches!(err, ProtocolError::CorruptPayload(_)));
        assert_eq!(rx.counter(), 1);
        assert!(rx.is_poisoned());
    }

    #[test]
    fn test_backends_interoperate() {
        let secret = SecretMaterial::new([9; KEY_LEN], [1; IV_LEN]);
        let mut tx = FrameEncryptor::new(secret.clone(), &config(CipherBackend::Software)).unwrap();
        let mut rx = FrameDecryptor::new(secret, &config(CipherBackend::Auto)).unwrap();
        for i in 0..3u8 {
            let frame = tx.encrypt(&[i; 64]).unwrap();
            assert_eq!(rx.decrypt(frame).unwrap(), vec![i; 64]);
        }
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = SecretMaterial::new([0xab; KEY_LEN], [0xcd; IV_LEN]);
        let shown = format!("{secret:?}");
        assert!(!shown.contains("171"));
        assert!(shown.contains("REDACTED"));
        assert!(SecretMaterial::from_slices(&[0; 31], &[0; IV_LEN]).is_err());
    }

    #[test]
    fn test_out_of_range_level_fails_construction() {
        let config = FrameConfig {
            compression_level: 12,
            ..FrameConfig::default()
        };
        let secret = SecretMaterial::new([7; KEY_LEN], [3; IV_LEN]);
        assert!(matches!(
            FramePipeline::new(secret, &config),
            Err(ProtocolError::InvalidValue(_))
        ));
    }
}
