//! AES-256 in CFB-8 mode.
//!
//! Each byte is XORed with the first byte of the AES encryption of a 16-byte
//! shift register, and the ciphertext byte is then shifted into the register. The
//! register survives between calls, so one cipher instance is one continuous
//! keystream for the whole connection.
//!
//! Two interchangeable backends produce identical output:
//! - **Native**: the `cfb8` crate (default `native-cipher` feature)
//! - **Software**: the shift register driven directly over the AES block function

use crate::config::{IV_LEN, KEY_LEN};
use crate::error::{constants, ProtocolError, Result};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

#[cfg(feature = "native-cipher")]
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

/// Which CFB-8 implementation a pipeline uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CipherBackend {
    /// Library cipher when compiled in, software otherwise
    #[default]
    Auto,
    Native,
    Software,
}

impl CipherBackend {
    /// Whether the library backend is compiled into this build.
    pub const fn native_available() -> bool {
        cfg!(feature = "native-cipher")
    }

    /// Resolve `Auto` to a concrete backend.
    pub fn resolve(self) -> Result<Self> {
        match self {
            CipherBackend::Auto if Self::native_available() => Ok(CipherBackend::Native),
            CipherBackend::Auto | CipherBackend::Software => Ok(CipherBackend::Software),
            CipherBackend::Native if Self::native_available() => Ok(CipherBackend::Native),
            CipherBackend::Native => Err(ProtocolError::ConfigError(
                "native cipher backend is not compiled in".to_string(),
            )),
        }
    }
}

/// Direction a cipher instance runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

enum Engine {
    #[cfg(feature = "native-cipher")]
    NativeEncrypt(Box<cfb8::Encryptor<Aes256>>),
    #[cfg(feature = "native-cipher")]
    NativeDecrypt(Box<cfb8::Decryptor<Aes256>>),
    Software {
        block: Box<Aes256>,
        register: [u8; IV_LEN],
    },
}

/// Stateful CFB-8 stream over AES-256
pub struct Cfb8 {
    direction: Direction,
    engine: Engine,
}

impl fmt::Debug for Cfb8 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cfb8")
            .field("direction", &self.direction)
            .field("backend", &self.backend())
            .finish_non_exhaustive()
    }
}

impl Drop for Cfb8 {
    fn drop(&mut self) {
        if let Engine::Software { register, .. } = &mut self.engine {
            register.zeroize();
        }
    }
}

impl Cfb8 {
    pub fn new(key: &[u8], iv: &[u8], direction: Direction, backend: CipherBackend) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(ProtocolError::SecurityError(
                constants::ERR_BAD_KEY_LENGTH.into(),
            ));
        }
        if iv.len() != IV_LEN {
            return Err(ProtocolError::SecurityError(
                constants::ERR_BAD_IV_LENGTH.into(),
            ));
        }
        let engine = match backend.resolve()? {
            #[cfg(feature = "native-cipher")]
            CipherBackend::Native => native_engine(key, iv, direction)?,
            _ => {
                let block = Aes256::new_from_slice(key).map_err(|_| {
                    ProtocolError::SecurityError(constants::ERR_BAD_KEY_LENGTH.into())
                })?;
                let mut register = [0u8; IV_LEN];
                register.copy_from_slice(iv);
                Engine::Software {
                    block: Box::new(block),
                    register,
                }
            }
        };
        Ok(Self { direction, engine })
    }

    pub fn encryptor(key: &[u8], iv: &[u8], backend: CipherBackend) -> Result<Self> {
        Self::new(key, iv, Direction::Encrypt, backend)
    }

    pub fn decryptor(key: &[u8], iv: &[u8], backend: CipherBackend) -> Result<Self> {
        Self::new(key, iv, Direction::Decrypt, backend)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The concrete backend in use.
    pub fn backend(&self) -> CipherBackend {
        match self.engine {
            #[cfg(feature = "native-cipher")]
            Engine::NativeEncrypt(_) | Engine::NativeDecrypt(_) => CipherBackend::Native,
            Engine::Software { .. } => CipherBackend::Software,
        }
    }

    /// Encrypt or decrypt `data` in place, continuing the keystream.
    pub fn apply(&mut self, data: &mut [u8]) {
        match &mut self.engine {
            #[cfg(feature = "native-cipher")]
            Engine::NativeEncrypt(enc) => {
                for byte in data.chunks_mut(1) {
                    enc.encrypt_block_mut(GenericArray::from_mut_slice(byte));
                }
            }
            #[cfg(feature = "native-cipher")]
            Engine::NativeDecrypt(dec) => {
                for byte in data.chunks_mut(1) {
                    dec.decrypt_block_mut(GenericArray::from_mut_slice(byte));
                }
            }
            Engine::Software { block, register } => {
                let encrypt = self.direction == Direction::Encrypt;
                let mut keystream = GenericArray::default();
                for byte in data.iter_mut() {
                    keystream.copy_from_slice(register.as_slice());
                    block.encrypt_block(&mut keystream);
                    let input = *byte;
                    let output = input ^ keystream[0];
                    *byte = output;
                    register.copy_within(1.., 0);
                    register[IV_LEN - 1] = if encrypt { output } else { input };
                }
                keystream.as_mut_slice().zeroize();
            }
        }
    }
}

#[cfg(feature = "native-cipher")]
fn native_engine(key: &[u8], iv: &[u8], direction: Direction) -> Result<Engine> {
    let bad_length = |_| ProtocolError::SecurityError(constants::ERR_BAD_KEY_LENGTH.into());
    Ok(match direction {
        Direction::Encrypt => Engine::NativeEncrypt(Box::new(
            cfb8::Encryptor::<Aes256>::new_from_slices(key, iv).map_err(bad_length)?,
        )),
        Direction::Decrypt => Engine::NativeDecrypt(Box::new(
            cfb8::Decryptor::<Aes256>::new_from_slices(key, iv).map_err(bad_length)?,
        )),
    })
}
