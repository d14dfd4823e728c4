//! Symmetric encryption of the credential file.
//!
//! Uses AES-256-CBC with PKCS#7 padding and a raw key/IV (no salt header), so
//! the ciphertext is byte-compatible with
//! `openssl aes-256-cbc -K <hex key> -iv <hex iv> -in <file> -out <file.enc>`.
//! CI decrypts with the same `openssl` invocation plus `-d`, reading the key
//! and IV from environment variables named `<prefix>_key` and `<prefix>_iv`
//! where the prefix comes from [`env_prefix`].

use std::path::Path;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::util::slash_path;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Key length in bytes (256 bits for AES-256)
pub const KEY_LENGTH: usize = 32;

/// IV length in bytes (one AES block)
pub const IV_LENGTH: usize = 16;

/// Hash bytes kept in the env-var prefix (12 hex chars).
const PREFIX_HASH_BYTES: usize = 6;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("Invalid {what}: expected {expected} hex characters")]
    InvalidHex { what: &'static str, expected: usize },

    #[error("Environment variable {0} is not set")]
    MissingEnv(String),

    #[error("Decryption failed: invalid key or corrupted data")]
    Decrypt,

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Key and IV for one encrypted file.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub key: [u8; KEY_LENGTH],
    pub iv: [u8; IV_LENGTH],
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key", &"<redacted>")
            .field("iv", &"<redacted>")
            .finish()
    }
}

impl KeyMaterial {
    /// Generate a new random key and IV.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        let mut iv = [0u8; IV_LENGTH];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut iv);
        Self { key, iv }
    }

    pub fn from_hex(key_hex: &str, iv_hex: &str) -> Result<Self, CipherError> {
        Ok(Self {
            key: decode_fixed(key_hex, "key")?,
            iv: decode_fixed(iv_hex, "iv")?,
        })
    }

    /// Read `<prefix>_key` and `<prefix>_iv` from the environment.
    pub fn from_env(prefix: &str) -> Result<Self, CipherError> {
        let key_var = key_var_name(prefix);
        let iv_var = iv_var_name(prefix);
        let key = std::env::var(&key_var).map_err(|_| CipherError::MissingEnv(key_var))?;
        let iv = std::env::var(&iv_var).map_err(|_| CipherError::MissingEnv(iv_var))?;
        Self::from_hex(&key, &iv)
    }

    pub fn key_hex(&self) -> String {
        hex::encode(self.key)
    }

    pub fn iv_hex(&self) -> String {
        hex::encode(self.iv)
    }
}

fn decode_fixed<const N: usize>(
    value: &str,
    what: &'static str,
) -> Result<[u8; N], CipherError> {
    let invalid = || CipherError::InvalidHex {
        what,
        expected: N * 2,
    };
    let bytes = hex::decode(value.trim()).map_err(|_| invalid())?;
    bytes.try_into().map_err(|_| invalid())
}

/// Env-var prefix for an encrypted file: `encrypted_` plus the first six
/// bytes of SHA-256 over the project-relative input path.
pub fn env_prefix(input_path: &Path) -> String {
    let digest = Sha256::digest(slash_path(input_path).as_bytes());
    format!("encrypted_{}", hex::encode(&digest[..PREFIX_HASH_BYTES]))
}

pub fn key_var_name(prefix: &str) -> String {
    format!("{}_key", prefix)
}

pub fn iv_var_name(prefix: &str) -> String {
    format!("{}_iv", prefix)
}

pub fn encrypt(keys: &KeyMaterial, plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(&keys.key.into(), &keys.iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

pub fn decrypt(keys: &KeyMaterial, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
    Aes256CbcDec::new(&keys.key.into(), &keys.iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CipherError::Decrypt)
}

/// Encrypt the file at `input` into `output`.
pub async fn encrypt_file(
    keys: &KeyMaterial,
    input: &Path,
    output: &Path,
) -> Result<(), CipherError> {
    let plaintext = read(input).await?;
    write(output, &encrypt(keys, &plaintext)).await?;
    tracing::info!("Encrypted {} -> {}", input.display(), output.display());
    Ok(())
}

/// Decrypt the file at `input` into `output`.
pub async fn decrypt_file(
    keys: &KeyMaterial,
    input: &Path,
    output: &Path,
) -> Result<(), CipherError> {
    let ciphertext = read(input).await?;
    let plaintext = decrypt(keys, &ciphertext)?;
    write(output, &plaintext).await?;
    tracing::info!("Decrypted {} -> {}", input.display(), output.display());
    Ok(())
}

async fn read(path: &Path) -> Result<Vec<u8>, CipherError> {
    tokio::fs::read(path).await.map_err(|source| CipherError::Io {
        path: path.display().to_string(),
        source,
    })
}

async fn write(path: &Path, data: &[u8]) -> Result<(), CipherError> {
    let io = |source| CipherError::Io {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io)?;
    }
    tokio::fs::write(path, data).await.map_err(io)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keys() -> KeyMaterial {
        let mut key = [0u8; KEY_LENGTH];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        KeyMaterial { key, iv: [7u8; IV_LENGTH] }
    }

    #[test]
    fn roundtrip_is_byte_identical() {
        let keys = test_keys();
        let plaintext = br#"{"access_token":"ya29.a0Af","refresh_token":"1//0g"}"#;
        let ciphertext = encrypt(&keys, plaintext);
        assert_ne!(&ciphertext[..], &plaintext[..]);
        assert_eq!(ciphertext.len() % 16, 0);
        assert_eq!(decrypt(&keys, &ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn block_aligned_input_gets_a_full_padding_block() {
        let keys = test_keys();
        assert_eq!(encrypt(&keys, &[0u8; 32]).len(), 48);
        assert_eq!(encrypt(&keys, b"").len(), 16);
    }

    #[test]
    fn matches_nist_sp800_38a_first_block() {
        // F.2.5 CBC-AES256.Encrypt, block #1.
        let keys = KeyMaterial::from_hex(
            "603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4",
            "000102030405060708090a0b0c0d0e0f",
        )
        .unwrap();
        let block = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
        let ciphertext = encrypt(&keys, &block);
        assert_eq!(hex::encode(&ciphertext[..16]), "f58c4c04d6e5f1ba779eabfb5f7bfbd6");
    }

    #[test]
    fn wrong_key_fails_or_differs() {
        let keys = test_keys();
        let mut other = test_keys();
        other.key[0] = 255;

        let ciphertext = encrypt(&keys, b"secret token contents");
        match decrypt(&other, &ciphertext) {
            Err(CipherError::Decrypt) => {}
            Ok(bytes) => assert_ne!(bytes, b"secret token contents"),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let keys = test_keys();
        let ciphertext = encrypt(&keys, b"secret");
        assert!(matches!(
            decrypt(&keys, &ciphertext[..10]),
            Err(CipherError::Decrypt)
        ));
    }

    #[test]
    fn hex_roundtrip_and_validation() {
        let keys = KeyMaterial::generate();
        let parsed = KeyMaterial::from_hex(&keys.key_hex(), &keys.iv_hex()).unwrap();
        assert_eq!(parsed, keys);

        assert!(matches!(
            KeyMaterial::from_hex("abcd", &keys.iv_hex()),
            Err(CipherError::InvalidHex { what: "key", expected: 64 })
        ));
        assert!(matches!(
            KeyMaterial::from_hex(&keys.key_hex(), "zz"),
            Err(CipherError::InvalidHex { what: "iv", expected: 32 })
        ));
    }

    #[test]
    fn debug_output_redacts_material() {
        let rendered = format!("{:?}", test_keys());
        assert!(rendered.contains("redacted"));
        assert!(!rendered.contains("000102"));
    }

    #[test]
    fn env_prefix_is_stable_and_path_specific() {
        let a = env_prefix(Path::new("tests/testthat/token.json"));
        let b = env_prefix(Path::new("./tests/testthat/token.json"));
        let c = env_prefix(Path::new("tests/testthat/other.json"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("encrypted_"));
        assert_eq!(a.len(), "encrypted_".len() + 12);
        assert_eq!(key_var_name(&a), format!("{a}_key"));
        assert_eq!(iv_var_name(&a), format!("{a}_iv"));
    }

    #[test]
    fn from_env_reads_prefixed_variables() {
        let keys = test_keys();
        let prefix = "encrypted_cipher_unit_test";
        std::env::set_var(key_var_name(prefix), keys.key_hex());
        std::env::set_var(iv_var_name(prefix), keys.iv_hex());
        assert_eq!(KeyMaterial::from_env(prefix).unwrap(), keys);

        assert!(matches!(
            KeyMaterial::from_env("encrypted_never_set"),
            Err(CipherError::MissingEnv(name)) if name == "encrypted_never_set_key"
        ));
    }

    #[tokio::test]
    async fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("token.json");
        let enc = dir.path().join("token.json.enc");
        let restored = dir.path().join("restored/token.json");
        std::fs::write(&plain, b"{\"access_token\":\"abc\"}\n").unwrap();

        let keys = KeyMaterial::generate();
        encrypt_file(&keys, &plain, &enc).await.unwrap();
        decrypt_file(&keys, &enc, &restored).await.unwrap();

        assert_eq!(std::fs::read(&plain).unwrap(), std::fs::read(&restored).unwrap());
    }
}
