//! Filter pipeline — compression and encryption applied to repository objects.
//!
//! # Identity rules
//! A stored object's compression is identified by its file extension and by
//! nothing else.  The extension set is frozen: `.gz`, `.bz2`, `.lz4`, `.zst`,
//! or none.  A reader that meets an extension it cannot decode MUST fail
//! immediately — no negotiation, no fallback.
//!
//! # Encryption
//! AES-256-GCM, nonce prepended: `[ nonce (12 B) | ciphertext | GCM tag (16 B) ]`.
//! The key is derived from the repository cipher passphrase with Argon2id,
//! salted by the stanza name so the same passphrase yields distinct keys per
//! stanza.
//!
//! # Composition order
//! Writes: compress, then encrypt.  Reads: decrypt, then decompress.  Both
//! directions are buffer-wise; streaming callers frame the encoded bytes with
//! [`crate::chunked`] so the pipeline can be torn down at the substream end.

use std::io::{Read, Write};

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng};
use aes_gcm::Aes256Gcm;
use argon2::{Algorithm, Argon2, Params, Version};

use crate::error::{Error, Result};

/// Byte length of the AES-GCM nonce prepended to every encrypted payload.
pub const NONCE_LEN: usize = 12;

/// Default compression level passed to codecs that take one.
pub const DEFAULT_COMPRESS_LEVEL: i32 = 3;

// ── Compression registry ─────────────────────────────────────────────────────

/// Compression type of a repository object, carried in its file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compress {
    None,
    Gz,
    Bz2,
    Lz4,
    Zst,
}

impl Compress {
    /// The on-disk extension including the leading dot; empty for `None`.
    pub fn ext(self) -> &'static str {
        match self {
            Compress::None => "",
            Compress::Gz   => ".gz",
            Compress::Bz2  => ".bz2",
            Compress::Lz4  => ".lz4",
            Compress::Zst  => ".zst",
        }
    }

    /// Resolve a stored object name to its compression type by extension.
    pub fn from_name(name: &str) -> Self {
        if name.ends_with(".gz") {
            Compress::Gz
        } else if name.ends_with(".bz2") {
            Compress::Bz2
        } else if name.ends_with(".lz4") {
            Compress::Lz4
        } else if name.ends_with(".zst") {
            Compress::Zst
        } else {
            Compress::None
        }
    }

    /// Parse a CLI string.
    pub fn from_option(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(Compress::None),
            "gz"   => Some(Compress::Gz),
            "bz2"  => Some(Compress::Bz2),
            "lz4"  => Some(Compress::Lz4),
            "zst"  => Some(Compress::Zst),
            _      => None,
        }
    }

    /// Strip a recognised compression extension from an object name.
    pub fn strip<'a>(name: &'a str) -> &'a str {
        let c = Compress::from_name(name);
        &name[..name.len() - c.ext().len()]
    }

    pub fn compress(self, data: &[u8], level: i32) -> Result<Vec<u8>> {
        match self {
            Compress::None => Ok(data.to_vec()),
            Compress::Gz => {
                let lvl = flate2::Compression::new(level.clamp(0, 9) as u32);
                let mut enc = flate2::write::GzEncoder::new(Vec::new(), lvl);
                enc.write_all(data)?;
                Ok(enc.finish()?)
            }
            Compress::Bz2 => {
                let lvl = bzip2::Compression::new(level.clamp(1, 9) as u32);
                let mut enc = bzip2::write::BzEncoder::new(Vec::new(), lvl);
                enc.write_all(data)?;
                Ok(enc.finish()?)
            }
            Compress::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            Compress::Zst => zstd::encode_all(data, level).map_err(Error::Io),
        }
    }

    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compress::None => Ok(data.to_vec()),
            Compress::Gz => {
                let mut out = Vec::new();
                flate2::read::GzDecoder::new(data).read_to_end(&mut out)?;
                Ok(out)
            }
            Compress::Bz2 => {
                let mut out = Vec::new();
                bzip2::read::BzDecoder::new(data).read_to_end(&mut out)?;
                Ok(out)
            }
            Compress::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| Error::format(format!("lz4 payload: {e}"))),
            Compress::Zst => zstd::decode_all(data).map_err(Error::Io),
        }
    }
}

// ── Key derivation ───────────────────────────────────────────────────────────

/// Derive a 256-bit cipher key from the repository passphrase.
///
/// `salt` should be the stanza name bytes, giving each stanza a distinct key
/// even when the passphrase is shared.
pub fn derive_key(passphrase: &str, salt: &[u8]) -> Result<[u8; 32]> {
    let params = Params::new(64 * 1024, 3, 1, Some(32))
        .map_err(|e| Error::format(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; 32];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| Error::format(format!("key derivation: {e}")))?;
    Ok(key)
}

/// Encrypt `plaintext` with AES-256-GCM under a random nonce.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| Error::Crypto)?;
    let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
    let ciphertext = cipher.encrypt(&nonce, plaintext).map_err(|_| Error::Crypto)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt an AES-256-GCM payload produced by [`encrypt`].
pub fn decrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN {
        return Err(Error::Crypto);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| Error::Crypto)?;
    let nonce = aes_gcm::Nonce::from_slice(&data[..NONCE_LEN]);
    cipher.decrypt(nonce, &data[NONCE_LEN..]).map_err(|_| Error::Crypto)
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

/// Composed compression + optional cipher applied to one object.
#[derive(Debug, Clone)]
pub struct FilterPipeline {
    pub compress: Compress,
    pub level:    i32,
    pub key:      Option<[u8; 32]>,
}

impl FilterPipeline {
    pub fn new(compress: Compress) -> Self {
        Self { compress, level: DEFAULT_COMPRESS_LEVEL, key: None }
    }

    pub fn with_key(mut self, key: Option<[u8; 32]>) -> Self {
        self.key = key;
        self
    }

    /// Compress then encrypt.
    pub fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let compressed = self.compress.compress(plaintext, self.level)?;
        match &self.key {
            Some(k) => encrypt(k, &compressed),
            None    => Ok(compressed),
        }
    }

    /// Decrypt then decompress.
    pub fn decode(&self, stored: &[u8]) -> Result<Vec<u8>> {
        let compressed = match &self.key {
            Some(k) => decrypt(k, stored)?,
            None    => stored.to_vec(),
        };
        self.compress.decompress(&compressed)
    }
}
