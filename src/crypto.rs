//! Key unwrap and payload decryption for the partner export format.
//!
//! The partner encrypts each export with the usual command-line tooling:
//!
//! - a random passphrase file is encrypted to our RSA public key with
//!   PKCS#1 v1.5 padding (`*.key.encrypted`, raw ciphertext);
//! - the CSV is encrypted with AES-256-CBC under a key and IV derived from
//!   the first line of that passphrase file ([`SymmetricKey::passphrase`])
//!   with PBKDF2-HMAC-SHA256
//!   (10 000 iterations, 8-byte salt), then base64-armoured as
//!   `"Salted__" || salt || ciphertext` (`*.encrypted`).
//!
//! Both directions are implemented so tests and the export tool can produce
//! files in the same format. Key material lives in [`Zeroizing`] buffers and
//! is wiped when dropped.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use aes::Aes256;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use zeroize::Zeroizing;

pub const SALT_MAGIC: &[u8; 8] = b"Salted__";
pub const SALT_SIZE: usize = 8;
pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;
pub const PBKDF2_ITERATIONS: u32 = 10_000;
/// Bytes of randomness behind a generated passphrase (base64 encoded).
pub const PASSPHRASE_ENTROPY: usize = 32;

const BLOCK_SIZE: usize = 16;
const ENVELOPE_LINE_WIDTH: usize = 64;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

#[derive(Debug)]
pub enum CryptoError {
    /// The private key environment variable is unset or empty.
    MissingPrivateKey(String),
    InvalidPrivateKey(String),
    InvalidPublicKey(String),
    /// RSA decryption failed: wrong key or corrupt wrapped key.
    Unwrap,
    Wrap(String),
    Envelope(&'static str),
    Base64(base64::DecodeError),
    EmptyPassphrase,
    /// Padding check failed after AES-CBC decryption: wrong key or corrupt payload.
    BadDecrypt,
    NotUtf8,
    Io(std::io::Error),
}

impl CryptoError {
    /// Whether the failure comes from missing or unusable key configuration
    /// rather than from the data being decrypted.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CryptoError::MissingPrivateKey(_)
                | CryptoError::InvalidPrivateKey(_)
                | CryptoError::InvalidPublicKey(_)
        )
    }
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::MissingPrivateKey(var) => {
                write!(f, "private key variable {var} is not set")
            }
            CryptoError::InvalidPrivateKey(msg) => write!(f, "invalid private key: {msg}"),
            CryptoError::InvalidPublicKey(msg) => write!(f, "invalid public key: {msg}"),
            CryptoError::Unwrap => write!(f, "could not unwrap the symmetric key"),
            CryptoError::Wrap(msg) => write!(f, "could not wrap the symmetric key: {msg}"),
            CryptoError::Envelope(msg) => write!(f, "malformed payload envelope: {msg}"),
            CryptoError::Base64(e) => write!(f, "payload envelope is not base64: {e}"),
            CryptoError::EmptyPassphrase => write!(f, "unwrapped key holds an empty passphrase"),
            CryptoError::BadDecrypt => write!(f, "bad decrypt (wrong key or corrupt payload)"),
            CryptoError::NotUtf8 => write!(f, "decrypted payload is not UTF-8 text"),
            CryptoError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for CryptoError {}

impl From<base64::DecodeError> for CryptoError {
    fn from(error: base64::DecodeError) -> Self {
        CryptoError::Base64(error)
    }
}

impl From<std::io::Error> for CryptoError {
    fn from(error: std::io::Error) -> Self {
        CryptoError::Io(error)
    }
}

/// Where the recipient private key comes from.
///
/// The key is only materialized by [`PrivateKeySource::load`], for the
/// length of one unwrap call.
#[derive(Clone)]
pub enum PrivateKeySource {
    /// Name of an environment variable holding the base64-encoded PEM.
    Env(String),
    /// Base64-encoded PEM held in memory (tests, embedding callers).
    Inline(Zeroizing<String>),
}

impl fmt::Debug for PrivateKeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrivateKeySource::Env(var) => f.debug_tuple("Env").field(var).finish(),
            PrivateKeySource::Inline(_) => f.write_str("Inline(<redacted>)"),
        }
    }
}

impl PrivateKeySource {
    pub fn inline(base64_pem: impl Into<String>) -> Self {
        PrivateKeySource::Inline(Zeroizing::new(base64_pem.into()))
    }

    /// Decode the base64 PEM. The result is wiped on drop.
    pub fn load(&self) -> Result<PrivateKeyPem, CryptoError> {
        let encoded = match self {
            PrivateKeySource::Env(var) => match std::env::var(var) {
                Ok(value) if !value.trim().is_empty() => Zeroizing::new(value),
                _ => return Err(CryptoError::MissingPrivateKey(var.clone())),
            },
            PrivateKeySource::Inline(value) => {
                if value.trim().is_empty() {
                    return Err(CryptoError::MissingPrivateKey("<inline>".to_string()));
                }
                value.clone()
            }
        };
        let compact: Zeroizing<Vec<u8>> = Zeroizing::new(
            encoded
                .bytes()
                .filter(|b| !b.is_ascii_whitespace())
                .collect(),
        );
        let decoded = Zeroizing::new(STANDARD.decode(compact.as_slice()).map_err(|e| {
            CryptoError::InvalidPrivateKey(format!("not base64: {e}"))
        })?);
        let pem = std::str::from_utf8(&decoded)
            .map_err(|_| CryptoError::InvalidPrivateKey("decoded PEM is not text".to_string()))?;
        Ok(PrivateKeyPem(Zeroizing::new(pem.to_string())))
    }

    /// Load and immediately drop the key, so a missing or undecodable
    /// variable fails before any network activity.
    pub fn preflight(&self) -> Result<(), CryptoError> {
        let pem = self.load()?;
        pem.parse().map(|_| ())
    }
}

/// Decoded private key PEM text.
pub struct PrivateKeyPem(Zeroizing<String>);

impl PrivateKeyPem {
    pub fn from_pem(pem: impl Into<String>) -> Self {
        PrivateKeyPem(Zeroizing::new(pem.into()))
    }

    /// Accepts PKCS#8 (`BEGIN PRIVATE KEY`) and PKCS#1 (`BEGIN RSA PRIVATE KEY`).
    fn parse(&self) -> Result<RsaPrivateKey, CryptoError> {
        RsaPrivateKey::from_pkcs8_pem(&self.0)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&self.0))
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))
    }
}

impl fmt::Debug for PrivateKeyPem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKeyPem(<redacted>)")
    }
}

/// Raw bytes recovered by [`unwrap_key`]: a one-line passphrase file.
pub struct SymmetricKey(Zeroizing<Vec<u8>>);

impl SymmetricKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        SymmetricKey(Zeroizing::new(bytes))
    }

    /// Fresh random passphrase file: base64 of 32 random bytes plus a newline.
    pub fn generate() -> Self {
        let mut raw = Zeroizing::new([0u8; PASSPHRASE_ENTROPY]);
        OsRng.fill_bytes(&mut raw[..]);
        let mut line = STANDARD.encode(raw.as_slice()).into_bytes();
        line.push(b'\n');
        SymmetricKey(Zeroizing::new(line))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The bytes `openssl enc -pass file:` feeds to the key derivation: the
    /// first line up to `\n`, then cut at the first NUL. A `\r` before the
    /// newline is kept.
    pub fn passphrase(&self) -> &[u8] {
        let bytes = self.0.as_slice();
        let line = match bytes.iter().position(|&b| b == b'\n') {
            Some(end) => &bytes[..end],
            None => bytes,
        };
        match line.iter().position(|&b| b == 0) {
            Some(end) => &line[..end],
            None => line,
        }
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymmetricKey(<{} bytes redacted>)", self.0.len())
    }
}

/// Derive `key || iv` from a passphrase and salt.
pub fn derive_key_iv(passphrase: &[u8], salt: &[u8; SALT_SIZE]) -> Zeroizing<[u8; KEY_SIZE + IV_SIZE]> {
    let mut out = Zeroizing::new([0u8; KEY_SIZE + IV_SIZE]);
    pbkdf2_hmac::<Sha256>(passphrase, salt, PBKDF2_ITERATIONS, &mut out[..]);
    out
}

/// Encrypt `plaintext` into the base64 text envelope.
///
/// A random salt is drawn unless one is given.
pub fn encrypt_payload(
    plaintext: &[u8],
    passphrase: &[u8],
    salt: Option<[u8; SALT_SIZE]>,
) -> Result<String, CryptoError> {
    if passphrase.is_empty() {
        return Err(CryptoError::EmptyPassphrase);
    }
    let salt = salt.unwrap_or_else(|| {
        let mut generated = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut generated);
        generated
    });

    let derived = derive_key_iv(passphrase, &salt);
    let (key, iv) = derived.split_at(KEY_SIZE);
    let cipher = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|_| CryptoError::Envelope("derived key has the wrong length"))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut raw = Vec::with_capacity(SALT_MAGIC.len() + SALT_SIZE + ciphertext.len());
    raw.extend_from_slice(SALT_MAGIC);
    raw.extend_from_slice(&salt);
    raw.extend_from_slice(&ciphertext);

    let encoded = STANDARD.encode(raw);
    let mut armoured = String::with_capacity(encoded.len() + encoded.len() / ENVELOPE_LINE_WIDTH + 1);
    for chunk in encoded.as_bytes().chunks(ENVELOPE_LINE_WIDTH) {
        // base64 output is ASCII, so every chunk boundary is a char boundary.
        armoured.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        armoured.push('\n');
    }
    Ok(armoured)
}

/// Decrypt a base64 text envelope. Whitespace and line breaks are ignored.
pub fn decrypt_payload(envelope: &[u8], passphrase: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if passphrase.is_empty() {
        return Err(CryptoError::EmptyPassphrase);
    }
    let compact: Vec<u8> = envelope
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    let raw = STANDARD.decode(compact)?;

    let header_len = SALT_MAGIC.len() + SALT_SIZE;
    if raw.len() < header_len || &raw[..SALT_MAGIC.len()] != SALT_MAGIC {
        return Err(CryptoError::Envelope("missing salt header"));
    }
    let mut salt = [0u8; SALT_SIZE];
    salt.copy_from_slice(&raw[SALT_MAGIC.len()..header_len]);
    let ciphertext = &raw[header_len..];
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::Envelope("ciphertext is not a whole number of blocks"));
    }

    let derived = derive_key_iv(passphrase, &salt);
    let (key, iv) = derived.split_at(KEY_SIZE);
    let cipher = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|_| CryptoError::Envelope("derived key has the wrong length"))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::BadDecrypt)
}

/// Encrypt `key` to the recipient's public key (SPKI PEM), PKCS#1 v1.5.
pub fn wrap_key(public_key_pem: &str, key: &SymmetricKey) -> Result<Vec<u8>, CryptoError> {
    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    public_key
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, key.as_bytes())
        .map_err(|e| CryptoError::Wrap(e.to_string()))
}

/// Recover the symmetric key from a wrapped key file.
///
/// The file normally holds raw RSA ciphertext. A base64 armoured copy is
/// accepted when it decodes to exactly one modulus-sized block.
pub fn unwrap_key(private_key: &PrivateKeyPem, wrapped: &[u8]) -> Result<SymmetricKey, CryptoError> {
    let rsa_key = private_key.parse()?;
    let modulus_len = rsa_key.size();

    let ciphertext = if wrapped.len() == modulus_len {
        wrapped.to_vec()
    } else {
        let compact: Vec<u8> = wrapped
            .iter()
            .copied()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        match STANDARD.decode(compact) {
            Ok(decoded) if decoded.len() == modulus_len => decoded,
            _ => return Err(CryptoError::Unwrap),
        }
    };

    let plaintext = rsa_key
        .decrypt(Pkcs1v15Encrypt, &ciphertext)
        .map_err(|_| CryptoError::Unwrap)?;
    Ok(SymmetricKey::from_bytes(plaintext))
}

/// The two primitives the pipeline needs, behind a seam so another
/// implementation can be swapped in as long as it matches the format.
pub trait CryptoProvider {
    /// Load the private key from `source`, unwrap, and drop the key again.
    fn unwrap(
        &self,
        source: &PrivateKeySource,
        encrypted_key: &[u8],
    ) -> Result<SymmetricKey, CryptoError>;

    /// Decrypt the payload file at `encrypted_payload` into `plaintext_out`.
    ///
    /// Nothing is written unless decryption and the UTF-8 check succeed.
    fn decrypt(
        &self,
        encrypted_payload: &Path,
        key: &SymmetricKey,
        plaintext_out: &Path,
    ) -> Result<PathBuf, CryptoError>;
}

/// Pure-Rust provider (RustCrypto `rsa`, `aes`, `cbc`, `pbkdf2`).
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeCrypto;

impl CryptoProvider for NativeCrypto {
    fn unwrap(
        &self,
        source: &PrivateKeySource,
        encrypted_key: &[u8],
    ) -> Result<SymmetricKey, CryptoError> {
        let pem = source.load()?;
        unwrap_key(&pem, encrypted_key)
    }

    fn decrypt(
        &self,
        encrypted_payload: &Path,
        key: &SymmetricKey,
        plaintext_out: &Path,
    ) -> Result<PathBuf, CryptoError> {
        let envelope = fs::read(encrypted_payload)?;
        let plaintext = decrypt_payload(&envelope, key.passphrase())?;
        let text = String::from_utf8(plaintext).map_err(|_| CryptoError::NotUtf8)?;
        fs::write(plaintext_out, text)?;
        Ok(plaintext_out.to_path_buf())
    }
}
