//! Cryptographic primitives for a SwiftDrop transfer session.
//!
//! Ephemeral ECDH over P-256, HKDF-SHA256 session-key derivation, a
//! 6-digit pairing confirmation code, and per-chunk AES-256-GCM AEAD.
//! Nothing here persists; callers own the lifetime of every key.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Info label HKDF uses to derive the session AEAD key. Fixed by the protocol;
/// both peers must use this exact byte string.
pub const SESSION_KEY_INFO: &[u8] = b"SwiftDrop-v1-session-key";

pub const SHARED_SECRET_LEN: usize = 32;
pub const SESSION_KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const PAIRING_CODE_DIGITS: usize = 6;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("remote public key is not a valid uncompressed P-256 point")]
    InvalidPoint,
    #[error("HKDF expand failed")]
    KeyDerivation,
    #[error("AEAD authentication failed")]
    AuthFailure,
}

/// An ephemeral ECDH(P-256) keypair. The private half cannot be extracted or
/// reused for a second `diffie_hellman` call with a different peer.
pub struct KeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh ephemeral P-256 keypair.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The 65-byte uncompressed SEC1 encoding (leading `0x04`) of the public key.
    pub fn public_bytes(&self) -> [u8; 65] {
        let point = self.public.to_encoded_point(false);
        let bytes = point.as_bytes();
        let mut out = [0u8; 65];
        out.copy_from_slice(bytes);
        out
    }

    /// Derive the 32-byte X-coordinate shared secret with a peer's public key.
    pub fn shared_secret(&self, remote_pub: &[u8]) -> Result<[u8; SHARED_SECRET_LEN], CryptoError> {
        let peer = PublicKey::from_sec1_bytes(remote_pub).map_err(|_| CryptoError::InvalidPoint)?;
        let shared = self.secret.diffie_hellman(&peer);
        let mut out = [0u8; SHARED_SECRET_LEN];
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Ok(out)
    }
}

/// Alias kept for call sites that prefer a free function over a method.
pub fn generate_keypair() -> KeyPair {
    KeyPair::generate()
}

pub fn compute_shared_secret(
    keypair: &KeyPair,
    remote_pub: &[u8],
) -> Result<[u8; SHARED_SECRET_LEN], CryptoError> {
    keypair.shared_secret(remote_pub)
}

/// HKDF-SHA256 with empty salt and the fixed `SESSION_KEY_INFO` label.
pub fn derive_session_key(secret: &[u8]) -> Result<[u8; SESSION_KEY_LEN], CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, secret);
    let mut okm = [0u8; SESSION_KEY_LEN];
    hk.expand(SESSION_KEY_INFO, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(okm)
}

/// SHA-256(secret), used as the pairing-hash exchanged in HANDSHAKE_CONFIRM.
pub fn pairing_hash(secret: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Constant-time comparison of two pairing hashes, as the receiver must use.
pub fn pairing_hash_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.ct_eq(b).into()
}

/// Six decimal digits derived from the first 4 bytes of SHA-256(secret),
/// interpreted big-endian and reduced modulo 1,000,000.
pub fn derive_pairing_code(secret: &[u8]) -> String {
    let digest = pairing_hash(secret);
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    format!("{:0width$}", n % 1_000_000, width = PAIRING_CODE_DIGITS)
}

/// Session key material: the AEAD key plus the shared-secret digest used for
/// the pairing code. Scoped to one transfer; zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub aead_key: [u8; SESSION_KEY_LEN],
    pub secret_digest: [u8; 32],
}

impl SessionKeys {
    pub fn derive(shared_secret: &[u8]) -> Result<Self, CryptoError> {
        let aead_key = derive_session_key(shared_secret)?;
        let secret_digest = pairing_hash(shared_secret);
        Ok(Self {
            aead_key,
            secret_digest,
        })
    }

    pub fn pairing_code(&self) -> String {
        let n = u32::from_be_bytes([
            self.secret_digest[0],
            self.secret_digest[1],
            self.secret_digest[2],
            self.secret_digest[3],
        ]);
        format!("{:0width$}", n % 1_000_000, width = PAIRING_CODE_DIGITS)
    }
}

pub struct EncryptedChunk {
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

/// Encrypt one chunk under AES-256-GCM with a fresh random 12-byte IV.
/// The `(key, iv)` pair produced here must never be reused for another chunk.
pub fn encrypt_chunk(
    key: &[u8; SESSION_KEY_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<EncryptedChunk, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::KeyDerivation)?;
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv);

    let mut sealed = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AuthFailure)?;

    let tag_offset = sealed.len() - TAG_LEN;
    let tag_bytes = sealed.split_off(tag_offset);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&tag_bytes);

    Ok(EncryptedChunk {
        iv,
        ciphertext: sealed,
        tag,
    })
}

/// Decrypt one chunk. Fails with `AuthFailure` on any tampering: wrong key,
/// flipped ciphertext/tag bit, or mismatched `aad`.
pub fn decrypt_chunk(
    key: &[u8; SESSION_KEY_LEN],
    iv: &[u8; IV_LEN],
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::KeyDerivation)?;
    let nonce = Nonce::from_slice(iv);

    let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);

    cipher
        .decrypt(nonce, Payload { msg: &sealed, aad })
        .map_err(|_| CryptoError::AuthFailure)
}
