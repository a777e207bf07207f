//! Cryptographic primitives for the discovery protocol.
//!
//! The four curve operations (hash, sign, verify, ECDH) go through the
//! [`CryptoBackend`] trait so callers can inject their own implementation.
//! Session key agreement, the identity proof and message encryption are
//! protocol-defined and built on top of the backend here.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes128Gcm, Nonce,
};
use hkdf::Hkdf;
use secp256k1::{ecdh, ecdsa::Signature, All, Message, PublicKey, Secp256k1, SecretKey};
use sha2::Sha256;
use sha3::{Digest, Keccak256};

use super::error::{CryptoError, DecodeError};
use super::identity::{NodeId, NodeIdentity};

/// Compressed secp256k1 public key.
pub type PublicKeyBytes = [u8; 33];
/// Raw secp256k1 secret scalar.
pub type SecretKeyBytes = [u8; 32];
/// Compact ECDSA signature (r || s).
pub type SignatureBytes = [u8; 64];
/// AES-128 session key.
pub type Key = [u8; 16];

/// Size of the AES-GCM authentication tag appended to every ciphertext.
pub const TAG_SIZE: usize = 16;

const KEY_AGREEMENT_STRING: &[u8] = b"discovery v5 key agreement";
const ID_SIGNATURE_TEXT: &[u8] = b"discovery v5 identity proof";

/// Curve operations used by records and sessions.
pub trait CryptoBackend: Send + Sync {
    fn generate_secret_key(&self) -> SecretKeyBytes;

    fn public_key(&self, secret_key: &SecretKeyBytes) -> Result<PublicKeyBytes, CryptoError>;

    /// keccak256
    fn hash(&self, data: &[u8]) -> [u8; 32];

    fn sign(
        &self,
        secret_key: &SecretKeyBytes,
        digest: &[u8; 32],
    ) -> Result<SignatureBytes, CryptoError>;

    fn verify(&self, public_key: &[u8], digest: &[u8; 32], signature: &[u8]) -> bool;

    /// Shared point of `public_key * secret_key`, compressed.
    fn ecdh(
        &self,
        public_key: &[u8],
        secret_key: &SecretKeyBytes,
    ) -> Result<PublicKeyBytes, CryptoError>;
}

/// Default backend on libsecp256k1.
pub struct Secp256k1Backend {
    secp: Secp256k1<All>,
}

impl Secp256k1Backend {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }
}

impl Default for Secp256k1Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoBackend for Secp256k1Backend {
    fn generate_secret_key(&self) -> SecretKeyBytes {
        SecretKey::new(&mut rand::thread_rng()).secret_bytes()
    }

    fn public_key(&self, secret_key: &SecretKeyBytes) -> Result<PublicKeyBytes, CryptoError> {
        let secret = SecretKey::from_slice(secret_key).map_err(|_| CryptoError::InvalidSecretKey)?;
        Ok(PublicKey::from_secret_key(&self.secp, &secret).serialize())
    }

    fn hash(&self, data: &[u8]) -> [u8; 32] {
        Keccak256::digest(data).into()
    }

    fn sign(
        &self,
        secret_key: &SecretKeyBytes,
        digest: &[u8; 32],
    ) -> Result<SignatureBytes, CryptoError> {
        let secret = SecretKey::from_slice(secret_key).map_err(|_| CryptoError::InvalidSecretKey)?;
        let message = Message::from_digest(*digest);
        Ok(self.secp.sign_ecdsa(&message, &secret).serialize_compact())
    }

    fn verify(&self, public_key: &[u8], digest: &[u8; 32], signature: &[u8]) -> bool {
        let Ok(public_key) = PublicKey::from_slice(public_key) else {
            return false;
        };
        let Ok(signature) = Signature::from_compact(signature) else {
            return false;
        };
        let message = Message::from_digest(*digest);
        self.secp
            .verify_ecdsa(&message, &signature, &public_key)
            .is_ok()
    }

    fn ecdh(
        &self,
        public_key: &[u8],
        secret_key: &SecretKeyBytes,
    ) -> Result<PublicKeyBytes, CryptoError> {
        let public_key = PublicKey::from_slice(public_key).map_err(|_| CryptoError::InvalidPublicKey)?;
        let secret = SecretKey::from_slice(secret_key).map_err(|_| CryptoError::InvalidSecretKey)?;
        let point = ecdh::shared_secret_point(&public_key, &secret);

        // 0x02 / 0x03 prefix carries the parity of y
        let mut compressed = [0u8; 33];
        compressed[0] = 0x02 | (point[63] & 0x01);
        compressed[1..].copy_from_slice(&point[..32]);
        Ok(compressed)
    }
}

/// Directional keys of an established session.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub encryption_key: Key,
    pub decryption_key: Key,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

/// HKDF-SHA256 over the ECDH secret, salted with the challenge data.
///
/// Returns `(initiator_key, recipient_key)`.
fn derive_key(
    secret: &[u8],
    initiator_id: &NodeId,
    recipient_id: &NodeId,
    challenge_data: &[u8],
) -> Result<(Key, Key), CryptoError> {
    let mut info = Vec::with_capacity(KEY_AGREEMENT_STRING.len() + 64);
    info.extend_from_slice(KEY_AGREEMENT_STRING);
    info.extend_from_slice(initiator_id.as_bytes());
    info.extend_from_slice(recipient_id.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(challenge_data), secret);
    let mut okm = [0u8; 32];
    hk.expand(&info, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation)?;

    let mut initiator_key = [0u8; 16];
    let mut recipient_key = [0u8; 16];
    initiator_key.copy_from_slice(&okm[..16]);
    recipient_key.copy_from_slice(&okm[16..]);
    Ok((initiator_key, recipient_key))
}

/// Initiator side: fresh ephemeral key against the remote static key.
///
/// Returns the initiator's session keys and the ephemeral public key that
/// goes into the handshake authdata.
pub fn generate_session_keys(
    backend: &dyn CryptoBackend,
    local_id: &NodeId,
    remote_id: &NodeId,
    remote_public_key: &[u8],
    challenge_data: &[u8],
) -> Result<(SessionKeys, PublicKeyBytes), CryptoError> {
    let ephemeral_secret = backend.generate_secret_key();
    let ephemeral_public = backend.public_key(&ephemeral_secret)?;
    let secret = backend.ecdh(remote_public_key, &ephemeral_secret)?;

    let (initiator_key, recipient_key) = derive_key(&secret, local_id, remote_id, challenge_data)?;
    let keys = SessionKeys {
        encryption_key: initiator_key,
        decryption_key: recipient_key,
    };
    Ok((keys, ephemeral_public))
}

/// Recipient side: static key against the initiator's ephemeral key.
pub fn derive_keys_from_ephemeral(
    identity: &NodeIdentity,
    remote_id: &NodeId,
    ephemeral_public_key: &[u8],
    challenge_data: &[u8],
) -> Result<SessionKeys, CryptoError> {
    let secret = identity
        .backend()
        .ecdh(ephemeral_public_key, identity.secret_key())?;

    let (initiator_key, recipient_key) =
        derive_key(&secret, remote_id, identity.node_id(), challenge_data)?;
    Ok(SessionKeys {
        encryption_key: recipient_key,
        decryption_key: initiator_key,
    })
}

fn id_signature_digest(
    challenge_data: &[u8],
    ephemeral_public_key: &[u8],
    dest_id: &NodeId,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(ID_SIGNATURE_TEXT);
    hasher.update(challenge_data);
    hasher.update(ephemeral_public_key);
    hasher.update(dest_id.as_bytes());
    hasher.finalize().into()
}

/// Identity proof sent in the handshake authdata.
pub fn sign_id_nonce(
    identity: &NodeIdentity,
    challenge_data: &[u8],
    ephemeral_public_key: &[u8],
    dest_id: &NodeId,
) -> Result<SignatureBytes, CryptoError> {
    identity.sign(&id_signature_digest(
        challenge_data,
        ephemeral_public_key,
        dest_id,
    ))
}

/// Checks a handshake identity proof; `dest_id` is our own id.
pub fn verify_id_nonce(
    backend: &dyn CryptoBackend,
    remote_public_key: &[u8],
    challenge_data: &[u8],
    ephemeral_public_key: &[u8],
    dest_id: &NodeId,
    signature: &[u8],
) -> bool {
    let digest = id_signature_digest(challenge_data, ephemeral_public_key, dest_id);
    backend.verify(remote_public_key, &digest, signature)
}

/// AES-128-GCM seal.
pub fn encrypt_message(
    key: &Key,
    nonce: &[u8; 12],
    msg: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes128Gcm::new(key.into());
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg, aad })
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// AES-128-GCM open. Fails closed on short input or a bad tag.
pub fn decrypt_message(
    key: &Key,
    nonce: &[u8; 12],
    msg: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, DecodeError> {
    if msg.len() < TAG_SIZE {
        return Err(DecodeError::CiphertextTooShort(msg.len()));
    }

    let cipher = Aes128Gcm::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg, aad })
        .map_err(|_| DecodeError::DecryptionFailed)
}
