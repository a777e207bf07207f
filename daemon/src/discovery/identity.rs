//! Node identity for the discovery protocol.
//!
//! Each node in the discovery network has a unique identity consisting of:
//! - A secp256k1 key pair used for record signatures and handshake proofs
//! - A node ID derived from the compressed public key (keccak256 hash)

use std::cmp::Ordering;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use rand::RngCore;
use sha3::{Digest, Keccak256};

use super::crypto::{CryptoBackend, PublicKeyBytes, SecretKeyBytes, SignatureBytes};
use super::error::CryptoError;

/// Node ID is a 32-byte hash of the node's public key.
///
/// The node ID is used for:
/// - Kademlia distance calculations in the routing table
/// - Masking packet headers addressed to the node
/// - Identifying the sender inside packet authdata
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 32]);

impl NodeId {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Identity scheme "v4": keccak256 over the compressed public key.
    pub fn from_public_key(public_key: &PublicKeyBytes) -> Self {
        Self(Keccak256::digest(public_key).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // first 8 bytes are enough to tell nodes apart in logs
        write!(f, "NodeId({}..)", hex::encode(&self.0[..8]))
    }
}

/// A peer as seen on the wire: its id together with the socket it talks from.
///
/// Sessions are keyed by this pair, so the same node reached through two
/// different sockets gets two independent sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    pub node_id: NodeId,
    pub socket_addr: SocketAddr,
}

impl NodeAddress {
    pub fn new(node_id: NodeId, socket_addr: SocketAddr) -> Self {
        Self {
            node_id,
            socket_addr,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_id, self.socket_addr)
    }
}

/// Node identity containing the key pair and derived node ID.
pub struct NodeIdentity {
    backend: Arc<dyn CryptoBackend>,
    secret_key: SecretKeyBytes,
    public_key: PublicKeyBytes,
    node_id: NodeId,
}

impl NodeIdentity {
    /// Generate a new random node identity.
    pub fn generate(backend: Arc<dyn CryptoBackend>) -> Result<Self, CryptoError> {
        let secret_key = backend.generate_secret_key();
        Self::from_secret_bytes(backend, secret_key)
    }

    /// Create a node identity from raw secret key bytes (32 bytes).
    ///
    /// Fails if the bytes are not a valid secp256k1 scalar.
    pub fn from_secret_bytes(
        backend: Arc<dyn CryptoBackend>,
        secret_key: SecretKeyBytes,
    ) -> Result<Self, CryptoError> {
        let public_key = backend.public_key(&secret_key)?;
        let node_id = NodeId::from_public_key(&public_key);
        Ok(Self {
            backend,
            secret_key,
            public_key,
            node_id,
        })
    }

    /// Get the node ID.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Get the compressed public key.
    pub fn public_key(&self) -> &PublicKeyBytes {
        &self.public_key
    }

    pub fn backend(&self) -> &Arc<dyn CryptoBackend> {
        &self.backend
    }

    pub(crate) fn secret_key(&self) -> &SecretKeyBytes {
        &self.secret_key
    }

    /// Hex encoding of the secret key, for persisting a generated identity.
    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.secret_key)
    }

    /// Sign a 32-byte digest with this identity's private key.
    pub fn sign(&self, digest: &[u8; 32]) -> Result<SignatureBytes, CryptoError> {
        self.backend.sign(&self.secret_key, digest)
    }

    /// Verify a signature against this identity's public key.
    pub fn verify(&self, digest: &[u8; 32], signature: &[u8]) -> bool {
        self.backend.verify(&self.public_key, digest, signature)
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id)
            .field("public_key", &hex::encode(self.public_key))
            .finish()
    }
}

/// Calculate the XOR distance between two node IDs.
///
/// The XOR distance is used for Kademlia routing table organization.
/// Nodes with smaller XOR distance are considered "closer" in the DHT.
pub fn xor_distance(a: &NodeId, b: &NodeId) -> [u8; 32] {
    let mut result = [0u8; 32];
    for (out, (x, y)) in result.iter_mut().zip(a.0.iter().zip(b.0.iter())) {
        *out = x ^ y;
    }
    result
}

/// Calculate the log2 distance between two node IDs.
///
/// This is the bit length of the XOR distance: `Some(256)` when the most
/// significant bit differs, `Some(1)` when only the least significant bit
/// differs. Returns `None` if the IDs are identical.
pub fn log2_distance(a: &NodeId, b: &NodeId) -> Option<u64> {
    let distance = xor_distance(a, b);

    for (i, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            let bit_position = i * 8 + byte.leading_zeros() as usize;
            return Some((256 - bit_position) as u64);
        }
    }

    // IDs are identical
    None
}

/// Compare two XOR distances.
///
/// Returns:
/// - `Ordering::Less` if `a` is closer to `target` than `b`
/// - `Ordering::Greater` if `b` is closer to `target` than `a`
/// - `Ordering::Equal` if they are equidistant
pub fn compare_distance(target: &NodeId, a: &NodeId, b: &NodeId) -> Ordering {
    // Big-endian arrays compare like the integers they encode
    xor_distance(target, a).cmp(&xor_distance(target, b))
}
