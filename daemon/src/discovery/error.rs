//! Error types for the discovery protocol.
//!
//! Decode and crypto failures are local to a single packet: the packet is
//! dropped and logged. Request failures travel back to whoever issued the
//! request. Nothing here is fatal to the node.

use std::io::Error as IoError;
use std::net::AddrParseError;

use discv5_common::serializer::ReaderError;
use thiserror::Error;

use super::identity::{NodeAddress, NodeId};

/// A malformed packet, message or record.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Packet below the minimum packet size.
    #[error("Packet too small: {0} bytes")]
    PacketTooSmall(usize),

    /// Packet above the maximum packet size.
    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    /// Static header does not start with the protocol id.
    #[error("Invalid protocol id")]
    InvalidProtocolId,

    /// Unsupported protocol version.
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    /// Unknown packet flag.
    #[error("Invalid packet flag: {0}")]
    InvalidFlag(u8),

    /// Authdata size does not fit the packet flag.
    #[error("Invalid authdata size {size} for {flag} packet")]
    InvalidAuthdataSize { flag: &'static str, size: usize },

    /// Truncated fixed-layout data.
    #[error("Truncated data: {0}")]
    Truncated(#[from] ReaderError),

    /// Unknown message type byte.
    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    /// Message body is not valid RLP for its type.
    #[error("Invalid RLP: {0}")]
    Rlp(#[from] rlp::DecoderError),

    /// Request id longer than 8 bytes.
    #[error("Invalid request id length: {0}")]
    InvalidRequestId(usize),

    /// AEAD ciphertext shorter than the authentication tag.
    #[error("Ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),

    /// AEAD tag check failed.
    #[error("Message decryption failed")]
    DecryptionFailed,

    /// Address record rejected.
    #[error("Invalid record: {0}")]
    InvalidRecord(&'static str),
}

/// Signature, key or key-agreement failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid secret key")]
    InvalidSecretKey,

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Message encryption failed")]
    EncryptionFailed,
}

/// Session layer failure, raised immediately to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No established session to answer on.
    #[error("No established session with {0}")]
    NoSession(NodeAddress),

    /// Contact without a usable UDP address.
    #[error("Contact {0} has no UDP socket address")]
    MissingSocketAddress(NodeId),

    /// Cannot open a session with ourselves.
    #[error("Cannot open a session with the local node")]
    SelfSession,

    /// Crypto failure while preparing a packet.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Failure of a single outbound request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// No response after all retries.
    #[error("Request timed out")]
    Timeout,

    /// Response did not match the request.
    #[error("Response does not match the request")]
    ResponseMismatch,

    /// The handshake never completed.
    #[error("Session could not be established in time")]
    SessionEstablishTimeout,

    /// The session was evicted from the cache while the request was queued.
    #[error("Session evicted")]
    SessionEvicted,

    /// The service is shutting down.
    #[error("Discovery service stopped")]
    ServiceStopped,

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Error type for discovery protocol operations.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Address parsing error.
    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] AddrParseError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Request(#[from] RequestError),

    /// Invalid URL format.
    #[error("Invalid node URL: {0}")]
    InvalidUrl(String),

    /// Socket bind error.
    #[error("Failed to bind UDP socket on {0}: {1}")]
    BindFailed(String, IoError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The reactor task is gone.
    #[error("Discovery service stopped")]
    ServiceStopped,
}

/// Result type alias for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
