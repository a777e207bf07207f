//! discv5:// URL parser for bootstrap nodes.
//!
//! Format: `discv5://<compressed_pubkey_hex>@<ip>:<port>`
//!
//! Example: `discv5://02a1b2c3...@192.168.1.1:9000`
//!
//! The URL carries the public key rather than the node id so that a
//! session can be opened with the node before its record is known.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use super::crypto::PublicKeyBytes;
use super::error::{DiscoveryError, DiscoveryResult};
use super::identity::NodeId;
use super::record::Contact;

/// URL scheme for discovery nodes.
pub const NODE_URL_SCHEME: &str = "discv5://";

/// Parsed discv5:// URL containing a public key and socket address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeUrl {
    /// Compressed secp256k1 public key (33 bytes).
    pub public_key: PublicKeyBytes,
    /// The socket address (IP:port).
    pub address: SocketAddr,
}

impl NodeUrl {
    pub fn new(public_key: PublicKeyBytes, address: SocketAddr) -> Self {
        Self {
            public_key,
            address,
        }
    }

    /// Parse a discv5:// URL string.
    ///
    /// # Returns
    /// * `Ok(NodeUrl)` if parsing succeeds
    /// * `Err(DiscoveryError::InvalidUrl)` if the format is invalid
    pub fn parse(s: &str) -> DiscoveryResult<Self> {
        let rest = s.strip_prefix(NODE_URL_SCHEME).ok_or_else(|| {
            DiscoveryError::InvalidUrl(format!(
                "URL must start with '{}', got: {}",
                NODE_URL_SCHEME, s
            ))
        })?;

        let (key_hex, address_str) = rest.split_once('@').ok_or_else(|| {
            DiscoveryError::InvalidUrl(format!(
                "URL must contain '@' separator between public key and address: {}",
                s
            ))
        })?;

        // 33 bytes compressed
        if key_hex.len() != 66 {
            return Err(DiscoveryError::InvalidUrl(format!(
                "Public key must be 66 hex characters (33 bytes), got {} characters",
                key_hex.len()
            )));
        }

        let key_bytes = hex::decode(key_hex)
            .map_err(|e| DiscoveryError::InvalidUrl(format!("Invalid public key hex: {}", e)))?;

        let mut public_key = [0u8; 33];
        public_key.copy_from_slice(&key_bytes);
        if public_key[0] != 0x02 && public_key[0] != 0x03 {
            return Err(DiscoveryError::InvalidUrl(
                "Public key must be in compressed form".to_string(),
            ));
        }

        let address: SocketAddr = address_str.parse().map_err(|e| {
            DiscoveryError::InvalidUrl(format!("Invalid socket address '{}': {}", address_str, e))
        })?;

        Ok(Self {
            public_key,
            address,
        })
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(&self.public_key)
    }

    pub fn to_contact(&self) -> Contact {
        Contact::raw(self.public_key, self.address)
    }
}

impl fmt::Display for NodeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}@{}",
            NODE_URL_SCHEME,
            hex::encode(self.public_key),
            self.address
        )
    }
}

impl FromStr for NodeUrl {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    fn sample_key() -> PublicKeyBytes {
        let mut key = [0x5au8; 33];
        key[0] = 0x03;
        key
    }

    #[test]
    fn test_parse_valid_ipv4() {
        let url_str = format!("discv5://{}@192.168.1.1:9000", hex::encode(sample_key()));

        let parsed = NodeUrl::parse(&url_str).unwrap();
        assert_eq!(parsed.public_key, sample_key());
        assert_eq!(
            parsed.address,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)), 9000)
        );
        assert_eq!(parsed.node_id(), NodeId::from_public_key(&sample_key()));
    }

    #[test]
    fn test_parse_valid_ipv6() {
        let url_str = format!("discv5://{}@[::1]:9000", hex::encode(sample_key()));

        let parsed = NodeUrl::parse(&url_str).unwrap();
        assert_eq!(
            parsed.address,
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 9000)
        );
    }

    #[test]
    fn test_parse_errors() {
        let key = hex::encode(sample_key());
        let cases = [
            ("1a2b3c@127.0.0.1:9000".to_string(), "discv5://"),
            (format!("discv5://{}127.0.0.1:9000", key), "@"),
            ("discv5://1a2b3c@127.0.0.1:9000".to_string(), "66 hex characters"),
            (format!("discv5://{}@127.0.0.1:9000", "g".repeat(66)), "Invalid public key hex"),
            (format!("discv5://04{}@127.0.0.1:9000", &key[2..]), "compressed"),
            (format!("discv5://{}@not-an-address", key), "Invalid socket address"),
        ];

        for (url, expected) in cases {
            match NodeUrl::parse(&url) {
                Err(DiscoveryError::InvalidUrl(msg)) => {
                    assert!(msg.contains(expected), "{} -> {}", url, msg)
                }
                other => panic!("{} parsed unexpectedly: {:?}", url, other),
            }
        }
    }

    #[test]
    fn test_display_parses_back() {
        let url = NodeUrl::new(sample_key(), "10.0.0.1:9000".parse().unwrap());
        let displayed = url.to_string();
        assert!(displayed.starts_with(NODE_URL_SCHEME));

        let parsed: NodeUrl = displayed.parse().unwrap();
        assert_eq!(parsed, url);
        assert!(matches!(parsed.to_contact(), Contact::Raw { .. }));
    }
}
