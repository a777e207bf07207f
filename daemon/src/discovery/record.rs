//! Signed node records and peer contacts.
//!
//! A [`NodeRecord`] is the signed, versioned advertisement of a node's
//! identity and UDP location. Its RLP layout is
//! `[signature, seq, k1, v1, k2, v2, ...]` with keys in lexicographic order,
//! and the signature covers `rlp([seq, k1, v1, ...])`.
//!
//! Records are values: changing the advertised socket produces a new record
//! with a higher sequence number.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use rlp::{DecoderError, Encodable, Rlp, RlpStream};

use super::crypto::{CryptoBackend, PublicKeyBytes, SignatureBytes};
use super::error::{CryptoError, DecodeError, SessionError};
use super::identity::{NodeAddress, NodeId, NodeIdentity};

/// Maximum size of an encoded record.
pub const MAX_RECORD_SIZE: usize = 300;

const ID_SCHEME: &[u8] = b"v4";

/// Address family selector for [`NodeRecord::udp_socket_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

#[derive(Clone, PartialEq, Eq)]
pub struct NodeRecord {
    seq: u64,
    public_key: PublicKeyBytes,
    ip4: Option<Ipv4Addr>,
    udp4: Option<u16>,
    ip6: Option<Ipv6Addr>,
    udp6: Option<u16>,
    signature: SignatureBytes,
    node_id: NodeId,
}

impl NodeRecord {
    /// Build and sign a record for the local identity.
    pub fn new(
        identity: &NodeIdentity,
        seq: u64,
        socket: Option<SocketAddr>,
    ) -> Result<Self, CryptoError> {
        let mut record = Self {
            seq,
            public_key: *identity.public_key(),
            ip4: None,
            udp4: None,
            ip6: None,
            udp6: None,
            signature: [0u8; 64],
            node_id: *identity.node_id(),
        };
        if let Some(socket) = socket {
            record.set_socket(socket);
        }
        record.sign(identity)?;
        Ok(record)
    }

    /// New record advertising `socket`, with the sequence number bumped.
    pub fn with_udp_socket(
        &self,
        identity: &NodeIdentity,
        socket: SocketAddr,
    ) -> Result<Self, CryptoError> {
        let mut record = self.clone();
        record.set_socket(socket);
        record.seq = self.seq.saturating_add(1);
        record.sign(identity)?;
        Ok(record)
    }

    fn set_socket(&mut self, socket: SocketAddr) {
        match socket {
            SocketAddr::V4(addr) => {
                self.ip4 = Some(*addr.ip());
                self.udp4 = Some(addr.port());
            }
            SocketAddr::V6(addr) => {
                self.ip6 = Some(*addr.ip());
                self.udp6 = Some(addr.port());
            }
        }
    }

    fn sign(&mut self, identity: &NodeIdentity) -> Result<(), CryptoError> {
        let digest = identity.backend().hash(&self.signed_content());
        self.signature = identity.sign(&digest)?;
        Ok(())
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn public_key(&self) -> &PublicKeyBytes {
        &self.public_key
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn udp_socket_for(&self, family: AddressFamily) -> Option<SocketAddr> {
        match family {
            AddressFamily::V4 => Some(SocketAddr::V4(SocketAddrV4::new(self.ip4?, self.udp4?))),
            AddressFamily::V6 => Some(SocketAddr::V6(SocketAddrV6::new(
                self.ip6?,
                self.udp6?,
                0,
                0,
            ))),
        }
    }

    /// The socket to contact this node on, IPv4 preferred.
    pub fn udp_socket(&self) -> Option<SocketAddr> {
        self.udp_socket_for(AddressFamily::V4)
            .or_else(|| self.udp_socket_for(AddressFamily::V6))
    }

    pub fn verify(&self, backend: &dyn CryptoBackend) -> bool {
        let digest = backend.hash(&self.signed_content());
        backend.verify(&self.public_key, &digest, &self.signature)
    }

    /// Number of key/value pairs present.
    fn pair_count(&self) -> usize {
        2 + [
            self.ip4.is_some(),
            self.ip6.is_some(),
            self.udp4.is_some(),
            self.udp6.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }

    fn append_pairs(&self, s: &mut RlpStream) {
        s.append(&"id");
        s.append(&ID_SCHEME);
        if let Some(ip) = self.ip4 {
            s.append(&"ip");
            s.append(&ip.octets().to_vec());
        }
        if let Some(ip) = self.ip6 {
            s.append(&"ip6");
            s.append(&ip.octets().to_vec());
        }
        s.append(&"secp256k1");
        s.append(&self.public_key.to_vec());
        if let Some(port) = self.udp4 {
            s.append(&"udp");
            s.append(&port);
        }
        if let Some(port) = self.udp6 {
            s.append(&"udp6");
            s.append(&port);
        }
    }

    fn signed_content(&self) -> Vec<u8> {
        let mut s = RlpStream::new_list(1 + self.pair_count() * 2);
        s.append(&self.seq);
        self.append_pairs(&mut s);
        s.out().to_vec()
    }

    pub fn encode(&self) -> Vec<u8> {
        rlp::encode(self).to_vec()
    }

    /// Structural decode. The signature is checked separately with [`NodeRecord::verify`].
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() > MAX_RECORD_SIZE {
            return Err(DecodeError::InvalidRecord("record too large"));
        }
        Ok(rlp::decode(bytes)?)
    }
}

impl Encodable for NodeRecord {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2 + self.pair_count() * 2);
        s.append(&self.signature.to_vec());
        s.append(&self.seq);
        self.append_pairs(s);
    }
}

fn fixed<const N: usize>(data: &[u8]) -> Result<[u8; N], DecoderError> {
    data.try_into()
        .map_err(|_| DecoderError::Custom("invalid field length"))
}

impl rlp::Decodable for NodeRecord {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if !rlp.is_list() {
            return Err(DecoderError::RlpExpectedToBeList);
        }
        if rlp.as_raw().len() > MAX_RECORD_SIZE {
            return Err(DecoderError::Custom("record too large"));
        }
        let count = rlp.item_count()?;
        if count < 2 || count % 2 != 0 {
            return Err(DecoderError::RlpIncorrectListLen);
        }

        let signature = fixed::<64>(rlp.at(0)?.data()?)?;
        let seq: u64 = rlp.val_at(1)?;

        let mut id_scheme = None;
        let mut public_key = None;
        let mut ip4 = None;
        let mut udp4 = None;
        let mut ip6 = None;
        let mut udp6 = None;
        let mut previous_key: Option<Vec<u8>> = None;

        for index in (2..count).step_by(2) {
            let key = rlp.at(index)?.data()?.to_vec();
            if previous_key.as_ref().is_some_and(|prev| *prev >= key) {
                return Err(DecoderError::Custom("keys not sorted"));
            }
            let value = rlp.at(index + 1)?;
            match key.as_slice() {
                b"id" => id_scheme = Some(value.data()?.to_vec()),
                b"secp256k1" => public_key = Some(fixed::<33>(value.data()?)?),
                b"ip" => ip4 = Some(Ipv4Addr::from(fixed::<4>(value.data()?)?)),
                b"ip6" => ip6 = Some(Ipv6Addr::from(fixed::<16>(value.data()?)?)),
                b"udp" => udp4 = Some(value.as_val::<u16>()?),
                b"udp6" => udp6 = Some(value.as_val::<u16>()?),
                // unknown keys are carried by other implementations; we do not need them
                _ => return Err(DecoderError::Custom("unsupported record key")),
            }
            previous_key = Some(key);
        }

        if id_scheme.as_deref() != Some(ID_SCHEME) {
            return Err(DecoderError::Custom("unsupported identity scheme"));
        }
        let public_key = public_key.ok_or(DecoderError::Custom("missing public key"))?;

        Ok(Self {
            seq,
            public_key,
            ip4,
            udp4,
            ip6,
            udp6,
            signature,
            node_id: NodeId::from_public_key(&public_key),
        })
    }
}

impl fmt::Debug for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRecord")
            .field("node_id", &self.node_id)
            .field("seq", &self.seq)
            .field("udp", &self.udp_socket())
            .finish()
    }
}

/// How we know a peer: a verified record, or only its key and socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Contact {
    Record(NodeRecord),
    Raw {
        public_key: PublicKeyBytes,
        node_id: NodeId,
        socket_addr: SocketAddr,
    },
}

impl Contact {
    pub fn raw(public_key: PublicKeyBytes, socket_addr: SocketAddr) -> Self {
        Self::Raw {
            public_key,
            node_id: NodeId::from_public_key(&public_key),
            socket_addr,
        }
    }

    pub fn node_id(&self) -> NodeId {
        match self {
            Self::Record(record) => *record.node_id(),
            Self::Raw { node_id, .. } => *node_id,
        }
    }

    pub fn public_key(&self) -> &PublicKeyBytes {
        match self {
            Self::Record(record) => record.public_key(),
            Self::Raw { public_key, .. } => public_key,
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Record(record) => record.udp_socket(),
            Self::Raw { socket_addr, .. } => Some(*socket_addr),
        }
    }

    pub fn record(&self) -> Option<&NodeRecord> {
        match self {
            Self::Record(record) => Some(record),
            Self::Raw { .. } => None,
        }
    }

    pub fn node_address(&self) -> Result<NodeAddress, SessionError> {
        let socket_addr = self
            .socket_addr()
            .ok_or_else(|| SessionError::MissingSocketAddress(self.node_id()))?;
        Ok(NodeAddress::new(self.node_id(), socket_addr))
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.socket_addr().map(|socket| socket.ip())
    }
}

impl From<NodeRecord> for Contact {
    fn from(record: NodeRecord) -> Self {
        Self::Record(record)
    }
}
