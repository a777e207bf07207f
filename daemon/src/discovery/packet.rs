//! Wire packet codec.
//!
//! ```text
//! packet        = masking-iv || masked-header || message
//! masked-header = aes128-ctr(static-header || authdata, key = dest-id[..16], iv = masking-iv)
//! static-header = "discv5" || version (u16) || flag (u8) || nonce (12) || authdata-size (u16)
//! ```
//!
//! All integers are big endian. The message part is opaque here: it is
//! encrypted and authenticated by the session layer.

use aes::cipher::{KeyIvInit, StreamCipher};
use discv5_common::serializer::{Reader, ReaderError, Serializer, Writer};
use rand::RngCore;

use super::error::DecodeError;
use super::identity::NodeId;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

pub const PROTOCOL_ID: &[u8; 6] = b"discv5";
pub const PROTOCOL_VERSION: u16 = 1;

pub const MASKING_IV_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 12;
pub const ID_NONCE_SIZE: usize = 16;
/// protocol id, version, flag, nonce, authdata size
pub const STATIC_HEADER_SIZE: usize = 6 + 2 + 1 + NONCE_SIZE + 2;

pub const MESSAGE_AUTHDATA_SIZE: usize = 32;
pub const WHOAREYOU_AUTHDATA_SIZE: usize = ID_NONCE_SIZE + 8;
/// src id, signature size, ephemeral key size
const HANDSHAKE_AUTHDATA_MIN_SIZE: usize = 32 + 1 + 1;

/// Smallest valid packet: an empty WHOAREYOU.
pub const MIN_PACKET_SIZE: usize = MASKING_IV_SIZE + STATIC_HEADER_SIZE + WHOAREYOU_AUTHDATA_SIZE;
/// Maximum packet size allowed on the wire.
pub const MAX_PACKET_SIZE: usize = 1280;

/// Filler length of the random packet that opens a handshake.
const RANDOM_MESSAGE_SIZE: usize = 44;

pub type Nonce = [u8; NONCE_SIZE];
pub type MaskingIv = [u8; MASKING_IV_SIZE];

pub fn random_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketFlag {
    Message = 0,
    WhoAreYou = 1,
    Handshake = 2,
}

impl PacketFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::WhoAreYou => "whoareyou",
            Self::Handshake => "handshake",
        }
    }
}

impl TryFrom<u8> for PacketFlag {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Message),
            1 => Ok(Self::WhoAreYou),
            2 => Ok(Self::Handshake),
            other => Err(DecodeError::InvalidFlag(other)),
        }
    }
}

/// Unmasked packet header. Protocol id and version are fixed and only
/// checked while decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub flag: PacketFlag,
    pub nonce: Nonce,
    pub authdata: Vec<u8>,
}

impl PacketHeader {
    pub fn authdata_size(&self) -> usize {
        self.authdata.len()
    }

    fn write_static(&self, writer: &mut Writer) {
        writer.write_bytes(PROTOCOL_ID);
        writer.write_u16(PROTOCOL_VERSION);
        writer.write_u8(self.flag as u8);
        writer.write_bytes(&self.nonce);
        writer.write_u16(self.authdata.len() as u16);
    }

    /// static-header || authdata
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(STATIC_HEADER_SIZE + self.authdata.len());
        let mut writer = Writer::new(&mut buffer);
        self.write_static(&mut writer);
        writer.write_bytes(&self.authdata);
        buffer
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub masking_iv: MaskingIv,
    pub header: PacketHeader,
    pub message: Vec<u8>,
}

fn random_iv() -> MaskingIv {
    let mut iv = [0u8; MASKING_IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

impl Packet {
    /// Ordinary message packet with an empty message. The caller encrypts
    /// the message against [`Packet::authenticated_data`] and fills it in.
    pub fn new_message(src_id: NodeId, nonce: Nonce) -> Self {
        Self {
            masking_iv: random_iv(),
            header: PacketHeader {
                flag: PacketFlag::Message,
                nonce,
                authdata: MessageAuthdata { src_id }.to_bytes(),
            },
            message: Vec::new(),
        }
    }

    /// A message packet the recipient cannot decrypt, sent to provoke a WHOAREYOU.
    pub fn new_random(src_id: NodeId) -> Self {
        let mut packet = Self::new_message(src_id, random_nonce());
        let mut filler = vec![0u8; RANDOM_MESSAGE_SIZE];
        rand::thread_rng().fill_bytes(&mut filler);
        packet.message = filler;
        packet
    }

    /// Challenge answering the packet that carried `request_nonce`.
    pub fn new_whoareyou(request_nonce: Nonce, id_nonce: [u8; ID_NONCE_SIZE], enr_seq: u64) -> Self {
        Self {
            masking_iv: random_iv(),
            header: PacketHeader {
                flag: PacketFlag::WhoAreYou,
                nonce: request_nonce,
                authdata: WhoAreYouAuthdata { id_nonce, enr_seq }.to_bytes(),
            },
            message: Vec::new(),
        }
    }

    pub fn new_handshake(nonce: Nonce, authdata: &HandshakeAuthdata) -> Self {
        Self {
            masking_iv: random_iv(),
            header: PacketHeader {
                flag: PacketFlag::Handshake,
                nonce,
                authdata: authdata.to_bytes(),
            },
            message: Vec::new(),
        }
    }

    /// masking-iv || static-header || authdata, unmasked.
    ///
    /// For a WHOAREYOU this is the challenge data; for other packets it is
    /// the associated data of the message encryption.
    pub fn authenticated_data(&self) -> Vec<u8> {
        let header = self.header.to_bytes();
        let mut data = Vec::with_capacity(MASKING_IV_SIZE + header.len());
        data.extend_from_slice(&self.masking_iv);
        data.extend_from_slice(&header);
        data
    }

    /// Sender id of a message or handshake packet.
    pub fn src_id(&self) -> Result<NodeId, DecodeError> {
        match self.header.flag {
            PacketFlag::Message => Ok(MessageAuthdata::from_bytes(&self.header.authdata)?.src_id),
            PacketFlag::Handshake => {
                Ok(HandshakeAuthdata::from_bytes(&self.header.authdata)?.src_id)
            }
            PacketFlag::WhoAreYou => Err(DecodeError::InvalidAuthdataSize {
                flag: PacketFlag::WhoAreYou.as_str(),
                size: self.header.authdata_size(),
            }),
        }
    }

    pub fn encode(&self, dest_id: &NodeId) -> Vec<u8> {
        let mut header = self.header.to_bytes();
        let mut cipher = masking_cipher(dest_id, &self.masking_iv);
        cipher.apply_keystream(&mut header);

        let mut buffer = Vec::with_capacity(MASKING_IV_SIZE + header.len() + self.message.len());
        buffer.extend_from_slice(&self.masking_iv);
        buffer.extend_from_slice(&header);
        buffer.extend_from_slice(&self.message);
        buffer
    }

    /// Unmask and parse a datagram addressed to `local_id`.
    pub fn decode(local_id: &NodeId, data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < MIN_PACKET_SIZE {
            return Err(DecodeError::PacketTooSmall(data.len()));
        }
        if data.len() > MAX_PACKET_SIZE {
            return Err(DecodeError::PacketTooLarge(data.len()));
        }

        let mut masking_iv = [0u8; MASKING_IV_SIZE];
        masking_iv.copy_from_slice(&data[..MASKING_IV_SIZE]);
        let mut cipher = masking_cipher(local_id, &masking_iv);

        let header_end = MASKING_IV_SIZE + STATIC_HEADER_SIZE;
        let mut static_header = data[MASKING_IV_SIZE..header_end].to_vec();
        cipher.apply_keystream(&mut static_header);

        let mut reader = Reader::new(&static_header);
        if reader.read_bytes_ref(PROTOCOL_ID.len())? != PROTOCOL_ID {
            return Err(DecodeError::InvalidProtocolId);
        }
        let version = reader.read_u16()?;
        if version != PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let flag = PacketFlag::try_from(reader.read_u8()?)?;
        let nonce: Nonce = reader.read_bytes()?;
        let authdata_size = reader.read_u16()? as usize;

        let valid_size = match flag {
            PacketFlag::Message => authdata_size == MESSAGE_AUTHDATA_SIZE,
            PacketFlag::WhoAreYou => authdata_size == WHOAREYOU_AUTHDATA_SIZE,
            PacketFlag::Handshake => authdata_size >= HANDSHAKE_AUTHDATA_MIN_SIZE,
        };
        if !valid_size || header_end + authdata_size > data.len() {
            return Err(DecodeError::InvalidAuthdataSize {
                flag: flag.as_str(),
                size: authdata_size,
            });
        }

        // the keystream continues from the static header
        let mut authdata = data[header_end..header_end + authdata_size].to_vec();
        cipher.apply_keystream(&mut authdata);

        Ok(Self {
            masking_iv,
            header: PacketHeader {
                flag,
                nonce,
                authdata,
            },
            message: data[header_end + authdata_size..].to_vec(),
        })
    }
}

fn masking_cipher(dest_id: &NodeId, iv: &MaskingIv) -> Aes128Ctr {
    let mut key = [0u8; 16];
    key.copy_from_slice(&dest_id.as_bytes()[..16]);
    Aes128Ctr::new(&key.into(), &(*iv).into())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageAuthdata {
    pub src_id: NodeId,
}

impl Serializer for MessageAuthdata {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            src_id: NodeId::new(reader.read_bytes()?),
        })
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_bytes(self.src_id.as_bytes());
    }

    fn size(&self) -> usize {
        MESSAGE_AUTHDATA_SIZE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhoAreYouAuthdata {
    pub id_nonce: [u8; ID_NONCE_SIZE],
    /// Highest record sequence number the challenger knows for us, 0 if none.
    pub enr_seq: u64,
}

impl Serializer for WhoAreYouAuthdata {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            id_nonce: reader.read_bytes()?,
            enr_seq: reader.read_u64()?,
        })
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_bytes(&self.id_nonce);
        writer.write_u64(&self.enr_seq);
    }

    fn size(&self) -> usize {
        WHOAREYOU_AUTHDATA_SIZE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeAuthdata {
    pub src_id: NodeId,
    pub id_signature: Vec<u8>,
    pub ephemeral_pubkey: Vec<u8>,
    /// Encoded record of the sender, present when the challenger's copy is stale.
    pub record: Option<Vec<u8>>,
}

impl Serializer for HandshakeAuthdata {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let src_id = NodeId::new(reader.read_bytes()?);
        let sig_size = reader.read_u8()? as usize;
        let key_size = reader.read_u8()? as usize;
        let id_signature = reader.read_bytes_ref(sig_size)?.to_vec();
        let ephemeral_pubkey = reader.read_bytes_ref(key_size)?.to_vec();
        let rest = reader.read_remaining();
        let record = (!rest.is_empty()).then(|| rest.to_vec());

        Ok(Self {
            src_id,
            id_signature,
            ephemeral_pubkey,
            record,
        })
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_bytes(self.src_id.as_bytes());
        writer.write_u8(self.id_signature.len() as u8);
        writer.write_u8(self.ephemeral_pubkey.len() as u8);
        writer.write_bytes(&self.id_signature);
        writer.write_bytes(&self.ephemeral_pubkey);
        if let Some(record) = &self.record {
            writer.write_bytes(record);
        }
    }

    fn size(&self) -> usize {
        HANDSHAKE_AUTHDATA_MIN_SIZE
            + self.id_signature.len()
            + self.ephemeral_pubkey.len()
            + self.record.as_ref().map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_message_packet_encoding() {
        let src_id = NodeId::random();
        let dest_id = NodeId::random();
        let mut packet = Packet::new_message(src_id, random_nonce());
        packet.message = vec![0xab; 40];

        let encoded = packet.encode(&dest_id);
        assert_eq!(
            encoded.len(),
            MASKING_IV_SIZE + STATIC_HEADER_SIZE + MESSAGE_AUTHDATA_SIZE + 40
        );

        let decoded = Packet::decode(&dest_id, &encoded).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.src_id().unwrap(), src_id);
    }

    #[test]
    fn test_header_is_masked() {
        let dest_id = NodeId::random();
        let packet = Packet::new_random(NodeId::random());
        let encoded = packet.encode(&dest_id);

        let masked_header = &encoded[MASKING_IV_SIZE..MASKING_IV_SIZE + PROTOCOL_ID.len()];
        assert_ne!(masked_header, PROTOCOL_ID);

        // unmasking with the wrong key does not yield a packet
        assert!(matches!(
            Packet::decode(&NodeId::random(), &encoded),
            Err(DecodeError::InvalidProtocolId)
        ));
    }

    #[test]
    fn test_whoareyou_challenge_data() {
        let dest_id = NodeId::random();
        let nonce = random_nonce();
        let packet = Packet::new_whoareyou(nonce, [7u8; ID_NONCE_SIZE], 5);

        let encoded = packet.encode(&dest_id);
        assert_eq!(encoded.len(), MIN_PACKET_SIZE);

        let decoded = Packet::decode(&dest_id, &encoded).unwrap();
        assert_eq!(decoded.header.nonce, nonce);
        let authdata = WhoAreYouAuthdata::from_bytes(&decoded.header.authdata).unwrap();
        assert_eq!(authdata.enr_seq, 5);

        let challenge_data = decoded.authenticated_data();
        assert_eq!(challenge_data.len(), MIN_PACKET_SIZE);
        assert_eq!(&challenge_data[..MASKING_IV_SIZE], &encoded[..MASKING_IV_SIZE]);
        assert_eq!(
            &challenge_data[MASKING_IV_SIZE..MASKING_IV_SIZE + 6],
            PROTOCOL_ID
        );
    }

    #[test]
    fn test_handshake_authdata_with_record() {
        let authdata = HandshakeAuthdata {
            src_id: NodeId::random(),
            id_signature: vec![1u8; 64],
            ephemeral_pubkey: vec![2u8; 33],
            record: Some(vec![3u8; 20]),
        };
        let bytes = authdata.to_bytes();
        assert_eq!(bytes.len(), authdata.size());
        assert_eq!(HandshakeAuthdata::from_bytes(&bytes).unwrap(), authdata);

        let truncated = &bytes[..40];
        assert!(HandshakeAuthdata::from_bytes(truncated).is_err());
    }

    #[test]
    fn test_size_limits() {
        let local_id = NodeId::random();
        assert!(matches!(
            Packet::decode(&local_id, &[0u8; MIN_PACKET_SIZE - 1]),
            Err(DecodeError::PacketTooSmall(_))
        ));
        assert!(matches!(
            Packet::decode(&local_id, &[0u8; MAX_PACKET_SIZE + 1]),
            Err(DecodeError::PacketTooLarge(_))
        ));
    }

    #[test]
    fn test_rejects_bad_version_and_flag() {
        let dest_id = NodeId::random();
        let packet = Packet::new_random(NodeId::random());

        // Re-mask a tampered plaintext header
        let tamper = |offset: usize, value: u8| {
            let mut header = packet.header.to_bytes();
            header[offset] = value;
            let mut cipher = masking_cipher(&dest_id, &packet.masking_iv);
            cipher.apply_keystream(&mut header);
            let mut data = packet.masking_iv.to_vec();
            data.extend_from_slice(&header);
            data.extend_from_slice(&packet.message);
            Packet::decode(&dest_id, &data)
        };

        assert!(matches!(tamper(7, 2), Err(DecodeError::UnsupportedVersion(2))));
        assert!(matches!(tamper(8, 9), Err(DecodeError::InvalidFlag(9))));
        // message flag with a 24-byte authdata header field
        assert!(matches!(
            tamper(22, 24),
            Err(DecodeError::InvalidAuthdataSize { .. })
        ));
    }

    proptest! {
        #[test]
        fn decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..1400)) {
            let _ = Packet::decode(&NodeId::new([1u8; 32]), &data);
        }
    }
}
