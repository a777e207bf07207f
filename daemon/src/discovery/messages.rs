//! RPC messages carried inside encrypted packets.
//!
//! Every message is a one byte type followed by an RLP list whose first
//! element is the request id:
//! - PING (0x01) / PONG (0x02): liveness check and address reflection
//! - FINDNODE (0x03) / NODES (0x04): query records at log2 distances
//! - TALKREQ (0x05) / TALKRESP (0x06): application sub-protocols
//! - REGTOPIC (0x07), TICKET (0x08), REGCONFIRMATION (0x09), TOPICQUERY (0x0A):
//!   topic advertisement, parsed but not served

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use rand::RngCore;
use rlp::{DecoderError, Rlp, RlpStream};

use super::crypto::TAG_SIZE;
use super::error::DecodeError;
use super::packet::{MASKING_IV_SIZE, MAX_PACKET_SIZE, MESSAGE_AUTHDATA_SIZE, STATIC_HEADER_SIZE};
use super::record::NodeRecord;

/// Message type identifiers.
pub mod message_type {
    pub const PING: u8 = 0x01;
    pub const PONG: u8 = 0x02;
    pub const FINDNODE: u8 = 0x03;
    pub const NODES: u8 = 0x04;
    pub const TALKREQ: u8 = 0x05;
    pub const TALKRESP: u8 = 0x06;
    pub const REGTOPIC: u8 = 0x07;
    pub const TICKET: u8 = 0x08;
    pub const REGCONFIRMATION: u8 = 0x09;
    pub const TOPICQUERY: u8 = 0x0A;
}

/// Maximum number of records returned for one FINDNODE.
pub const MAX_NODES_RESPONSE: usize = 16;

/// Maximum number of NODES packets accepted for one request.
pub const MAX_NODES_PACKETS: u64 = 5;

/// Bytes of a NODES message left for records once the packet header, the
/// GCM tag and the message envelope (type, list headers, id, total) are taken.
pub const NODES_RECORDS_BUDGET: usize = MAX_PACKET_SIZE
    - MASKING_IV_SIZE
    - STATIC_HEADER_SIZE
    - MESSAGE_AUTHDATA_SIZE
    - TAG_SIZE
    - 20;

const MAX_REQUEST_ID_SIZE: usize = 8;

/// Opaque request id chosen by the requester, at most 8 bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RequestId(Vec<u8>);

impl RequestId {
    pub fn random() -> Self {
        let mut bytes = vec![0u8; MAX_REQUEST_ID_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn decode(bytes: Vec<u8>) -> Result<Self, DecodeError> {
        if bytes.len() > MAX_REQUEST_ID_SIZE {
            return Err(DecodeError::InvalidRequestId(bytes.len()));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", hex::encode(&self.0))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Ping {
        enr_seq: u64,
    },
    FindNode {
        distances: Vec<u64>,
    },
    TalkReq {
        protocol: Vec<u8>,
        request: Vec<u8>,
    },
    RegTopic {
        topic: Vec<u8>,
        record: NodeRecord,
        ticket: Vec<u8>,
    },
    TopicQuery {
        topic: [u8; 32],
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Pong {
        enr_seq: u64,
        ip: IpAddr,
        port: u16,
    },
    Nodes {
        /// Number of NODES packets making up the whole response.
        total: u64,
        nodes: Vec<NodeRecord>,
    },
    TalkResp {
        response: Vec<u8>,
    },
    Ticket {
        ticket: Vec<u8>,
        wait_time: u64,
    },
    RegConfirmation {
        topic: Vec<u8>,
    },
}

impl RequestBody {
    pub fn msg_type(&self) -> u8 {
        match self {
            Self::Ping { .. } => message_type::PING,
            Self::FindNode { .. } => message_type::FINDNODE,
            Self::TalkReq { .. } => message_type::TALKREQ,
            Self::RegTopic { .. } => message_type::REGTOPIC,
            Self::TopicQuery { .. } => message_type::TOPICQUERY,
        }
    }
}

impl ResponseBody {
    pub fn msg_type(&self) -> u8 {
        match self {
            Self::Pong { .. } => message_type::PONG,
            Self::Nodes { .. } => message_type::NODES,
            Self::TalkResp { .. } => message_type::TALKRESP,
            Self::Ticket { .. } => message_type::TICKET,
            Self::RegConfirmation { .. } => message_type::REGCONFIRMATION,
        }
    }

    /// Whether this is a valid answer to `request`.
    pub fn match_request(&self, request: &RequestBody) -> bool {
        matches!(
            (self, request),
            (Self::Pong { .. }, RequestBody::Ping { .. })
                | (Self::Nodes { .. }, RequestBody::FindNode { .. })
                | (Self::Nodes { .. }, RequestBody::TopicQuery { .. })
                | (Self::TalkResp { .. }, RequestBody::TalkReq { .. })
                | (Self::Ticket { .. }, RequestBody::RegTopic { .. })
                | (Self::RegConfirmation { .. }, RequestBody::RegTopic { .. })
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: RequestId,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: RequestId,
    pub body: ResponseBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

fn encode_list(msg_type: u8, s: RlpStream) -> Vec<u8> {
    let body = s.out();
    let mut buffer = Vec::with_capacity(1 + body.len());
    buffer.push(msg_type);
    buffer.extend_from_slice(&body);
    buffer
}

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        let id = self.id.as_bytes().to_vec();
        let s = match &self.body {
            RequestBody::Ping { enr_seq } => {
                let mut s = RlpStream::new_list(2);
                s.append(&id);
                s.append(enr_seq);
                s
            }
            RequestBody::FindNode { distances } => {
                let mut s = RlpStream::new_list(2);
                s.append(&id);
                s.begin_list(distances.len());
                for distance in distances {
                    s.append(distance);
                }
                s
            }
            RequestBody::TalkReq { protocol, request } => {
                let mut s = RlpStream::new_list(3);
                s.append(&id);
                s.append(protocol);
                s.append(request);
                s
            }
            RequestBody::RegTopic {
                topic,
                record,
                ticket,
            } => {
                let mut s = RlpStream::new_list(4);
                s.append(&id);
                s.append(topic);
                s.append(record);
                s.append(ticket);
                s
            }
            RequestBody::TopicQuery { topic } => {
                let mut s = RlpStream::new_list(2);
                s.append(&id);
                s.append(&topic.to_vec());
                s
            }
        };
        encode_list(self.body.msg_type(), s)
    }
}

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        let id = self.id.as_bytes().to_vec();
        let s = match &self.body {
            ResponseBody::Pong { enr_seq, ip, port } => {
                let mut s = RlpStream::new_list(4);
                s.append(&id);
                s.append(enr_seq);
                match ip {
                    IpAddr::V4(ip) => s.append(&ip.octets().to_vec()),
                    IpAddr::V6(ip) => s.append(&ip.octets().to_vec()),
                };
                s.append(port);
                s
            }
            ResponseBody::Nodes { total, nodes } => {
                let mut s = RlpStream::new_list(3);
                s.append(&id);
                s.append(total);
                s.begin_list(nodes.len());
                for node in nodes {
                    s.append(node);
                }
                s
            }
            ResponseBody::TalkResp { response } => {
                let mut s = RlpStream::new_list(2);
                s.append(&id);
                s.append(response);
                s
            }
            ResponseBody::Ticket { ticket, wait_time } => {
                let mut s = RlpStream::new_list(3);
                s.append(&id);
                s.append(ticket);
                s.append(wait_time);
                s
            }
            ResponseBody::RegConfirmation { topic } => {
                let mut s = RlpStream::new_list(2);
                s.append(&id);
                s.append(topic);
                s
            }
        };
        encode_list(self.body.msg_type(), s)
    }
}

fn expect_items(rlp: &Rlp, count: usize) -> Result<(), DecoderError> {
    if !rlp.is_list() {
        return Err(DecoderError::RlpExpectedToBeList);
    }
    if rlp.item_count()? != count {
        return Err(DecoderError::RlpIncorrectListLen);
    }
    Ok(())
}

fn decode_ip(bytes: &[u8]) -> Result<IpAddr, DecoderError> {
    match bytes.len() {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(bytes);
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            let ip = Ipv6Addr::from(octets);
            // IPv4-mapped addresses are reported as plain IPv4
            Ok(ip.to_ipv4_mapped().map_or(IpAddr::V6(ip), IpAddr::V4))
        }
        _ => Err(DecoderError::Custom("invalid ip length")),
    }
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Request(request) => request.encode(),
            Self::Response(response) => response.encode(),
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let (&msg_type, body) = data
            .split_first()
            .ok_or(DecodeError::InvalidMessageType(0))?;
        let rlp = Rlp::new(body);
        if !rlp.is_list() {
            return Err(DecoderError::RlpExpectedToBeList.into());
        }
        let id = RequestId::decode(rlp.val_at::<Vec<u8>>(0)?)?;

        let message = match msg_type {
            message_type::PING => {
                expect_items(&rlp, 2)?;
                Self::Request(Request {
                    id,
                    body: RequestBody::Ping {
                        enr_seq: rlp.val_at(1)?,
                    },
                })
            }
            message_type::FINDNODE => {
                expect_items(&rlp, 2)?;
                let distances = rlp.list_at::<u64>(1)?;
                if distances.iter().any(|distance| *distance > 256) {
                    return Err(DecoderError::Custom("distance out of range").into());
                }
                Self::Request(Request {
                    id,
                    body: RequestBody::FindNode { distances },
                })
            }
            message_type::TALKREQ => {
                expect_items(&rlp, 3)?;
                Self::Request(Request {
                    id,
                    body: RequestBody::TalkReq {
                        protocol: rlp.val_at(1)?,
                        request: rlp.val_at(2)?,
                    },
                })
            }
            message_type::REGTOPIC => {
                expect_items(&rlp, 4)?;
                Self::Request(Request {
                    id,
                    body: RequestBody::RegTopic {
                        topic: rlp.val_at(1)?,
                        record: rlp.val_at(2)?,
                        ticket: rlp.val_at(3)?,
                    },
                })
            }
            message_type::TOPICQUERY => {
                expect_items(&rlp, 2)?;
                let topic: Vec<u8> = rlp.val_at(1)?;
                let topic = topic
                    .try_into()
                    .map_err(|_| DecoderError::Custom("invalid topic length"))?;
                Self::Request(Request {
                    id,
                    body: RequestBody::TopicQuery { topic },
                })
            }
            message_type::PONG => {
                expect_items(&rlp, 4)?;
                Self::Response(Response {
                    id,
                    body: ResponseBody::Pong {
                        enr_seq: rlp.val_at(1)?,
                        ip: decode_ip(rlp.at(2)?.data()?)?,
                        port: rlp.val_at(3)?,
                    },
                })
            }
            message_type::NODES => {
                expect_items(&rlp, 3)?;
                Self::Response(Response {
                    id,
                    body: ResponseBody::Nodes {
                        total: rlp.val_at(1)?,
                        nodes: rlp.list_at(2)?,
                    },
                })
            }
            message_type::TALKRESP => {
                expect_items(&rlp, 2)?;
                Self::Response(Response {
                    id,
                    body: ResponseBody::TalkResp {
                        response: rlp.val_at(1)?,
                    },
                })
            }
            message_type::TICKET => {
                expect_items(&rlp, 3)?;
                Self::Response(Response {
                    id,
                    body: ResponseBody::Ticket {
                        ticket: rlp.val_at(1)?,
                        wait_time: rlp.val_at(2)?,
                    },
                })
            }
            message_type::REGCONFIRMATION => {
                expect_items(&rlp, 2)?;
                Self::Response(Response {
                    id,
                    body: ResponseBody::RegConfirmation {
                        topic: rlp.val_at(1)?,
                    },
                })
            }
            other => return Err(DecodeError::InvalidMessageType(other)),
        };
        Ok(message)
    }
}

/// Splits records into NODES packets by encoded size.
///
/// Never yields more than [`MAX_NODES_PACKETS`] chunks; records that do not
/// fit are left out. An empty input still yields one empty chunk.
pub fn pack_nodes(records: &[NodeRecord]) -> Vec<Vec<NodeRecord>> {
    let mut packets = Vec::new();
    let mut current: Vec<NodeRecord> = Vec::new();
    let mut used = 0;
    for record in records {
        let size = rlp::encode(record).len();
        if used + size > NODES_RECORDS_BUDGET && !current.is_empty() {
            packets.push(std::mem::take(&mut current));
            used = 0;
            if packets.len() as u64 >= MAX_NODES_PACKETS {
                return packets;
            }
        }
        used += size;
        current.push(record.clone());
    }
    packets.push(current);
    packets
}
