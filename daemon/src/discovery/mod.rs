//! Discovery v5: encrypted UDP peer discovery.
//!
//! Nodes are identified by the keccak256 hash of their uncompressed
//! secp256k1 public key and advertise themselves through signed node
//! records. Every exchange after the first packet is encrypted with
//! per-session AES-128-GCM keys agreed through a WHOAREYOU challenge and an
//! ECDH handshake.
//!
//! ## Layers
//!
//! - [`packet`]: masked packet headers (MESSAGE, WHOAREYOU, HANDSHAKE)
//! - [`session`]: handshakes, session cache, request retries
//! - [`service`]: routing table, lookups, NODES reassembly, address votes
//! - [`server`]: UDP socket, reactor task and [`DiscoveryHandle`]
//!
//! ## Message Types
//!
//! | Type | ID | Description |
//! |------|-----|-------------|
//! | PING | 0x01 | Liveness check, carries the sender's record sequence |
//! | PONG | 0x02 | Response to PING with the observed address |
//! | FINDNODE | 0x03 | Request records at a list of log2 distances |
//! | NODES | 0x04 | Records packed by size, 16 per response in at most 5 packets |
//! | TALKREQ | 0x05 | Application request for a named protocol |
//! | TALKRESP | 0x06 | Response to TALKREQ |
//!
//! ## Node URL Format
//!
//! ```text
//! discv5://<compressed_pubkey_hex>@<ip>:<port>
//! ```
//!
//! ## Usage
//!
//! ```bash
//! discv5_daemon --discovery-port 9000 --discovery-bootstrap "discv5://02...@10.0.0.1:9000"
//! ```
//!
//! ## Constants
//!
//! - Default discovery port: 9000
//! - K-bucket size: 16 nodes
//! - Lookup parallelism: 3
//! - Max packet size: 1280 bytes

pub mod addr_votes;
pub mod config;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod lookup;
pub mod messages;
pub mod packet;
pub mod rate_limiter;
pub mod record;
pub mod routing_table;
pub mod server;
pub mod service;
pub mod session;
pub mod timer;
pub mod url;

pub use config::DiscoveryConfig;
pub use crypto::{CryptoBackend, Secp256k1Backend};
pub use error::{DiscoveryError, DiscoveryResult, RequestError, SessionError};
pub use identity::{NodeAddress, NodeId, NodeIdentity};
pub use record::{Contact, NodeRecord};
pub use routing_table::{BucketEntry, EntryStatus, InsertResult, RoutingTable};
pub use server::{DiscoveryHandle, DiscoveryServer};
pub use service::{DiscoveryEvent, PingResponse, TalkRequest};
pub use url::NodeUrl;
