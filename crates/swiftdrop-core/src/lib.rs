//! SwiftDrop Core - secure LAN peer-to-peer file transfer
//!
//! A local-first file transfer protocol: ECDH-keyed, AES-256-GCM-encrypted,
//! driven entirely by a length-prefixed framing codec over any ordered byte
//! stream. This crate owns the protocol state machines; discovery, the byte
//! transport, and persistence all live at the edges as collaborator traits.

pub mod cancel;
pub mod chunker;
pub mod codec;
pub mod config;
pub mod connection;
pub mod device;
pub mod session;
pub mod sink;
pub mod transfer;

pub use cancel::CancelToken;
pub use config::Config;
pub use connection::{ConnectionError, PeerConnection};
pub use device::{ConnectionKind, Device, DeviceClass, DeviceState};
pub use session::{run_receiver, run_sender, PeerIdentity, SessionOutcome};
pub use sink::{AcceptIntoDirectory, FileSink, IncomingOffer, OfferCallback, OfferDecision};
pub use transfer::{Direction, TransferRecord, TransferState};
