//! Wire types for the capability RPC protocol.
//!
//! Every frame on a connection carries exactly one [`Message`]. Payload
//! contents are [`Value`] documents whose capability leaves index into the
//! payload's capability table.

pub mod codec;
pub mod dump;
pub mod message;
pub mod value;

pub use codec::DEFAULT_MAX_FRAME_BYTES;
pub use codec::ProtocolError;
pub use codec::decode_frame;
pub use codec::encode_frame;
pub use dump::MessageDump;
pub use message::*;
pub use value::Field;
pub use value::PathError;
pub use value::Value;
