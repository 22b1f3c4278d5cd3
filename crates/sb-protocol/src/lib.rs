//! Control-plane protocol between the coordinator and its workers.
//!
//! Every frame on the wire is one UTF-8 JSON envelope; the `type` tag
//! selects the payload schema. Decoding is two-phase: the envelope fields
//! are checked first, then the payload is parsed into its typed struct at
//! the call site that knows which kind it expects.

pub mod envelope;
pub mod event;
pub mod payload;

pub use envelope::{Envelope, MessageKind, ProtocolError};
pub use event::StreamEvent;

/// Semver protocol version exchanged during registration.
///
/// A mismatch is reported back at handshake time but is not fatal.
pub const PROTOCOL_VERSION: &str = "1.0.0";
