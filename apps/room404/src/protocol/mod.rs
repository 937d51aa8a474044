//! Relay envelope codec.
//!
//! Incoming frames are parsed defensively: anything that is not a known
//! JSON envelope becomes a [`ParseError`] and is dropped by the transport.

mod envelope;
mod violation;

pub use envelope::{
    ChatWireFormat, Envelope, IceCandidate, ParseError, Presence, PresenceEvent, SdpKind,
    SessionDescription,
};
pub use violation::ProtocolViolation;
