//! Client core for room404, an anonymous one-to-one chat with WebRTC media.
//!
//! The [`session::SessionController`] owns one relay connection and at most
//! one negotiation at a time. Everything else plugs in behind traits so the
//! controller can be driven by real sockets and peers or by the in-memory
//! doubles under each module's `mock`.

pub mod cli;
pub mod config;
pub mod media;
pub mod negotiation;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use config::{ClientConfig, MediaMode};
pub use session::{SessionController, SessionEvent, SessionHandle, SessionSnapshot, SessionState};
