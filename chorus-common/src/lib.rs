//! Chorus Common Library
//!
//! Shared types for the Chorus voice streaming system: the datagram wire
//! envelope, the authenticated payload encryption, and the audio constants
//! that sender and receiver must agree on.

pub mod crypto;
pub mod protocol;
pub mod voice;

pub use crypto::{CryptoError, SecretKey, open, seal};
pub use protocol::{Envelope, WireError};
pub use voice::Pan;
