//! Real-time duplex audio client.
//!
//! Captures microphone frames, carries them to a processing endpoint and
//! plays the returned audio, with bounded buffering at every hop.

pub mod audio;
pub mod config;
pub mod device;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod session;
pub mod state_machine;
pub mod stats;
pub mod transport;

pub use config::{Config, SessionConfig};
pub use error::SessionError;
pub use session::Session;
pub use state_machine::SessionState;
