//! Live-session video conferencing core: a room-scoped signaling relay and a
//! full-mesh WebRTC conference client.

#[cfg(feature = "native-audio")]
pub mod audio;
pub mod conference;
pub mod config;
pub mod connection;
pub mod control;
pub mod devices;
pub mod error;
pub mod join;
pub mod media;
pub mod peer;
pub mod protocol;
pub mod recorder;
pub mod server;
pub mod signaling;
pub mod transport;
pub mod webrtc;

pub use conference::{Conference, ConferenceCommand, ConferenceOptions};
pub use error::{Error, Result};
