//! The signaling service: room membership bookkeeping and opaque message relay.

pub mod room;
pub mod service;
pub mod ws;

pub use service::SignalingService;
pub use ws::serve;
