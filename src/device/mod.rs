//! Connection registry: one entry per live device session.

pub mod registry;
pub mod types;

pub use registry::{DeviceConnection, DeviceRegistry};
pub use types::{
    ChannelTransport, DeviceSnapshot, DeviceStatus, DeviceTransport, DigestChallenge, NetworkInfo,
};
