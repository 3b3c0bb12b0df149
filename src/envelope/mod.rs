//! Envelope codec boundary between the correlator and the wire.
//!
//! The correlator needs two things from this layer: turn a logical request
//! into bytes for the transport, and turn inbound bytes into a typed reply or
//! a parse failure. Everything about the body format lives behind
//! [`EnvelopeCodec`].

pub mod rpc;
pub mod types;

pub use rpc::{reply_frame, RpcFrame, RpcFrameCodec, PROTOCOL_VERSION};
pub use types::{
    ClientMethod, ClientResponse, DeviceRequest, DeviceResponse, EthernetPortSettings,
    GeneralSettings, Inbound,
};

use crate::correlator::CorrelatorError;
use crate::device::DigestChallenge;

/// Per-transmission data the codec may embed in the frame.
#[derive(Debug, Clone, Copy)]
pub struct EncodeContext<'a> {
    pub message_id: u64,
    pub digest_challenge: Option<&'a DigestChallenge>,
}

/// Builds and parses device envelopes.
pub trait EnvelopeCodec: Send + Sync {
    /// Render a request for transmission.
    fn encode(
        &self,
        request: &DeviceRequest,
        ctx: &EncodeContext<'_>,
    ) -> Result<Vec<u8>, CorrelatorError>;

    /// Parse one inbound frame. Only `UnexpectedParse` is returned as an error.
    fn decode(&self, raw: &[u8]) -> Result<Inbound, CorrelatorError>;

    /// Render the terminal notification pushed when a workflow finishes.
    fn encode_client_response(&self, response: &ClientResponse)
        -> Result<Vec<u8>, CorrelatorError>;
}
