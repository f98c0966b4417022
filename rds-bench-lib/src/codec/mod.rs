//! Boundary between the engine and the target protocol.
//!
//! The engine only ever hands a [`Request`] to a [`Codec`] and gets back a
//! [`Response`]; all protocol specific framing lives behind the trait.

use crate::config::{Action, Protocol, Watermarks};

mod resp;

pub use self::resp::RdsCodec;

/// One operation as produced by the workload selector.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    pub action: Action,
    pub key: &'a [u8],
    /// `items` values of `value_len` bytes each, back to back
    pub values: &'a [u8],
    pub value_len: usize,
    pub items: u32,
    /// element size announced when creating a structure
    pub element_size: usize,
    pub watermarks: Option<Watermarks>,
}

impl Request<'_> {
    pub fn values(&self) -> impl Iterator<Item = &[u8]> {
        self.values.chunks(self.value_len.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Success,
    /// the server answered with an error, e.g. for a missing structure
    Rejected(String),
}

/// The byte stream could not be interpreted as a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError(pub String);

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed response: {}", self.0)
    }
}

impl std::error::Error for DecodeError {}

pub trait Codec: Send + Sync + 'static {
    /// Appends the wire form of `request` to `buf`.
    fn encode(&self, request: &Request<'_>, buf: &mut Vec<u8>);

    /// Decodes the first response in `buf`.
    ///
    /// Returns `Ok(None)` while the response is incomplete, or the response
    /// together with the number of bytes consumed. Only one request is in
    /// flight per connection, so bytes past the response may be consumed
    /// with it.
    fn decode(&self, buf: &[u8]) -> Result<Option<(Response, usize)>, DecodeError>;
}

/// Codec implementing the configured protocol.
pub fn for_protocol(protocol: Protocol) -> RdsCodec {
    match protocol {
        Protocol::Rds => RdsCodec::new(),
    }
}
