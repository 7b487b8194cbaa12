//! Turning the string a player types or pastes into a socket address.
//!
//! Literal addresses (`10.0.0.5`, `10.0.0.5:7777`, `[::1]:9000`) are used as
//! they are. Anything else is treated as a shareable code and handed to an
//! [`AddressCodec`] exactly once.

use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("connection code is empty")]
    Empty,
    #[error("no address codec available to decode {0:?}")]
    Unsupported(String),
    #[error("malformed connection code {code:?}: {reason}")]
    Malformed { code: String, reason: String },
}

/// Decodes human-shareable connection codes into addresses.
pub trait AddressCodec: Send + Sync {
    fn decode(&self, code: &str) -> Result<IpAddr, CodecError>;
}

impl<F> AddressCodec for F
where
    F: Fn(&str) -> Result<IpAddr, CodecError> + Send + Sync,
{
    fn decode(&self, code: &str) -> Result<IpAddr, CodecError> {
        self(code)
    }
}

/// Codec for setups that only ever connect to literal addresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCodec;

impl AddressCodec for NoCodec {
    fn decode(&self, code: &str) -> Result<IpAddr, CodecError> {
        Err(CodecError::Unsupported(code.to_owned()))
    }
}

/// Resolves `input` to the address the client endpoint should connect to.
///
/// `default_port` applies to bare IPs and to decoded codes.
pub fn resolve_target(
    input: &str,
    default_port: u16,
    codec: &dyn AddressCodec,
) -> Result<SocketAddr, CodecError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CodecError::Empty);
    }
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    let ip = codec.decode(input)?;
    Ok(SocketAddr::new(ip, default_port))
}
