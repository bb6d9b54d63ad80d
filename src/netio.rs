// CLASSIFICATION: COMMUNITY
// Filename: netio.rs v0.2
// Author: Lukas Bower
// Date Modified: 2026-07-03

//! Message framing over a byte stream and endpoint parsing. Each
//! message is a u32 little-endian length followed by that many bytes,
//! so a read consumes exactly one frame.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};

/// Upper bound on a single message; a peer advertising more is treated
/// as broken rather than allocated for.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Read one length-prefixed message.
pub fn read_message(stream: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message of {len} bytes exceeds the wire limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

/// Write one length-prefixed message.
pub fn write_message(stream: &mut impl Write, buf: &[u8]) -> io::Result<()> {
    let len = u32::try_from(buf.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;
    stream.write_all(&len.to_le_bytes())?;
    stream.write_all(buf)?;
    stream.flush()
}

/// Resolve an endpoint of the form `tcp://host:port` (the scheme is
/// optional) to a socket address.
pub fn parse_endpoint(endpoint: &str) -> io::Result<SocketAddr> {
    let stripped = endpoint.strip_prefix("tcp://").unwrap_or(endpoint);
    stripped
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "endpoint resolves to nothing"))
}
