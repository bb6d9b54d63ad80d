// CLASSIFICATION: COMMUNITY
// Filename: compress.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-06-14

//! Per-frame zstd block compression for the wire.

use std::io;

/// Compression level; link latency dominates, so the cheapest level
/// wins.
const LEVEL: i32 = 1;

/// Compress one frame as a single block.
pub fn compress(buf: &[u8]) -> io::Result<Vec<u8>> {
    zstd::stream::encode_all(buf, LEVEL)
}

/// Decompress one frame. Fails when the peer sent something that is
/// not a zstd block.
pub fn decompress(buf: &[u8]) -> io::Result<Vec<u8>> {
    zstd::stream::decode_all(buf)
}
