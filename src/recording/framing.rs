// src/recording/framing.rs
//! Length-prefixed batch framing
//!
//! A batch file is a sequence of `[u32 big-endian length][payload]` frames.
//! A frame cut short at EOF is a crash artifact and is dropped on decode.
//! Decoding depends only on the bytes, never on the configured item limit,
//! so batches written under an older configuration stay readable.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length prefix
pub const FRAME_HEADER_LEN: usize = 4;

/// Bytes a payload of `payload_len` occupies on disk
pub fn frame_len(payload_len: usize) -> usize {
    FRAME_HEADER_LEN + payload_len
}

/// Encode one frame
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(frame_len(payload.len()));
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Result of decoding a batch file
#[derive(Debug, Default)]
pub struct DecodedFrames {
    /// Payloads in file order
    pub events: Vec<Bytes>,

    /// Bytes after the last complete frame that were ignored
    pub discarded_bytes: usize,
}

impl DecodedFrames {
    /// Nothing decodable at all, yet the data was not empty
    pub fn is_unreadable(&self) -> bool {
        self.events.is_empty() && self.discarded_bytes > 0
    }
}

/// Decode every complete frame in `data`
///
/// Decoding stops at the first frame whose length runs past the end of the
/// data; everything from there on is a torn tail.
pub fn decode_frames(mut data: Bytes) -> DecodedFrames {
    let mut decoded = DecodedFrames::default();

    while data.remaining() >= FRAME_HEADER_LEN {
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

        if len > data.remaining() - FRAME_HEADER_LEN {
            break;
        }

        data.advance(FRAME_HEADER_LEN);
        decoded.events.push(data.split_to(len));
    }

    decoded.discarded_bytes = data.remaining();
    decoded
}
