// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{AppError, AppResult};

/// One application-level unit exchanged over a connection.
///
/// The set is closed: every codec matches on it exhaustively and rejects the
/// variants its wire format cannot carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Close,
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Frame {
        Frame::Text(text.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Text(_) => "text",
            Frame::Binary(_) => "binary",
            Frame::Close => "close",
        }
    }
}

/// Decodes frames out of a connection's shared read buffer.
pub trait FrameReader: Send + Sync {
    /// Whether a complete frame sits at the front of `buffer`.
    ///
    /// Must not consume anything. A header that is already known to be
    /// invalid counts as ready so that the following `read` reports it.
    fn is_ready(&self, buffer: &[u8]) -> bool;

    /// Consumes one frame from the front of `buffer`.
    ///
    /// `Ok(None)` means bytes were consumed but yielded nothing to deliver.
    fn read(&self, buffer: &mut BytesMut) -> AppResult<Option<Frame>>;
}

/// Encodes frames into a connection's shared write buffer.
pub trait FrameWriter: Send + Sync {
    fn write(&self, frame: &Frame, buffer: &mut BytesMut) -> AppResult<()>;
}

/// 4-byte big-endian length followed by that many payload bytes.
#[derive(Debug, Clone)]
pub struct LengthPrefixedReader {
    max_frame_size: usize,
}

impl LengthPrefixedReader {
    pub fn new(max_frame_size: usize) -> Self {
        LengthPrefixedReader { max_frame_size }
    }

    fn check(&self, buffer: &[u8]) -> AppResult<()> {
        if buffer.len() < 4 {
            return Err(AppError::Incomplete);
        }
        let body_size = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        if body_size > self.max_frame_size {
            return Err(AppError::FrameTooLarge(body_size as u64));
        }
        if buffer.len() < body_size + 4 {
            return Err(AppError::Incomplete);
        }
        Ok(())
    }
}

impl FrameReader for LengthPrefixedReader {
    fn is_ready(&self, buffer: &[u8]) -> bool {
        match self.check(buffer) {
            Ok(()) | Err(AppError::FrameTooLarge(_)) => true,
            Err(_) => false,
        }
    }

    fn read(&self, buffer: &mut BytesMut) -> AppResult<Option<Frame>> {
        match self.check(buffer) {
            Ok(()) => {
                let body_length = buffer.get_u32() as usize;
                let body = buffer.split_to(body_length).freeze();
                Ok(Some(Frame::Binary(body)))
            }
            Err(AppError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LengthPrefixedWriter;

impl FrameWriter for LengthPrefixedWriter {
    fn write(&self, frame: &Frame, buffer: &mut BytesMut) -> AppResult<()> {
        let payload: &[u8] = match frame {
            Frame::Binary(bytes) => &bytes[..],
            Frame::Text(text) => text.as_bytes(),
            Frame::Close => {
                return Err(AppError::UnsupportedFrame(
                    "close has no length-prefixed encoding".into(),
                ))
            }
        };
        let length = u32::try_from(payload.len())
            .map_err(|_| AppError::FrameTooLarge(payload.len() as u64))?;
        buffer.reserve(payload.len() + 4);
        buffer.put_u32(length);
        buffer.put_slice(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_prefixed_partial() {
        let reader = LengthPrefixedReader::new(1024);
        let mut buffer = BytesMut::new();
        buffer.put_u32(5);
        buffer.put_slice(b"he");

        assert!(!reader.is_ready(&buffer));
        assert_eq!(buffer.len(), 6);

        buffer.put_slice(b"llo");
        assert!(reader.is_ready(&buffer));
        let frame = reader.read(&mut buffer).unwrap();
        assert_eq!(frame, Some(Frame::Binary(Bytes::from_static(b"hello"))));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_length_prefixed_too_large() {
        let reader = LengthPrefixedReader::new(16);
        let mut buffer = BytesMut::new();
        buffer.put_u32(17);

        assert!(reader.is_ready(&buffer));
        assert!(matches!(
            reader.read(&mut buffer),
            Err(AppError::FrameTooLarge(17))
        ));
    }

    #[test]
    fn test_length_prefixed_writer() {
        let mut buffer = BytesMut::new();
        LengthPrefixedWriter
            .write(&Frame::text("abc"), &mut buffer)
            .unwrap();
        assert_eq!(&buffer[..], &[0, 0, 0, 3, b'a', b'b', b'c']);

        assert!(LengthPrefixedWriter.write(&Frame::Close, &mut buffer).is_err());
    }
}
