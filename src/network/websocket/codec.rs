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

use bytes::{Buf, BufMut, BytesMut};
use tracing::warn;

use crate::network::{Frame, FrameReader, FrameWriter};
use crate::{AppError, AppResult};

/// Payloads above this are fatal to the connection.
pub const MAX_PAYLOAD_SIZE: u64 = 1_000_000;

const FIN_BIT: u8 = 0b1000_0000;
const RESERVED_BITS: u8 = 0b0111_0000;
const OPCODE_BITS: u8 = 0b0000_1111;
const MASK_BIT: u8 = 0b1000_0000;
const LENGTH_BITS: u8 = 0b0111_1111;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl TryFrom<u8> for OpCode {
    type Error = AppError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(AppError::MalformedProtocol(format!(
                "reserved websocket opcode {:#x}",
                other
            ))),
        }
    }
}

/// Opcodes this codec turns into frames.
#[derive(Debug, Clone, Copy)]
enum Payload {
    Text,
    Binary,
    Close,
}

#[derive(Debug)]
struct Header {
    fin: bool,
    reserved: u8,
    opcode: u8,
    masked: bool,
    /// bytes before the mask key
    length_size: usize,
    payload_len: u64,
}

impl Header {
    fn size(&self) -> usize {
        self.length_size + if self.masked { 4 } else { 0 }
    }

    fn frame_size(&self) -> u64 {
        self.size() as u64 + self.payload_len
    }
}

/// Parses the fixed header and the length fields from a borrowed view of the
/// buffer, so the caller's buffer position never moves.
fn parse_header(mut src: &[u8]) -> AppResult<Option<Header>> {
    if src.remaining() < 2 {
        return Ok(None);
    }
    let first = src.get_u8();
    let second = src.get_u8();
    let length_code = second & LENGTH_BITS;
    let extra = match length_code {
        126 => 2,
        127 => 8,
        _ => 0,
    };
    if src.remaining() < extra {
        return Ok(None);
    }
    let payload_len = match extra {
        0 => u64::from(length_code),
        2 => u64::from(src.get_u16()),
        _ => src.get_u64(),
    };
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(AppError::FrameTooLarge(payload_len));
    }
    Ok(Some(Header {
        fin: first & FIN_BIT != 0,
        reserved: first & RESERVED_BITS,
        opcode: first & OPCODE_BITS,
        masked: second & MASK_BIT != 0,
        length_size: 2 + extra,
        payload_len,
    }))
}

#[derive(Debug, Clone, Default)]
pub struct WebSocketReader;

impl FrameReader for WebSocketReader {
    fn is_ready(&self, buffer: &[u8]) -> bool {
        match parse_header(buffer) {
            Ok(Some(header)) => buffer.len() as u64 >= header.frame_size(),
            Ok(None) => false,
            // let `read` surface the error
            Err(_) => true,
        }
    }

    fn read(&self, buffer: &mut BytesMut) -> AppResult<Option<Frame>> {
        let Some(header) = parse_header(&buffer[..])? else {
            return Ok(None);
        };
        if (buffer.len() as u64) < header.frame_size() {
            return Ok(None);
        }
        if !header.fin {
            return Err(AppError::UnsupportedFrame(
                "fragmented websocket messages".into(),
            ));
        }
        let opcode = OpCode::try_from(header.opcode)?;
        let kind = match opcode {
            OpCode::Text => Payload::Text,
            OpCode::Binary => Payload::Binary,
            OpCode::Close => Payload::Close,
            OpCode::Continuation | OpCode::Ping | OpCode::Pong => {
                return Err(AppError::UnsupportedFrame(format!(
                    "websocket {:?} frames",
                    opcode
                )));
            }
        };

        buffer.advance(header.length_size);
        let mask = if header.masked {
            let mut key = [0u8; 4];
            buffer.copy_to_slice(&mut key);
            Some(key)
        } else {
            None
        };
        let mut payload = buffer.split_to(header.payload_len as usize);
        if let Some(mask) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= mask[i % 4];
            }
        }

        if header.reserved != 0 {
            warn!(
                "dropping websocket frame with reserved bits {:#06b}",
                header.reserved >> 4
            );
            return Ok(None);
        }

        let frame = match kind {
            Payload::Text => {
                let text = String::from_utf8(payload.to_vec()).map_err(|e| {
                    AppError::MalformedProtocol(format!("websocket text is not utf-8: {}", e))
                })?;
                Frame::Text(text)
            }
            Payload::Binary => Frame::Binary(payload.freeze()),
            Payload::Close => Frame::Close,
        };
        Ok(Some(frame))
    }
}

/// Server-to-client frames are never masked.
#[derive(Debug, Clone, Default)]
pub struct WebSocketWriter;

impl WebSocketWriter {
    fn put_length(buffer: &mut BytesMut, length: usize) {
        if length <= 125 {
            buffer.put_u8(length as u8);
        } else if length <= u16::MAX as usize {
            buffer.put_u8(126);
            buffer.put_u16(length as u16);
        } else {
            buffer.put_u8(127);
            buffer.put_u64(length as u64);
        }
    }
}

impl FrameWriter for WebSocketWriter {
    fn write(&self, frame: &Frame, buffer: &mut BytesMut) -> AppResult<()> {
        match frame {
            Frame::Close => {
                buffer.put_u8(FIN_BIT | 0x8);
                buffer.put_u8(0);
            }
            Frame::Text(text) => {
                buffer.reserve(text.len() + 10);
                buffer.put_u8(FIN_BIT | 0x1);
                Self::put_length(buffer, text.len());
                buffer.put_slice(text.as_bytes());
            }
            Frame::Binary(_) => {
                return Err(AppError::UnsupportedFrame(
                    "writing binary websocket frames".into(),
                ))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(5)]
    #[case(125)]
    #[case(126)]
    #[case(65535)]
    #[case(65536)]
    fn test_text_round_trip(#[case] size: usize) {
        let text = "hello".repeat(size / 5 + 1)[..size].to_string();
        let mut buffer = BytesMut::new();
        WebSocketWriter
            .write(&Frame::Text(text.clone()), &mut buffer)
            .unwrap();

        let expected_header = match size {
            0..=125 => 2,
            126..=65535 => 4,
            _ => 10,
        };
        assert_eq!(buffer.len(), expected_header + size);

        assert!(WebSocketReader.is_ready(&buffer));
        let frame = WebSocketReader.read(&mut buffer).unwrap();
        assert_eq!(frame, Some(Frame::Text(text)));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_masked_text() {
        // single-frame masked "Hello" from RFC 6455 section 5.7
        let mut buffer = BytesMut::from(
            &[
                0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
            ][..],
        );
        let frame = WebSocketReader.read(&mut buffer).unwrap();
        assert_eq!(frame, Some(Frame::text("Hello")));
    }

    #[test]
    fn test_partial_frame_not_consumed() {
        let mut encoded = BytesMut::new();
        WebSocketWriter
            .write(&Frame::text("x".repeat(300)), &mut encoded)
            .unwrap();

        let mut buffer = BytesMut::new();
        for (i, byte) in encoded[..encoded.len() - 1].iter().enumerate() {
            buffer.put_u8(*byte);
            assert!(!WebSocketReader.is_ready(&buffer));
            assert_eq!(WebSocketReader.read(&mut buffer).unwrap(), None);
            assert_eq!(buffer.len(), i + 1);
        }

        buffer.put_u8(encoded[encoded.len() - 1]);
        assert!(WebSocketReader.is_ready(&buffer));
        let frame = WebSocketReader.read(&mut buffer).unwrap();
        assert_eq!(frame, Some(Frame::text("x".repeat(300))));
    }

    #[test]
    fn test_close_frame() {
        let mut buffer = BytesMut::new();
        WebSocketWriter.write(&Frame::Close, &mut buffer).unwrap();
        assert_eq!(&buffer[..], &[0x88, 0x00]);
        assert_eq!(WebSocketReader.read(&mut buffer).unwrap(), Some(Frame::Close));
    }

    #[test]
    fn test_binary_read_but_not_written() {
        let mut buffer = BytesMut::from(&[0x82, 0x02, 0xde, 0xad][..]);
        assert_eq!(
            WebSocketReader.read(&mut buffer).unwrap(),
            Some(Frame::Binary(bytes::Bytes::from_static(&[0xde, 0xad])))
        );

        let frame = Frame::Binary(bytes::Bytes::from_static(b"x"));
        assert!(matches!(
            WebSocketWriter.write(&frame, &mut buffer),
            Err(AppError::UnsupportedFrame(_))
        ));
    }

    #[rstest]
    #[case::fragment(&[0x01, 0x00])]
    #[case::continuation(&[0x80, 0x00])]
    #[case::ping(&[0x89, 0x00])]
    #[case::pong(&[0x8A, 0x00])]
    #[case::masked_ping(&[0x89, 0x81, 0x01, 0x02, 0x03, 0x04, 0x60])]
    fn test_unsupported(#[case] bytes: &[u8]) {
        let mut buffer = BytesMut::from(bytes);
        assert!(WebSocketReader.is_ready(&buffer));
        assert!(matches!(
            WebSocketReader.read(&mut buffer),
            Err(AppError::UnsupportedFrame(_))
        ));
    }

    #[test]
    fn test_reserved_bits_dropped() {
        let mut buffer = BytesMut::from(&[0xC1, 0x02, b'h', b'i', 0x81, 0x01, b'!'][..]);
        assert_eq!(WebSocketReader.read(&mut buffer).unwrap(), None);
        assert_eq!(
            WebSocketReader.read(&mut buffer).unwrap(),
            Some(Frame::text("!"))
        );
    }

    #[test]
    fn test_oversized_payload() {
        let mut buffer = BytesMut::new();
        buffer.put_u8(0x81);
        buffer.put_u8(127);
        buffer.put_u64(MAX_PAYLOAD_SIZE + 1);

        assert!(WebSocketReader.is_ready(&buffer));
        assert!(matches!(
            WebSocketReader.read(&mut buffer),
            Err(AppError::FrameTooLarge(len)) if len == MAX_PAYLOAD_SIZE + 1
        ));
    }
}
