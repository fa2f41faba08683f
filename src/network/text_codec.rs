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

use bytes::{BufMut, BytesMut};

use super::{Frame, FrameReader, FrameWriter};
use crate::{AppError, AppResult};

/// `\n`-terminated UTF-8 lines; a trailing `\r` is dropped.
#[derive(Debug, Clone)]
pub struct LineReader {
    max_line_length: usize,
}

impl LineReader {
    pub fn new(max_line_length: usize) -> Self {
        LineReader { max_line_length }
    }
}

impl FrameReader for LineReader {
    fn is_ready(&self, buffer: &[u8]) -> bool {
        buffer.contains(&b'\n') || buffer.len() > self.max_line_length
    }

    fn read(&self, buffer: &mut BytesMut) -> AppResult<Option<Frame>> {
        let Some(position) = buffer.iter().position(|b| *b == b'\n') else {
            if buffer.len() > self.max_line_length {
                return Err(AppError::FrameTooLarge(buffer.len() as u64));
            }
            return Ok(None);
        };
        let line = buffer.split_to(position + 1);
        let mut line = &line[..position];
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        let text = std::str::from_utf8(line)
            .map_err(|e| AppError::MalformedProtocol(format!("line is not utf-8: {}", e)))?;
        Ok(Some(Frame::text(text)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct LineWriter;

impl FrameWriter for LineWriter {
    fn write(&self, frame: &Frame, buffer: &mut BytesMut) -> AppResult<()> {
        match frame {
            Frame::Text(text) => {
                buffer.reserve(text.len() + 1);
                buffer.put_slice(text.as_bytes());
                buffer.put_u8(b'\n');
                Ok(())
            }
            other => Err(AppError::UnsupportedFrame(format!(
                "line codec cannot write {} frames",
                other.kind()
            ))),
        }
    }
}

/// Everything currently buffered, as one text frame.
///
/// A multi-byte character split across socket reads stays in the buffer
/// until the rest of it arrives.
#[derive(Debug, Clone, Default)]
pub struct RawTextReader;

impl FrameReader for RawTextReader {
    fn is_ready(&self, buffer: &[u8]) -> bool {
        match std::str::from_utf8(buffer) {
            Ok(text) => !text.is_empty(),
            Err(e) if e.error_len().is_none() => e.valid_up_to() > 0,
            Err(_) => true,
        }
    }

    fn read(&self, buffer: &mut BytesMut) -> AppResult<Option<Frame>> {
        let valid = match std::str::from_utf8(&buffer[..]) {
            Ok(text) => text.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(e) => {
                return Err(AppError::MalformedProtocol(format!(
                    "raw text is not utf-8: {}",
                    e
                )))
            }
        };
        if valid == 0 {
            return Ok(None);
        }
        let bytes = buffer.split_to(valid);
        // validated above
        let text = String::from_utf8_lossy(&bytes).into_owned();
        Ok(Some(Frame::Text(text)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RawTextWriter;

impl FrameWriter for RawTextWriter {
    fn write(&self, frame: &Frame, buffer: &mut BytesMut) -> AppResult<()> {
        match frame {
            Frame::Text(text) => buffer.put_slice(text.as_bytes()),
            Frame::Binary(bytes) => buffer.put_slice(bytes),
            Frame::Close => {
                return Err(AppError::UnsupportedFrame(
                    "raw codec cannot write close frames".into(),
                ))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_reader() {
        let reader = LineReader::new(64);
        let mut buffer = BytesMut::from(&b"first\r\nsec"[..]);

        assert!(reader.is_ready(&buffer));
        assert_eq!(reader.read(&mut buffer).unwrap(), Some(Frame::text("first")));
        assert!(!reader.is_ready(&buffer));

        buffer.put_slice(b"ond\n");
        assert_eq!(reader.read(&mut buffer).unwrap(), Some(Frame::text("second")));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_line_too_long() {
        let reader = LineReader::new(4);
        let mut buffer = BytesMut::from(&b"abcdef"[..]);
        assert!(reader.is_ready(&buffer));
        assert!(matches!(
            reader.read(&mut buffer),
            Err(AppError::FrameTooLarge(6))
        ));
    }

    #[test]
    fn test_raw_text_keeps_split_character() {
        let reader = RawTextReader;
        // "é" is 0xC3 0xA9
        let mut buffer = BytesMut::from(&b"caf\xC3"[..]);
        assert!(reader.is_ready(&buffer));
        assert_eq!(reader.read(&mut buffer).unwrap(), Some(Frame::text("caf")));
        assert_eq!(&buffer[..], b"\xC3");
        assert!(!reader.is_ready(&buffer));

        buffer.put_u8(0xA9);
        assert_eq!(reader.read(&mut buffer).unwrap(), Some(Frame::text("é")));
    }

    #[test]
    fn test_writers() {
        let mut buffer = BytesMut::new();
        LineWriter.write(&Frame::text("hi"), &mut buffer).unwrap();
        RawTextWriter.write(&Frame::text("yo"), &mut buffer).unwrap();
        assert_eq!(&buffer[..], b"hi\nyo");
        assert!(LineWriter.write(&Frame::Close, &mut buffer).is_err());
    }
}
