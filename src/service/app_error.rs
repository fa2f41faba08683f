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

use std::io::ErrorKind;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// marker error, more bytes are needed
    #[error("incomplete frame")]
    Incomplete,

    /// protocol configuration errors
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("duplicate protocol name: {0}")]
    DuplicateProtocol(String),

    /// malformed frame errors, fatal to the connection
    #[error("malformed protocol: {0}")]
    MalformedProtocol(String),

    #[error("unsupported frame: {0}")]
    UnsupportedFrame(String),

    #[error("frame of length {0} is too large")]
    FrameTooLarge(u64),

    #[error("no Sec-WebSocket-Key header in handshake request")]
    MissingWebSocketKey,

    /// deadline violations, only ever seen by the watchdogs
    #[error("task {0} cancelled")]
    TaskCancelled(u64),

    #[error("request processing exceeded {0}s")]
    RequestTimeout(u64),

    #[error("task panicked: {0}")]
    TaskPanicked(String),

    /// shutdown idempotency violation
    #[error("connection {0} already shut down")]
    AlreadyShutdown(String),
}

impl AppError {
    /// Whether the error is the peer going away rather than a real failure.
    pub fn is_disconnect(&self) -> bool {
        match self {
            AppError::IoError(e) => matches!(
                e.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
                    | ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_disconnect_classification() {
        let reset: AppError = io::Error::new(ErrorKind::ConnectionReset, "reset").into();
        assert!(reset.is_disconnect());

        let eof: AppError = io::Error::new(ErrorKind::UnexpectedEof, "eof").into();
        assert!(eof.is_disconnect());

        let other: AppError = io::Error::new(ErrorKind::PermissionDenied, "denied").into();
        assert!(!other.is_disconnect());

        assert!(!AppError::FrameTooLarge(2_000_000).is_disconnect());
    }
}
