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

use std::io::{self, ErrorKind};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace};

use super::{Frame, Protocol, ProtocolSet};
use crate::AppResult;

type BoxedSink = Box<dyn AsyncWrite + Send + Unpin>;

struct ReadSide {
    buffer: BytesMut,
    protocol: Arc<Protocol>,
}

struct WriteSide {
    buffer: BytesMut,
    protocol: Arc<Protocol>,
    /// `None` once the connection is closed
    sink: Option<BoxedSink>,
}

/// Send/receive façade of one connection.
///
/// The read side (read buffer + active reader and input filters) and the
/// write side (write buffer, socket + active writer and output filters) sit
/// behind separate locks, so `receive` and `send` never wait on each other.
/// Switching protocol takes both, always read first, and releases write
/// first.
///
/// A socket write that waits on a peer which stopped reading holds the write
/// lock; `close` cancels it before taking the lock, so closing never waits on
/// the peer.
pub struct Comm {
    name: String,
    protocols: ProtocolSet,
    read: Mutex<ReadSide>,
    write: Mutex<WriteSide>,
    closing: CancellationToken,
    last_sent: parking_lot::Mutex<Instant>,
    last_received: parking_lot::Mutex<Instant>,
}

impl Comm {
    pub fn new<S>(name: impl Into<String>, protocols: ProtocolSet, sink: S) -> Comm
    where
        S: AsyncWrite + Send + Unpin + 'static,
    {
        let initial = protocols.initial();
        let now = Instant::now();
        Comm {
            name: name.into(),
            read: Mutex::new(ReadSide {
                buffer: BytesMut::with_capacity(4 * 1024),
                protocol: initial.clone(),
            }),
            write: Mutex::new(WriteSide {
                buffer: BytesMut::with_capacity(4 * 1024),
                protocol: initial,
                sink: Some(Box::new(sink)),
            }),
            protocols,
            closing: CancellationToken::new(),
            last_sent: parking_lot::Mutex::new(now),
            last_received: parking_lot::Mutex::new(now),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends bytes read off the socket to the read buffer.
    pub async fn feed(&self, data: &[u8]) {
        let mut read = self.read.lock().await;
        read.buffer.extend_from_slice(data);
    }

    pub async fn can_read(&self) -> bool {
        let read = self.read.lock().await;
        read.protocol.reader().is_ready(&read.buffer)
    }

    /// Decodes one frame with the active protocol.
    ///
    /// `Ok(None)` when no complete frame is buffered, when the codec consumed
    /// bytes without producing a frame, or when an input filter vetoed it.
    pub async fn receive(&self) -> AppResult<Option<Frame>> {
        let mut read = self.read.lock().await;
        let ReadSide { buffer, protocol } = &mut *read;
        if !protocol.reader().is_ready(buffer) {
            return Ok(None);
        }
        let frame = protocol.reader().read(buffer)?;
        *self.last_received.lock() = Instant::now();
        match frame {
            Some(frame) => {
                trace!("{} received {} frame", self.name, frame.kind());
                protocol.input_filters().run(frame)
            }
            None => Ok(None),
        }
    }

    /// Encodes and flushes one frame with the active protocol.
    ///
    /// The send timestamp moves even when an output filter drops the frame.
    pub async fn send(&self, frame: Frame) -> AppResult<()> {
        let mut write = self.write.lock().await;
        *self.last_sent.lock() = Instant::now();

        let WriteSide {
            buffer,
            protocol,
            sink,
        } = &mut *write;
        let Some(frame) = protocol.output_filters().run(frame)? else {
            trace!("{} output filters dropped frame", self.name);
            return Ok(());
        };
        let Some(sink) = sink.as_mut() else {
            return Err(Self::closed_error());
        };

        let result = match protocol.writer().write(&frame, buffer) {
            Ok(()) => tokio::select! {
                biased;
                _ = self.closing.cancelled() => Err(Self::closed_error()),
                result = Self::flush(sink, buffer) => result,
            },
            Err(e) => Err(e),
        };
        buffer.clear();
        result
    }

    fn closed_error() -> crate::AppError {
        io::Error::new(ErrorKind::NotConnected, "connection closed").into()
    }

    async fn flush(sink: &mut BoxedSink, buffer: &BytesMut) -> AppResult<()> {
        sink.write_all(buffer).await?;
        sink.flush().await?;
        Ok(())
    }

    pub async fn switch_protocol(&self, name: &str) -> AppResult<()> {
        let protocol = self.protocols.get(name)?;
        let mut read = self.read.lock().await;
        let mut write = self.write.lock().await;
        debug!(
            "{} switching protocol {} -> {}",
            self.name,
            read.protocol.name(),
            protocol.name()
        );
        read.protocol = protocol.clone();
        write.protocol = protocol;
        drop(write);
        drop(read);
        Ok(())
    }

    /// Name of the active protocol, observed under both locks.
    pub async fn active_protocol(&self) -> String {
        let read = self.read.lock().await;
        let write = self.write.lock().await;
        debug_assert!(Arc::ptr_eq(&read.protocol, &write.protocol));
        let name = write.protocol.name().to_string();
        drop(write);
        drop(read);
        name
    }

    /// Shuts the socket's write half down. Returns `false` if it already was.
    ///
    /// Aborts a send stuck on the socket first, so the write lock is free.
    pub async fn close(&self) -> AppResult<bool> {
        self.closing.cancel();
        let mut write = self.write.lock().await;
        match write.sink.take() {
            Some(mut sink) => {
                sink.shutdown().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Set once `close` started or a [`Comm::close_guard`] was dropped.
    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Aborts in-flight and later sends when dropped, for callers that may
    /// be cancelled before they get to `close`.
    pub fn close_guard(&self) -> DropGuard {
        self.closing.clone().drop_guard()
    }

    pub fn last_sent(&self) -> Instant {
        *self.last_sent.lock()
    }

    pub fn last_received(&self) -> Instant {
        *self.last_received.lock()
    }

    /// Idle time of the quieter direction.
    pub fn idle_for(&self, now: Instant) -> Duration {
        let sent = now.saturating_duration_since(self.last_sent());
        let received = now.saturating_duration_since(self.last_received());
        sent.max(received)
    }
}

impl std::fmt::Debug for Comm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comm").field("name", &self.name).finish()
    }
}
