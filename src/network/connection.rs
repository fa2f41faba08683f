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

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use chrono::{DateTime, Local};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::{Comm, Frame};
use crate::service::ConnectionConfig;
use crate::utils::WatchedConnection;
use crate::{AppError, AppResult};

/// When a scheduled protocol switch happens relative to the response of the
/// request that scheduled it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchTiming {
    BeforeResponse,
    AfterResponse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchInstruction {
    pub protocol: String,
    pub timing: SwitchTiming,
}

/// Lets application code ask for its own connection to be closed.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn request(&self) {
        self.token.cancel();
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Everything a handler gets to see about its connection.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    id: u64,
    name: String,
    peer: Option<SocketAddr>,
    created_at: DateTime<Local>,
    comm: Arc<Comm>,
    shutdown: ShutdownHandle,
    pending_switch: Arc<parking_lot::Mutex<Option<SwitchInstruction>>>,
}

impl ConnectionContext {
    pub fn new(id: u64, peer: Option<SocketAddr>, comm: Arc<Comm>) -> Self {
        ConnectionContext {
            id,
            name: comm.name().to_string(),
            peer,
            created_at: Local::now(),
            comm,
            shutdown: ShutdownHandle::default(),
            pending_switch: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }

    pub fn comm(&self) -> &Arc<Comm> {
        &self.comm
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.request();
    }

    /// Switches protocol around the response of the current request.
    /// Only one switch can be pending; a later call replaces it.
    pub fn schedule_switch(&self, protocol: impl Into<String>, timing: SwitchTiming) {
        let instruction = SwitchInstruction {
            protocol: protocol.into(),
            timing,
        };
        if let Some(replaced) = self.pending_switch.lock().replace(instruction) {
            trace!("{} replaced pending switch to {}", self.name, replaced.protocol);
        }
    }

    pub fn pending_switch(&self) -> Option<SwitchInstruction> {
        self.pending_switch.lock().clone()
    }

    fn clear_switch(&self) {
        self.pending_switch.lock().take();
    }
}

/// Application callbacks for one connection. Whatever frame a callback
/// returns is sent back on the connection.
pub trait Handler: Send + Sync + 'static {
    fn on_init(
        &self,
        _ctx: &ConnectionContext,
    ) -> impl Future<Output = AppResult<Option<Frame>>> + Send {
        async { Ok(None) }
    }

    fn on_request(
        &self,
        ctx: &ConnectionContext,
        frame: Frame,
    ) -> impl Future<Output = AppResult<Option<Frame>>> + Send;

    /// Runs once, whoever initiated the shutdown.
    fn on_shutdown(
        &self,
        _ctx: &ConnectionContext,
    ) -> impl Future<Output = AppResult<Option<Frame>>> + Send {
        async { Ok(None) }
    }
}

/// Builds one handler per accepted connection.
pub trait HandlerFactory: Send + Sync + 'static {
    type Handler: Handler;

    fn create(&self, ctx: &ConnectionContext) -> Self::Handler;
}

impl<F, H> HandlerFactory for F
where
    F: Fn(&ConnectionContext) -> H + Send + Sync + 'static,
    H: Handler,
{
    type Handler = H;

    fn create(&self, ctx: &ConnectionContext) -> H {
        self(ctx)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionTimeouts {
    pub idle: Duration,
    pub request: Duration,
    /// Bound on `on_shutdown` plus the farewell send.
    pub shutdown: Duration,
}

impl From<&ConnectionConfig> for ConnectionTimeouts {
    fn from(config: &ConnectionConfig) -> Self {
        ConnectionTimeouts {
            idle: Duration::from_secs(config.idle_timeout),
            request: Duration::from_secs(config.request_timeout),
            shutdown: Duration::from_secs(config.shutdown_timeout),
        }
    }
}

/// One accepted connection: its context, its handler and the request loop
/// that ties them to the socket.
pub struct Connection<H> {
    context: ConnectionContext,
    handler: H,
    timeouts: ConnectionTimeouts,
    shut_down: AtomicBool,
}

impl<H: Handler> Connection<H> {
    pub fn new(context: ConnectionContext, handler: H, timeouts: ConnectionTimeouts) -> Arc<Self> {
        Arc::new(Connection {
            context,
            handler,
            timeouts,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    pub fn is_shutdown(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Sends a handler response, applying any pending protocol switch on the
    /// side of the response it was scheduled for.
    pub async fn respond(&self, response: Option<Frame>) -> AppResult<()> {
        let comm = self.context.comm();
        match self.context.pending_switch() {
            Some(SwitchInstruction {
                protocol,
                timing: SwitchTiming::BeforeResponse,
            }) => {
                comm.switch_protocol(&protocol).await?;
                self.context.clear_switch();
                if let Some(frame) = response {
                    comm.send(frame).await?;
                }
            }
            Some(SwitchInstruction {
                protocol,
                timing: SwitchTiming::AfterResponse,
            }) => {
                if let Some(frame) = response {
                    comm.send(frame).await?;
                }
                comm.switch_protocol(&protocol).await?;
                self.context.clear_switch();
            }
            None => {
                if let Some(frame) = response {
                    comm.send(frame).await?;
                }
            }
        }
        Ok(())
    }

    /// Closes the connection. A second call fails with `AlreadyShutdown`;
    /// the socket is closed exactly once.
    ///
    /// `on_shutdown` and its farewell frame get `timeouts.shutdown` between
    /// them, then the socket is closed whether or not they finished. If this
    /// future is dropped half way, pending sends are aborted and the driver
    /// closes the socket on its way out.
    pub async fn shutdown(&self) -> AppResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Err(AppError::AlreadyShutdown(self.context.name().to_string()));
        }
        self.context.request_shutdown();
        debug!("shutting down connection {}", self.context.name());

        let comm = self.context.comm();
        let _closing = comm.close_guard();
        match time::timeout(self.timeouts.shutdown, self.farewell()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} farewell failed: {}", self.context.name(), e),
            Err(_) => warn!("{} farewell timed out", self.context.name()),
        }

        match comm.close().await {
            Ok(_) => Ok(()),
            Err(e) if e.is_disconnect() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn farewell(&self) -> AppResult<()> {
        let Some(frame) = self.handler.on_shutdown(&self.context).await? else {
            return Ok(());
        };
        match self.context.comm().send(frame).await {
            Err(e) if e.is_disconnect() => Ok(()),
            other => other,
        }
    }

    /// Request loop of the connection. Returns once the peer hangs up, a
    /// shutdown is requested, or a codec/handler error ends the connection.
    /// The connection is shut down on the way out unless that already
    /// happened.
    pub async fn run<R>(self: Arc<Self>, source: R, read_buffer_size: usize) -> AppResult<()>
    where
        R: AsyncRead + Send + Unpin,
    {
        let result = match self.drive(source, read_buffer_size).await {
            Err(e) if e.is_disconnect() => {
                debug!("{} disconnected: {}", self.context.name(), e);
                Ok(())
            }
            other => other,
        };

        if !self.is_shutdown() {
            match self.shutdown().await {
                Ok(()) | Err(AppError::AlreadyShutdown(_)) => {}
                Err(e) => error!("{} shutdown failed: {}", self.context.name(), e),
            }
        } else if self.context.comm().is_closing() {
            // a shutdown elsewhere gave up before closing the socket
            if let Err(e) = self.context.comm().close().await {
                if !e.is_disconnect() {
                    error!("{} close failed: {}", self.context.name(), e);
                }
            }
        }
        result
    }

    async fn drive<R>(&self, mut source: R, read_buffer_size: usize) -> AppResult<()>
    where
        R: AsyncRead + Send + Unpin,
    {
        let comm = self.context.comm().clone();
        let token = self.context.shutdown.token.clone();

        let greeting = self.handler.on_init(&self.context).await?;
        self.respond(greeting).await?;

        let mut chunk = BytesMut::with_capacity(read_buffer_size.max(1));
        loop {
            while comm.can_read().await {
                if token.is_cancelled() {
                    return Ok(());
                }
                if let Some(frame) = comm.receive().await? {
                    self.handle_frame(frame).await?;
                }
            }

            chunk.clear();
            let read = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                read = source.read_buf(&mut chunk) => read?,
            };
            if read == 0 {
                debug!("{} closed by peer", self.context.name());
                return Ok(());
            }
            comm.feed(&chunk[..read]).await;
        }
    }

    async fn handle_frame(&self, frame: Frame) -> AppResult<()> {
        let started = Instant::now();
        let request = self.handler.on_request(&self.context, frame);
        let response = match time::timeout(self.timeouts.request, request).await {
            Ok(response) => response?,
            Err(_) => {
                let e = AppError::RequestTimeout(self.timeouts.request.as_secs());
                warn!("{} dropped response: {}", self.context.name(), e);
                return Ok(());
            }
        };
        trace!(
            "{} handled request in {:?}",
            self.context.name(),
            started.elapsed()
        );
        self.respond(response).await
    }
}

impl<H: Handler> WatchedConnection for Connection<H> {
    fn name(&self) -> &str {
        self.context.name()
    }

    fn idle_timeout(&self) -> Duration {
        self.timeouts.idle
    }

    fn idle_for(&self, now: Instant) -> Duration {
        self.context.comm().idle_for(now)
    }

    fn is_shut_down(&self) -> bool {
        self.is_shutdown()
    }

    fn shutdown_task(self: Arc<Self>) -> Pin<Box<dyn Future<Output = AppResult<()>> + Send>> {
        Box::pin(async move { self.shutdown().await })
    }
}
