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

//! Demo service: a plain HTTP connection that upgrades to WebSocket and
//! then echoes text frames.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::network::websocket::handshake_response;
use crate::network::{
    ConnectionContext, Frame, Handler, ProtocolFactory, ProtocolRegistry, SwitchTiming,
};
use crate::{AppError, AppResult};

pub const HTTP_PROTOCOL: &str = "http";
pub const WEBSOCKET_PROTOCOL: &str = "ws";

const HEADER_END: &str = "\r\n\r\n";
const BAD_REQUEST: &str = "HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n";

/// Connections start on raw HTTP text and may switch to WebSocket.
pub fn upgrade_echo_registry() -> AppResult<ProtocolRegistry> {
    ProtocolRegistry::new(vec![
        ProtocolFactory::raw_text(HTTP_PROTOCOL),
        ProtocolFactory::websocket(WEBSOCKET_PROTOCOL),
    ])
}

#[derive(Debug, Default)]
pub struct UpgradeEchoHandler {
    /// HTTP request bytes seen so far, until the blank line arrives
    request: parking_lot::Mutex<String>,
    close_sent: AtomicBool,
}

impl UpgradeEchoHandler {
    fn on_http(&self, ctx: &ConnectionContext, text: &str) -> AppResult<Option<Frame>> {
        let (request, trailing) = {
            let mut request = self.request.lock();
            request.push_str(text);
            let Some(end) = request.find(HEADER_END) else {
                return Ok(None);
            };
            let trailing = request.len() - (end + HEADER_END.len());
            (std::mem::take(&mut *request), trailing)
        };

        // a client must wait for the 101 before sending anything else
        if trailing > 0 {
            warn!("{} sent {} bytes after its upgrade request", ctx.name(), trailing);
            ctx.request_shutdown();
            return Ok(Some(Frame::text(BAD_REQUEST)));
        }

        match handshake_response(&request) {
            Ok(response) => {
                info!("{} upgrading to websocket", ctx.name());
                // the 101 reply still goes out as plain HTTP
                ctx.schedule_switch(WEBSOCKET_PROTOCOL, SwitchTiming::AfterResponse);
                Ok(Some(Frame::text(response)))
            }
            Err(AppError::MissingWebSocketKey) => {
                warn!("{} sent a request without Sec-WebSocket-Key", ctx.name());
                ctx.request_shutdown();
                Ok(Some(Frame::text(BAD_REQUEST)))
            }
            Err(e) => Err(e),
        }
    }

    fn on_websocket(&self, ctx: &ConnectionContext, frame: Frame) -> AppResult<Option<Frame>> {
        match frame {
            Frame::Text(text) => Ok(Some(Frame::Text(text))),
            Frame::Binary(bytes) => {
                debug!("{} ignoring {} byte binary frame", ctx.name(), bytes.len());
                Ok(None)
            }
            Frame::Close => {
                ctx.request_shutdown();
                self.close_sent.store(true, Ordering::Release);
                Ok(Some(Frame::Close))
            }
        }
    }
}

impl Handler for UpgradeEchoHandler {
    async fn on_request(&self, ctx: &ConnectionContext, frame: Frame) -> AppResult<Option<Frame>> {
        let protocol = ctx.comm().active_protocol().await;
        if protocol == WEBSOCKET_PROTOCOL {
            return self.on_websocket(ctx, frame);
        }
        match frame.as_text() {
            Some(text) => self.on_http(ctx, text),
            None => Err(AppError::UnsupportedFrame(format!(
                "{} frame on {}",
                frame.kind(),
                protocol
            ))),
        }
    }

    async fn on_shutdown(&self, ctx: &ConnectionContext) -> AppResult<Option<Frame>> {
        let on_websocket = ctx.comm().active_protocol().await == WEBSOCKET_PROTOCOL;
        if on_websocket && !self.close_sent.swap(true, Ordering::AcqRel) {
            return Ok(Some(Frame::Close));
        }
        Ok(None)
    }
}
