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

//! Network Module Implementation
//!
//! Everything between the raw socket bytes and the application handler.
//!
//! # Architecture
//!
//! - `Frame`, `FrameReader`, `FrameWriter`: the decoded unit and the codec
//!   contract every wire format implements
//! - `FilterChain`: ordered frame transformations that may veto a frame
//! - `Protocol`: a named reader/writer pair plus its input and output chains,
//!   built per connection from a `ProtocolRegistry`
//! - `Comm`: per-connection send/receive with separate read and write locks
//!   and an atomic protocol switch
//! - `Connection`: the request loop driving a `Handler`, including the
//!   before/after-response switch strategy
//! - `websocket`: RFC 6455 framing and the upgrade handshake

pub use comm::Comm;
pub use connection::{
    Connection, ConnectionContext, ConnectionTimeouts, Handler, HandlerFactory, ShutdownHandle,
    SwitchInstruction, SwitchTiming,
};
pub use filter::{Filter, FilterChain};
pub use frame::{Frame, FrameReader, FrameWriter, LengthPrefixedReader, LengthPrefixedWriter};
pub use protocol::{Protocol, ProtocolFactory, ProtocolRegistry, ProtocolSet};
pub use text_codec::{LineReader, LineWriter, RawTextReader, RawTextWriter};

mod comm;
mod connection;
mod filter;
mod frame;
mod protocol;
mod text_codec;
pub mod websocket;
