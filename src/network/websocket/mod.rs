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

//! Server side of RFC 6455, restricted to what the framework supports:
//! unfragmented text, binary and close frames, no extensions, no ping/pong.
//!
//! ```text
//! byte0: FIN | RSV1 RSV2 RSV3 | opcode(4)
//! byte1: MASK | length(7)        126 => u16 follows, 127 => u64 follows
//! [extended length] [mask key, if MASK] payload
//! ```

pub use codec::{OpCode, WebSocketReader, WebSocketWriter, MAX_PAYLOAD_SIZE};
pub use handshake::{accept_key, handshake_response, WEBSOCKET_GUID};

mod codec;
mod handshake;
