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

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use super::websocket::{WebSocketReader, WebSocketWriter};
use super::{
    FilterChain, FrameReader, FrameWriter, LengthPrefixedReader, LengthPrefixedWriter,
    LineReader, LineWriter, RawTextReader, RawTextWriter,
};
use crate::{AppError, AppResult};

/// A named wire format: one codec pair plus the filters around it.
///
/// Immutable once built; a connection swaps whole protocols, never parts.
pub struct Protocol {
    name: String,
    reader: Box<dyn FrameReader>,
    writer: Box<dyn FrameWriter>,
    input: FilterChain,
    output: FilterChain,
}

impl Protocol {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reader(&self) -> &dyn FrameReader {
        self.reader.as_ref()
    }

    pub fn writer(&self) -> &dyn FrameWriter {
        self.writer.as_ref()
    }

    pub fn input_filters(&self) -> &FilterChain {
        &self.input
    }

    pub fn output_filters(&self) -> &FilterChain {
        &self.output
    }
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name)
            .field("input", &self.input)
            .field("output", &self.output)
            .finish()
    }
}

type ReaderConstructor = Arc<dyn Fn() -> Box<dyn FrameReader> + Send + Sync>;
type WriterConstructor = Arc<dyn Fn() -> Box<dyn FrameWriter> + Send + Sync>;

/// Recipe for building one [`Protocol`] per connection.
#[derive(Clone)]
pub struct ProtocolFactory {
    name: String,
    reader: ReaderConstructor,
    writer: WriterConstructor,
    input: FilterChain,
    output: FilterChain,
}

impl ProtocolFactory {
    pub fn new<R, W>(name: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: Fn() -> Box<dyn FrameReader> + Send + Sync + 'static,
        W: Fn() -> Box<dyn FrameWriter> + Send + Sync + 'static,
    {
        ProtocolFactory {
            name: name.into(),
            reader: Arc::new(reader),
            writer: Arc::new(writer),
            input: FilterChain::new(),
            output: FilterChain::new(),
        }
    }

    pub fn websocket(name: impl Into<String>) -> Self {
        ProtocolFactory::new(
            name,
            || Box::new(WebSocketReader),
            || Box::new(WebSocketWriter),
        )
    }

    pub fn line(name: impl Into<String>, max_line_length: usize) -> Self {
        ProtocolFactory::new(
            name,
            move || Box::new(LineReader::new(max_line_length)),
            || Box::new(LineWriter),
        )
    }

    pub fn raw_text(name: impl Into<String>) -> Self {
        ProtocolFactory::new(name, || Box::new(RawTextReader), || Box::new(RawTextWriter))
    }

    pub fn length_prefixed(name: impl Into<String>, max_frame_size: usize) -> Self {
        ProtocolFactory::new(
            name,
            move || Box::new(LengthPrefixedReader::new(max_frame_size)),
            || Box::new(LengthPrefixedWriter),
        )
    }

    pub fn with_input_filters(mut self, input: FilterChain) -> Self {
        self.input = input;
        self
    }

    pub fn with_output_filters(mut self, output: FilterChain) -> Self {
        self.output = output;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn build(&self) -> Protocol {
        Protocol {
            name: self.name.clone(),
            reader: (self.reader)(),
            writer: (self.writer)(),
            input: self.input.clone(),
            output: self.output.clone(),
        }
    }
}

impl fmt::Debug for ProtocolFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolFactory")
            .field("name", &self.name)
            .finish()
    }
}

fn check_unique<'a>(names: impl Iterator<Item = &'a str>) -> AppResult<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(AppError::DuplicateProtocol(name.to_string()));
        }
    }
    Ok(())
}

/// The fixed, ordered list of protocols every connection is built with.
/// The first entry is the one a new connection starts on.
#[derive(Debug, Clone)]
pub struct ProtocolRegistry {
    factories: Vec<ProtocolFactory>,
}

impl ProtocolRegistry {
    pub fn new(factories: Vec<ProtocolFactory>) -> AppResult<Self> {
        if factories.is_empty() {
            return Err(AppError::InvalidValue(
                "at least one protocol is required".into(),
            ));
        }
        check_unique(factories.iter().map(ProtocolFactory::name))?;
        Ok(ProtocolRegistry { factories })
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.iter().map(ProtocolFactory::name).collect()
    }

    pub fn instantiate(&self) -> AppResult<ProtocolSet> {
        let protocols: Vec<Arc<Protocol>> = self
            .factories
            .iter()
            .map(|factory| Arc::new(factory.build()))
            .collect();
        ProtocolSet::new(protocols)
    }
}

/// Protocols of one connection, keyed by name.
#[derive(Debug, Clone)]
pub struct ProtocolSet {
    protocols: HashMap<String, Arc<Protocol>>,
    initial: Arc<Protocol>,
}

impl ProtocolSet {
    pub fn new(protocols: Vec<Arc<Protocol>>) -> AppResult<Self> {
        check_unique(protocols.iter().map(|p| p.name()))?;
        let initial = protocols
            .first()
            .cloned()
            .ok_or_else(|| AppError::InvalidValue("empty protocol set".into()))?;
        let protocols = protocols
            .into_iter()
            .map(|p| (p.name().to_string(), p))
            .collect();
        Ok(ProtocolSet { protocols, initial })
    }

    pub fn initial(&self) -> Arc<Protocol> {
        self.initial.clone()
    }

    pub fn get(&self, name: &str) -> AppResult<Arc<Protocol>> {
        self.protocols
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::UnknownProtocol(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }
}
