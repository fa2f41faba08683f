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

use std::fmt;
use std::sync::Arc;

use super::Frame;
use crate::AppResult;

/// One transform step between wire frames and domain frames.
///
/// Returning `Ok(None)` vetoes the frame: later steps never see it.
pub trait Filter: Send + Sync {
    fn apply(&self, frame: Frame) -> AppResult<Option<Frame>>;
}

impl<F> Filter for F
where
    F: Fn(Frame) -> AppResult<Option<Frame>> + Send + Sync,
{
    fn apply(&self, frame: Frame) -> AppResult<Option<Frame>> {
        self(frame)
    }
}

#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        FilterChain::default()
    }

    pub fn with<F: Filter + 'static>(mut self, filter: F) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn run(&self, frame: Frame) -> AppResult<Option<Frame>> {
        let mut frame = frame;
        for filter in &self.filters {
            match filter.apply(frame)? {
                Some(next) => frame = next,
                None => return Ok(None),
            }
        }
        Ok(Some(frame))
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("filters", &self.filters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::AppError;

    #[test]
    fn test_chain_order() {
        let chain = FilterChain::new()
            .with(|frame: Frame| -> AppResult<Option<Frame>> {
                Ok(frame.as_text().map(|t| Frame::text(format!("{}-a", t))))
            })
            .with(|frame: Frame| -> AppResult<Option<Frame>> {
                Ok(frame.as_text().map(|t| Frame::text(format!("{}-b", t))))
            });
        assert_eq!(
            chain.run(Frame::text("x")).unwrap(),
            Some(Frame::text("x-a-b"))
        );
    }

    #[test]
    fn test_short_circuit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let chain = FilterChain::new()
            .with(|_frame: Frame| -> AppResult<Option<Frame>> { Ok(None) })
            .with(move |frame: Frame| -> AppResult<Option<Frame>> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Some(frame))
            });

        assert_eq!(chain.run(Frame::text("dropped")).unwrap(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_error_propagates() {
        let chain = FilterChain::new()
            .with(|_frame: Frame| -> AppResult<Option<Frame>> {
                Err(AppError::MalformedProtocol("bad".into()))
            });
        assert!(chain.run(Frame::Close).is_err());
        assert!(FilterChain::new().is_empty());
    }
}
