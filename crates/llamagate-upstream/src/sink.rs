use std::ops::ControlFlow;

use async_trait::async_trait;

use crate::sse::Fragment;

/// Receives fragments in arrival order while an upstream body is read.
///
/// Returning [`ControlFlow::Break`] stops the exchange; the upstream
/// connection is dropped without reading the rest of the body.
#[async_trait]
pub trait FragmentSink: Send {
    async fn on_fragment(&mut self, fragment: Fragment) -> ControlFlow<()>;
}

/// Total data a [`CollectSink`] holds before it stops the exchange.
pub const MAX_COLLECTED_BYTES: usize = 20 * 1024 * 1024;

/// Buffers every fragment. Used for non-streaming forwards.
#[derive(Debug)]
pub struct CollectSink {
    pub fragments: Vec<Fragment>,
    bytes: usize,
    limit: usize,
    overflowed: bool,
}

impl Default for CollectSink {
    fn default() -> Self {
        Self::with_limit(MAX_COLLECTED_BYTES)
    }
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            fragments: Vec::new(),
            bytes: 0,
            limit,
            overflowed: false,
        }
    }

    /// Whether the exchange was stopped because the limit was reached.
    /// What was collected is then incomplete.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Data fragments only, in order.
    pub fn data(&self) -> impl Iterator<Item = &str> {
        self.fragments.iter().filter_map(|f| match f {
            Fragment::Data(text) => Some(text.as_str()),
            Fragment::Done => None,
        })
    }
}

#[async_trait]
impl FragmentSink for CollectSink {
    async fn on_fragment(&mut self, fragment: Fragment) -> ControlFlow<()> {
        if let Fragment::Data(text) = &fragment {
            self.bytes += text.len();
            if self.bytes > self.limit {
                self.overflowed = true;
                return ControlFlow::Break(());
            }
        }
        self.fragments.push(fragment);
        ControlFlow::Continue(())
    }
}
