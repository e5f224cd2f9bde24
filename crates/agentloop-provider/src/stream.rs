use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use agentloop_types::{Content, FunctionCall, InlineData, Part};

use crate::ProviderError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StreamChunk {
    /// Incremental visible text.
    TextDelta(String),
    /// Incremental reasoning text.
    ThoughtDelta(String),
    /// A fully assembled function call.
    FunctionCall(FunctionCall),
    InlineData(InlineData),
    Usage(StreamUsage),
    Done,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// Folds stream chunks into a single model message.
///
/// Adjacent text deltas are merged into one text part, likewise for thought
/// deltas. Any other chunk closes the currently open part.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    parts: Vec<Part>,
    usage: Option<StreamUsage>,
    done: bool,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: StreamChunk) {
        match chunk {
            StreamChunk::TextDelta(delta) => {
                if let Some(Part::Text { text }) = self.parts.last_mut() {
                    text.push_str(&delta);
                } else if !delta.is_empty() {
                    self.parts.push(Part::Text { text: delta });
                }
            }
            StreamChunk::ThoughtDelta(delta) => {
                if let Some(Part::Thought { text }) = self.parts.last_mut() {
                    text.push_str(&delta);
                } else if !delta.is_empty() {
                    self.parts.push(Part::Thought { text: delta });
                }
            }
            StreamChunk::FunctionCall(call) => self.parts.push(Part::FunctionCall(call)),
            StreamChunk::InlineData(data) => self.parts.push(Part::InlineData(data)),
            StreamChunk::Usage(usage) => self.usage = Some(usage),
            StreamChunk::Done => self.done = true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn usage(&self) -> Option<&StreamUsage> {
        self.usage.as_ref()
    }

    /// Snapshot of what has arrived so far.
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn into_content(self) -> Content {
        Content::model(self.parts)
    }
}
