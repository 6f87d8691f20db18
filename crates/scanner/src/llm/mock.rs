//! Canned-response analyzer for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::provider::{Analyzer, LlmError};

pub struct MockAnalyzer {
    replies: Mutex<VecDeque<String>>,
    fallback: String,
    calls: AtomicUsize,
    fail: bool,
}

impl MockAnalyzer {
    pub fn with_reply(reply: &str) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: reply.to_string(),
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }

    /// Replies are consumed in order; the last one repeats.
    pub fn with_replies(replies: &[&str]) -> Self {
        let mut queue: VecDeque<String> = replies.iter().map(|s| s.to_string()).collect();
        let fallback = queue.pop_back().unwrap_or_default();
        Self {
            replies: Mutex::new(queue),
            fallback,
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: String::new(),
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Analyzer for MockAnalyzer {
    async fn analyze(&self, _prompt: &str) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(LlmError::Fatal {
                status: 500,
                message: "mock configured to fail".to_string(),
            });
        }
        let mut queue = self.replies.lock().unwrap_or_else(|e| e.into_inner());
        Ok(queue.pop_front().unwrap_or_else(|| self.fallback.clone()))
    }

    fn name(&self) -> String {
        "mock".to_string()
    }
}
