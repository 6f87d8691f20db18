//! Multi-key dispatch: a vector of analyzers behind an atomic round-robin
//! index, itself an analyzer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::provider::{Analyzer, LlmError};

pub struct MultiAnalyzer {
    clients: Vec<Arc<dyn Analyzer>>,
    next: AtomicUsize,
}

impl MultiAnalyzer {
    pub fn new(clients: Vec<Arc<dyn Analyzer>>) -> Self {
        Self {
            clients,
            next: AtomicUsize::new(0),
        }
    }

    fn pick(&self) -> Result<&Arc<dyn Analyzer>, LlmError> {
        if self.clients.is_empty() {
            return Err(LlmError::Fatal {
                status: 0,
                message: "no available ai client".to_string(),
            });
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed);
        Ok(&self.clients[idx % self.clients.len()])
    }
}

#[async_trait]
impl Analyzer for MultiAnalyzer {
    async fn analyze(&self, prompt: &str) -> Result<String, LlmError> {
        self.pick()?.analyze(prompt).await
    }

    async fn analyze_json(&self, prompt: &str) -> Result<String, LlmError> {
        self.pick()?.analyze_json(prompt).await
    }

    fn name(&self) -> String {
        match self.clients.first() {
            Some(first) => format!("multi[{}]-{}", self.clients.len(), first.name()),
            None => "multi".to_string(),
        }
    }
}
