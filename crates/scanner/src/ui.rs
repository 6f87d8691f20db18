//! Terminal progress: a single updating counter line plus out-of-band
//! vulnerability notices.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};

use colored::Colorize;

pub struct Progress {
    label: String,
    total: usize,
    done: AtomicUsize,
    vulnerable: AtomicUsize,
}

impl Progress {
    pub fn new(total: usize, label: &str) -> Self {
        Self {
            label: label.to_string(),
            total,
            done: AtomicUsize::new(0),
            vulnerable: AtomicUsize::new(0),
        }
    }

    /// Advances on every completed task regardless of outcome.
    pub fn inc(&self) {
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        self.draw(done);
    }

    pub fn add_vulnerable(&self) {
        self.vulnerable.fetch_add(1, Ordering::SeqCst);
    }

    pub fn done(&self) -> usize {
        self.done.load(Ordering::SeqCst)
    }

    pub fn vulnerable(&self) -> usize {
        self.vulnerable.load(Ordering::SeqCst)
    }

    /// Prints a message above the counter line.
    pub fn message(&self, msg: &str) {
        println!("\r\x1b[2K{msg}");
        self.draw(self.done());
    }

    pub fn finish(&self) {
        self.draw(self.done());
        println!();
    }

    fn draw(&self, done: usize) {
        let vulnerable = self.vulnerable.load(Ordering::SeqCst);
        print!(
            "\r{} [{}/{}] vulnerable: {}",
            self.label.bright_blue(),
            done,
            self.total,
            vulnerable.to_string().bright_red()
        );
        let _ = std::io::stdout().flush();
    }
}

/// One-line vulnerability notice for a finished contract.
pub fn format_vuln_message(address: &str, vuln_types: &[String]) -> String {
    let mut shown: Vec<String> = vuln_types.iter().take(3).cloned().collect();
    if vuln_types.len() > 3 {
        shown.push(format!("... (+{})", vuln_types.len() - 3));
    }
    format!(
        "{} {} -> {}",
        "⚠".bright_yellow(),
        address,
        shown.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let progress = Progress::new(5, "scan");
        progress.inc();
        progress.inc();
        progress.add_vulnerable();
        assert_eq!(progress.done(), 2);
        assert_eq!(progress.vulnerable(), 1);
    }

    #[test]
    fn test_vuln_message_truncates_types() {
        let types: Vec<String> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let msg = format_vuln_message("0xabc", &types);
        assert!(msg.contains("(+2)"));
        assert!(!msg.contains("d,"));
    }
}
