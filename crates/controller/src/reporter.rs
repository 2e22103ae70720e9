//! Bounded LIFO error reporting with rate-limited status notifications.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

use crate::Error;

/// Depth of the LIFO error buffer; the oldest entry is evicted when full.
pub const ERROR_STACK_SIZE: usize = 10;

/// Characters retained at each end of a long message.
const TRIM_AFFIX_LEN: usize = 120;

/// Run-the-first-K-then-one-per-interval limiter, after Go's
/// `rate.Sometimes`. Status updates must not stampede when a broken
/// pipeline fails on every single delta.
struct Sometimes {
    first: u32,
    interval: Duration,
    count: u32,
    last: Option<Instant>,
}

impl Sometimes {
    fn new(first: u32, interval: Duration) -> Self {
        Self { first, interval, count: 0, last: None }
    }

    fn allow(&mut self) -> bool {
        let now = Instant::now();
        if self.count < self.first {
            self.count += 1;
            self.last = Some(now);
            return true;
        }
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

fn default_limiter() -> Sometimes {
    // first 3 errors notify immediately, then one per 2 seconds
    Sometimes::new(3, Duration::from_secs(2))
}

/// Read-only health view shared with whoever supervises the controller.
#[derive(Debug, Clone)]
pub struct Health(Arc<AtomicBool>);

impl Health {
    pub fn is_healthy(&self) -> bool {
        !self.0.load(Ordering::Relaxed)
    }
}

/// LIFO stack of the most recent controller errors. The top entry is the
/// current status; a critical error latches the controller unhealthy.
pub struct ErrorReporter {
    stack: Vec<Error>,
    limiter: Sometimes,
    status_tx: Option<mpsc::UnboundedSender<String>>,
    critical: Arc<AtomicBool>,
}

impl ErrorReporter {
    pub fn new(status_tx: Option<mpsc::UnboundedSender<String>>) -> Self {
        Self {
            stack: Vec::new(),
            limiter: default_limiter(),
            status_tx,
            critical: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn health(&self) -> Health {
        Health(Arc::clone(&self.critical))
    }

    pub fn push(&mut self, err: Error) {
        warn!(error = %err, "controller error");
        self.push_inner(err);
    }

    /// Push and latch the critical flag; the controller stays unhealthy.
    pub fn push_critical(&mut self, err: Error) {
        warn!(error = %err, "critical controller error");
        self.critical.store(true, Ordering::Relaxed);
        self.push_inner(err);
    }

    fn push_inner(&mut self, err: Error) {
        let notification = trim(&err.to_string());
        if self.stack.len() == ERROR_STACK_SIZE {
            // eviction of the oldest entry is expected, not a fault
            self.stack.remove(0);
        }
        self.stack.push(err);

        if self.limiter.allow() {
            if let Some(tx) = &self.status_tx {
                let _ = tx.send(notification);
            }
        }
    }

    pub fn pop(&mut self) -> Option<Error> {
        self.stack.pop()
    }

    pub fn top(&self) -> Option<&Error> {
        self.stack.last()
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn is_critical(&self) -> bool {
        self.critical.load(Ordering::Relaxed)
    }

    /// Trimmed renderings, oldest first.
    pub fn report(&self) -> Vec<String> {
        self.stack.iter().map(|e| trim(&e.to_string())).collect()
    }
}

/// Abbreviate long messages with a middle ellipsis: 120 leading chars,
/// `[...]`, 120 trailing chars.
fn trim(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= 2 * TRIM_AFFIX_LEN + 5 {
        return s.to_string();
    }
    let mut out: String = chars[..TRIM_AFFIX_LEN].iter().collect();
    out.push_str("[...]");
    out.extend(&chars[chars.len() - TRIM_AFFIX_LEN..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_passes_short_strings_through() {
        let s = "x".repeat(245);
        assert_eq!(trim(&s), s);
    }

    #[test]
    fn trim_abbreviates_long_strings() {
        let s = format!("{}{}{}", "a".repeat(120), "m".repeat(100), "z".repeat(120));
        let t = trim(&s);
        assert_eq!(t.chars().count(), 245);
        assert!(t.starts_with(&"a".repeat(120)));
        assert!(t.contains("[...]"));
        assert!(t.ends_with(&"z".repeat(120)));
    }

    #[test]
    fn stack_is_bounded_lifo() {
        let mut reporter = ErrorReporter::new(None);
        for i in 0..15 {
            reporter.push(Error::Config(format!("e{i}")));
        }
        assert_eq!(reporter.len(), ERROR_STACK_SIZE);
        assert!(reporter.top().unwrap().to_string().contains("e14"));
        // the oldest entries were evicted
        assert!(reporter.report()[0].contains("e5"));

        reporter.pop();
        assert!(reporter.top().unwrap().to_string().contains("e13"));
    }

    #[test]
    fn critical_latches() {
        let mut reporter = ErrorReporter::new(None);
        let health = reporter.health();
        assert!(health.is_healthy());
        reporter.push(Error::Config("benign".into()));
        assert!(health.is_healthy());
        reporter.push_critical(Error::Critical("watch lost".into()));
        assert!(!health.is_healthy());
        assert!(reporter.is_critical());
    }

    #[tokio::test(start_paused = true)]
    async fn notifications_are_rate_limited() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut reporter = ErrorReporter::new(Some(tx));

        // first 3 notify immediately
        for i in 0..5 {
            reporter.push(Error::Config(format!("e{i}")));
        }
        let mut seen = 0;
        while rx.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 3);

        // one more slips through per interval
        tokio::time::advance(Duration::from_secs(2)).await;
        reporter.push(Error::Config("later".into()));
        reporter.push(Error::Config("suppressed".into()));
        let mut seen = 0;
        while rx.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 1);
    }
}
