//! Rate and concurrency governor.
//!
//! Two coupled primitives gate every model call: a token pacer admitting at
//! most one call per interval, and a dynamically sized in-flight gate. An
//! EWMA of observed call latency tightens both when the upstream slows
//! down and restores the configured baseline once it recovers.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ScanError};

const EWMA_KEEP: f64 = 0.8;
const EWMA_SAMPLE: f64 = 0.2;
const SLOW_THRESHOLD: Duration = Duration::from_secs(25);
const STALL_THRESHOLD: Duration = Duration::from_secs(40);
const GATE_POLL: Duration = Duration::from_millis(20);

struct PacerState {
    interval: Duration,
    next_free: Option<Instant>,
    closed: bool,
}

/// Admits at most one caller per interval. Closing fails further waits.
pub struct RatePacer {
    state: Mutex<PacerState>,
}

impl RatePacer {
    pub fn new(requests_per_minute: u32) -> Self {
        let rpm = requests_per_minute.max(1);
        Self {
            state: Mutex::new(PacerState {
                interval: Duration::from_secs(60) / rpm,
                next_free: None,
                closed: false,
            }),
        }
    }

    /// Reserves the next admission slot, then sleeps until it arrives or
    /// the token is cancelled.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        let wait = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return Err(ScanError::Cancelled);
            }
            let now = Instant::now();
            let reserved = match state.next_free {
                Some(next) if next > now => next,
                _ => now,
            };
            state.next_free = Some(reserved + state.interval);
            reserved.saturating_duration_since(now)
        };
        if wait.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(ScanError::Cancelled),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }

    pub fn set_interval(&self, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.interval = interval;
    }

    pub fn interval(&self) -> Duration {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).interval
    }

    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
    }
}

struct GateState {
    inflight: usize,
    max: usize,
}

/// In-flight cap with a dynamically tunable limit. Blocked acquires poll
/// on a short backoff.
pub struct ConcurrencyGate {
    state: Mutex<GateState>,
}

impl ConcurrencyGate {
    pub fn new(max: usize) -> Self {
        Self {
            state: Mutex::new(GateState {
                inflight: 0,
                max: max.max(1),
            }),
        }
    }

    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<GatePermit<'_>> {
        loop {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.inflight < state.max {
                    state.inflight += 1;
                    return Ok(GatePermit { gate: self });
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ScanError::Cancelled),
                _ = tokio::time::sleep(GATE_POLL) => {}
            }
        }
    }

    pub fn set_max(&self, max: usize) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.max = max.max(1);
    }

    pub fn max(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).max
    }

    pub fn inflight(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).inflight
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.inflight = state.inflight.saturating_sub(1);
    }
}

/// Releases its slot on every exit path.
pub struct GatePermit<'a> {
    gate: &'a ConcurrencyGate,
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// The governor couples the pacer and the gate with latency adaptation.
/// One instance is scoped to a scan run and shared by all workers.
pub struct Governor {
    pacer: RatePacer,
    gate: ConcurrencyGate,
    base_interval: Duration,
    base_concurrency: usize,
    ewma: Mutex<Option<Duration>>,
}

impl Governor {
    pub fn new(requests_per_minute: u32, concurrency: usize) -> Self {
        let rpm = requests_per_minute.max(1);
        let concurrency = concurrency.max(1);
        Self {
            pacer: RatePacer::new(rpm),
            gate: ConcurrencyGate::new(concurrency),
            base_interval: Duration::from_secs(60) / rpm,
            base_concurrency: concurrency,
            ewma: Mutex::new(None),
        }
    }

    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        self.pacer.wait(cancel).await
    }

    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<GatePermit<'_>> {
        self.gate.acquire(cancel).await
    }

    /// Folds a latency sample into the EWMA and retunes both primitives.
    /// Values may oscillate across samples as the EWMA crosses the
    /// thresholds.
    pub fn record_latency(&self, sample: Duration) {
        let ewma = {
            let mut slot = self.ewma.lock().unwrap_or_else(|e| e.into_inner());
            let next = match *slot {
                None => sample,
                Some(prev) => Duration::from_secs_f64(
                    prev.as_secs_f64() * EWMA_KEEP + sample.as_secs_f64() * EWMA_SAMPLE,
                ),
            };
            *slot = Some(next);
            next
        };

        let mut interval = self.base_interval;
        let mut concurrency = self.base_concurrency;
        if ewma > SLOW_THRESHOLD {
            interval = (ewma / 2).max(self.base_interval);
            concurrency = (self.base_concurrency / 2).max(1);
        }
        if ewma > STALL_THRESHOLD {
            concurrency = 1;
        }
        self.pacer.set_interval(interval);
        self.gate.set_max(concurrency);
    }

    pub fn current_interval(&self) -> Duration {
        self.pacer.interval()
    }

    pub fn current_concurrency(&self) -> usize {
        self.gate.max()
    }

    pub fn close(&self) {
        self.pacer.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor() -> Governor {
        // 60 rpm -> 1s base interval, 4 workers.
        Governor::new(60, 4)
    }

    #[test]
    fn test_slow_samples_halve_concurrency_and_stretch_interval() {
        let gov = governor();
        for _ in 0..10 {
            gov.record_latency(Duration::from_secs(30));
        }
        assert!(gov.current_concurrency() <= 2);
        assert!(gov.current_interval() >= Duration::from_secs(14));
    }

    #[test]
    fn test_stalled_samples_pin_concurrency_to_one() {
        let gov = governor();
        for _ in 0..10 {
            gov.record_latency(Duration::from_secs(50));
        }
        assert_eq!(gov.current_concurrency(), 1);
    }

    #[test]
    fn test_fast_samples_restore_baseline() {
        let gov = governor();
        for _ in 0..10 {
            gov.record_latency(Duration::from_secs(30));
        }
        for _ in 0..20 {
            gov.record_latency(Duration::from_secs(1));
        }
        assert_eq!(gov.current_concurrency(), 4);
        assert_eq!(gov.current_interval(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_gate_caps_inflight_and_releases_on_drop() {
        let gate = ConcurrencyGate::new(2);
        let cancel = CancellationToken::new();
        let p1 = gate.acquire(&cancel).await.unwrap();
        let _p2 = gate.acquire(&cancel).await.unwrap();
        assert_eq!(gate.inflight(), 2);

        let blocked =
            tokio::time::timeout(Duration::from_millis(60), gate.acquire(&cancel)).await;
        assert!(blocked.is_err());

        drop(p1);
        let p3 = tokio::time::timeout(Duration::from_millis(200), gate.acquire(&cancel))
            .await
            .expect("slot should free after drop");
        assert!(p3.is_ok());
    }

    #[tokio::test]
    async fn test_blocked_acquire_observes_cancellation() {
        let gate = ConcurrencyGate::new(1);
        let cancel = CancellationToken::new();
        let _held = gate.acquire(&cancel).await.unwrap();
        cancel.cancel();
        let res = gate.acquire(&cancel).await;
        assert!(matches!(res, Err(ScanError::Cancelled)));
    }

    #[tokio::test]
    async fn test_closed_pacer_rejects_waits() {
        let pacer = RatePacer::new(60);
        pacer.close();
        let res = pacer.wait(&CancellationToken::new()).await;
        assert!(matches!(res, Err(ScanError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_spaces_admissions() {
        let pacer = RatePacer::new(60); // 1s interval
        let cancel = CancellationToken::new();
        let start = Instant::now();
        pacer.wait(&cancel).await.unwrap();
        pacer.wait(&cancel).await.unwrap();
        pacer.wait(&cancel).await.unwrap();
        // Third admission lands two intervals after the first.
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
