use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A superseded generation observed its cancellation flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cancelled by a newer generation")]
pub struct Cancelled;

/// Polls a cancellation token every `interval` units of work.
///
/// Long similarity scans call [`CancelProbe::tick`] once per comparison; the
/// token itself is only read at the interval boundary, so cancellation
/// latency is bounded by `interval` comparisons regardless of corpus size.
#[derive(Debug, Clone)]
pub struct CancelProbe {
    token: CancellationToken,
    interval: usize,
    counter: usize,
}

impl CancelProbe {
    pub fn new(token: CancellationToken, interval: usize) -> Self {
        Self {
            token,
            interval: interval.max(1),
            counter: 0,
        }
    }

    /// A probe that is never cancelled, for synchronous callers and tests.
    pub fn never() -> Self {
        Self::new(CancellationToken::new(), usize::MAX)
    }

    /// Records one unit of work.
    pub fn tick(&mut self) -> Result<(), Cancelled> {
        self.step(1)
    }

    /// Records `n` units of work.
    pub fn step(&mut self, n: usize) -> Result<(), Cancelled> {
        self.counter = self.counter.saturating_add(n);
        if self.counter >= self.interval {
            self.counter = 0;
            return self.check();
        }
        Ok(())
    }

    /// Reads the token immediately.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.token.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polls_at_interval() {
        let token = CancellationToken::new();
        let mut probe = CancelProbe::new(token.clone(), 3);
        token.cancel();

        // Not observed until the third unit of work.
        assert!(probe.tick().is_ok());
        assert!(probe.tick().is_ok());
        assert_eq!(probe.tick(), Err(Cancelled));
    }

    #[test]
    fn step_crosses_interval() {
        let token = CancellationToken::new();
        let mut probe = CancelProbe::new(token.clone(), 100);
        assert!(probe.step(99).is_ok());
        token.cancel();
        assert_eq!(probe.step(5), Err(Cancelled));
    }

    #[test]
    fn never_is_never_cancelled() {
        let mut probe = CancelProbe::never();
        for _ in 0..10_000 {
            assert!(probe.tick().is_ok());
        }
    }
}
