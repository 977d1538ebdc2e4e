//! Adaptive loop pacing.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use warmpool_core::LoopDelaySettings;

/// Exponential idle backoff between pool ticks.
///
/// An active tick resets the delay to the minimum; every idle tick
/// multiplies it by the decay factor, capped at the maximum.
#[derive(Debug, Clone)]
pub struct LoopDelay {
    settings: LoopDelaySettings,
    current: Duration,
}

impl LoopDelay {
    pub fn new(settings: LoopDelaySettings) -> Self {
        Self {
            current: settings.min,
            settings,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Delay to sleep after a tick that was `active` or idle.
    pub fn next(&mut self, active: bool) -> Duration {
        if active {
            self.current = self.settings.min;
            return self.current;
        }
        let delay = self.current;
        self.current = self
            .current
            .mul_f64(self.settings.decay)
            .min(self.settings.max);
        delay
    }
}

/// Why [`sleep_or_wake`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    Elapsed,
    Woken,
    Shutdown,
}

/// Sleep for `delay`, checking `wake` every `poll` and returning early when
/// it reports true or shutdown is signalled.
pub async fn sleep_or_wake(
    delay: Duration,
    poll: Duration,
    mut wake: impl FnMut() -> bool,
    shutdown: &mut watch::Receiver<bool>,
) -> WakeReason {
    if *shutdown.borrow() {
        return WakeReason::Shutdown;
    }
    let deadline = Instant::now() + delay;
    let poll = poll.max(Duration::from_millis(1));
    loop {
        let now = Instant::now();
        if now >= deadline {
            return WakeReason::Elapsed;
        }
        let step = (deadline - now).min(poll);
        tokio::select! {
            _ = tokio::time::sleep(step) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return WakeReason::Shutdown;
                }
            }
        }
        if wake() {
            return WakeReason::Woken;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(min: u64, max: u64, decay: f64) -> LoopDelaySettings {
        LoopDelaySettings::new(min, max, decay)
    }

    #[test]
    fn idle_sequence_grows_to_cap() {
        let mut delay = LoopDelay::new(settings(5, 60, 2.0));
        let seq: Vec<u64> = (0..6).map(|_| delay.next(false).as_secs()).collect();
        assert_eq!(seq, vec![5, 10, 20, 40, 60, 60]);
    }

    #[test]
    fn activity_resets_to_min() {
        let mut delay = LoopDelay::new(settings(5, 60, 2.0));
        delay.next(false);
        delay.next(false);
        delay.next(false);
        assert_eq!(delay.next(true), Duration::from_secs(5));
        assert_eq!(delay.next(false), Duration::from_secs(5));
        assert_eq!(delay.next(false), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn elapses_without_wake() {
        let (_tx, mut rx) = watch::channel(false);
        let start = Instant::now();
        let reason = sleep_or_wake(Duration::from_secs(10), Duration::from_secs(1), || false, &mut rx).await;
        assert_eq!(reason, WakeReason::Elapsed);
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn wakes_early_on_condition() {
        let (_tx, mut rx) = watch::channel(false);
        let start = Instant::now();
        let mut polls = 0;
        let reason = sleep_or_wake(
            Duration::from_secs(60),
            Duration::from_secs(1),
            || {
                polls += 1;
                polls == 3
            },
            &mut rx,
        )
        .await;
        assert_eq!(reason, WakeReason::Woken);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts() {
        let (tx, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            sleep_or_wake(Duration::from_secs(600), Duration::from_secs(1), || false, &mut rx).await
        });
        tokio::time::sleep(Duration::from_secs(2)).await;
        tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), WakeReason::Shutdown);
    }
}
