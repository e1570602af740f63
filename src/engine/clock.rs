use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Monotonic run clock with cancellable sleeps.
///
/// All clocks derived from one another share the same origin, so `now()` is
/// comparable across scenarios. Each clock carries its own cancellation token:
/// a sleep returns `false` as soon as that token (or any parent) is cancelled.
#[derive(Clone, Debug)]
pub struct RunClock {
    origin: Instant,
    token: CancellationToken,
}

impl RunClock {
    pub fn start(token: CancellationToken) -> Self {
        Self {
            origin: Instant::now(),
            token,
        }
    }

    /// Same origin, narrower cancellation scope.
    pub fn child(&self) -> Self {
        Self {
            origin: self.origin,
            token: self.token.child_token(),
        }
    }

    /// Same origin, explicit token (used to hand a VU its own hard-stop token).
    pub fn with_token(&self, token: CancellationToken) -> Self {
        Self {
            origin: self.origin,
            token,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Elapsed run time.
    pub fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    /// Sleep until `at` (run time). Returns `false` if cancelled first.
    pub async fn sleep_until(&self, at: Duration) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        let Some(deadline) = self.origin.checked_add(at) else {
            // Beyond any representable instant: only cancellation ends the wait.
            self.token.cancelled().await;
            return false;
        };
        if deadline <= Instant::now() {
            return true;
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep_until(deadline) => true,
        }
    }

    /// Sleep for `d`. Returns `false` if cancelled first.
    pub async fn sleep_for(&self, d: Duration) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        if d.is_zero() {
            return true;
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(d) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_for_completes() {
        let clock = RunClock::start(CancellationToken::new());
        assert!(clock.sleep_for(Duration::from_secs(5)).await);
        assert!(clock.now() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_until_uses_origin() {
        let clock = RunClock::start(CancellationToken::new());
        assert!(clock.sleep_for(Duration::from_secs(2)).await);
        assert!(clock.sleep_until(Duration::from_secs(3)).await);
        let now = clock.now();
        assert!(now >= Duration::from_secs(3) && now < Duration::from_millis(3100));
        // Deadline in the past returns immediately.
        assert!(clock.sleep_until(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_sleep() {
        let token = CancellationToken::new();
        let clock = RunClock::start(token.clone());
        let sleeper = clock.clone();
        let handle = tokio::spawn(async move { sleeper.sleep_for(Duration::from_secs(3600)).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
        assert!(!handle.await.unwrap());
        assert!(clock.now() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_deadline_waits_for_cancel() {
        let token = CancellationToken::new();
        let clock = RunClock::start(token.clone());
        let sleeper = clock.clone();
        let handle = tokio::spawn(async move { sleeper.sleep_until(Duration::MAX).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
        assert!(!handle.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_cancellation_is_scoped() {
        let root = RunClock::start(CancellationToken::new());
        let child = root.child();
        child.token().cancel();
        assert!(!child.sleep_for(Duration::from_secs(1)).await);
        assert!(root.sleep_for(Duration::from_secs(1)).await);

        let root_token = root.token().clone();
        let other = root.child();
        root_token.cancel();
        assert!(other.is_cancelled());
    }
}
