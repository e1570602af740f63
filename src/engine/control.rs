use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// Why a run stopped before its schedule finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    /// An abort-on-fail threshold was breached.
    ThresholdBreach { metric: String, expression: String },
    /// Ctrl-C or an embedding application asked to stop.
    OperatorStop,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::ThresholdBreach { metric, expression } => {
                write!(f, "threshold breached: {} {}", metric, expression)
            }
            AbortReason::OperatorStop => write!(f, "stopped by operator"),
        }
    }
}

/// Process-wide abort flag shared by every scenario.
///
/// Aborting cancels the root token, which every clock, executor and VU
/// observes at its next suspension point.
pub struct ControlState {
    token: CancellationToken,
    aborted: AtomicBool,
    reason: Mutex<Option<AbortReason>>,
}

impl ControlState {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            aborted: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }

    /// Flip the abort flag. Only the first call has an effect; it returns `true`.
    pub fn abort(&self, reason: AbortReason) -> bool {
        if self
            .aborted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        tracing::warn!(%reason, "aborting run");
        *self.reason.lock() = Some(reason);
        self.token.cancel();
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.reason.lock().clone()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_is_idempotent() {
        let state = ControlState::new();
        assert!(!state.is_aborted());
        assert!(state.abort(AbortReason::ThresholdBreach {
            metric: "http_req_duration".to_string(),
            expression: "p(95)<500".to_string(),
        }));
        assert!(!state.abort(AbortReason::OperatorStop));
        assert!(state.is_aborted());
        assert!(state.token().is_cancelled());
        // The first reason wins.
        assert!(matches!(
            state.reason(),
            Some(AbortReason::ThresholdBreach { .. })
        ));
    }

    #[test]
    fn test_abort_from_many_threads_wins_once() {
        let state = std::sync::Arc::new(ControlState::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = state.clone();
                std::thread::spawn(move || s.abort(AbortReason::OperatorStop))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_reason_display() {
        let reason = AbortReason::ThresholdBreach {
            metric: "http_req_failed".to_string(),
            expression: "rate<0.01".to_string(),
        };
        assert_eq!(reason.to_string(), "threshold breached: http_req_failed rate<0.01");
        assert_eq!(AbortReason::OperatorStop.to_string(), "stopped by operator");
    }
}
