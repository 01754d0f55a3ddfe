//! Cooperative cancellation scope
//!
//! A single [`CancelToken`] is rooted in each pipeline invocation and shared
//! with every spawned child process and streaming task. Signals map onto the
//! token: the first SIGINT/SIGTERM cancels the scope so children can be torn
//! down gracefully, a second signal exits immediately.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Cloneable cancellation handle. Clones share one flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of everything holding this token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Outcome of one received signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal: cancel the scope, let children wind down
    Cancel,
    /// Second signal: exit now
    ExitImmediately,
    /// Third and later: ignore
    Ignore,
}

/// Tracks how many interrupt signals arrived.
#[derive(Debug, Default)]
pub struct SignalState {
    count: AtomicU8,
}

impl SignalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_signal(&self, token: &CancelToken) -> SignalAction {
        match self.count.fetch_add(1, Ordering::SeqCst) {
            0 => {
                token.cancel();
                SignalAction::Cancel
            }
            1 => SignalAction::ExitImmediately,
            _ => SignalAction::Ignore,
        }
    }

    pub fn signal_count(&self) -> u8 {
        self.count.load(Ordering::SeqCst)
    }
}

/// Install the process-wide SIGINT/SIGTERM handler.
///
/// Must be called at most once, at CLI startup.
pub fn install_signal_handler(token: CancelToken) -> Result<(), ctrlc::Error> {
    let state = SignalState::new();
    ctrlc::set_handler(move || match state.handle_signal(&token) {
        SignalAction::Cancel => {
            eprintln!("\ninterrupt received, cancelling (press again to exit now)");
        }
        SignalAction::ExitImmediately => {
            eprintln!("\nsecond interrupt, exiting");
            std::process::exit(130);
        }
        SignalAction::Ignore => {}
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_starts_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_clones_share_the_flag() {
        let token = CancelToken::new();
        let clone = token.clone();

        clone.cancel();

        assert!(token.is_cancelled());
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_first_signal_cancels() {
        let token = CancelToken::new();
        let state = SignalState::new();

        assert_eq!(state.handle_signal(&token), SignalAction::Cancel);
        assert!(token.is_cancelled());
        assert_eq!(state.signal_count(), 1);
    }

    #[test]
    fn test_second_signal_requests_exit() {
        let token = CancelToken::new();
        let state = SignalState::new();

        state.handle_signal(&token);
        assert_eq!(state.handle_signal(&token), SignalAction::ExitImmediately);
    }

    #[test]
    fn test_later_signals_ignored() {
        let token = CancelToken::new();
        let state = SignalState::new();

        state.handle_signal(&token);
        state.handle_signal(&token);
        assert_eq!(state.handle_signal(&token), SignalAction::Ignore);
        assert_eq!(state.signal_count(), 3);
    }
}
