//! Application foreground/background signal.
//!
//! The host drives [`Lifecycle::set`] from its platform callbacks; the send
//! queue and the viewing timer watch the channel to pause and resume.

use tokio::sync::watch;

/// Whether the app is visible to the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AppState {
    /// Visible and interactive.
    #[default]
    Foreground,
    /// Suspended or hidden; timers must not advance.
    Background,
}

/// Broadcasts [`AppState`] transitions.
#[derive(Debug)]
pub struct Lifecycle {
    tx: watch::Sender<AppState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Start in [`AppState::Foreground`].
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(AppState::Foreground);
        Self { tx }
    }

    /// Publish a transition. Repeating the current state is a no-op.
    pub fn set(&self, state: AppState) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            tracing::debug!(?state, "app state changed");
        }
    }

    /// Current state.
    #[must_use]
    pub fn current(&self) -> AppState {
        *self.tx.borrow()
    }

    /// Watch for transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AppState> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transitions_are_observed() {
        let lifecycle = Lifecycle::new();
        let mut rx = lifecycle.subscribe();
        assert_eq!(lifecycle.current(), AppState::Foreground);

        lifecycle.set(AppState::Background);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), AppState::Background);
    }

    #[tokio::test]
    async fn repeated_state_does_not_notify() {
        let lifecycle = Lifecycle::new();
        let rx = lifecycle.subscribe();
        lifecycle.set(AppState::Foreground);
        assert!(!rx.has_changed().unwrap());
    }
}
