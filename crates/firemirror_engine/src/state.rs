//! Engine lifecycle state and reporting types.

use std::time::Instant;

/// The current state of the mirror engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed, not started.
    Uninitialized,
    /// Loading the replica and applying the pull strategy.
    Hydrating,
    /// Hydrated; accepting writes and, if configured, streaming.
    Live,
    /// The change stream dropped and is being re-opened.
    Reconnecting,
    /// Shut down. Every operation fails.
    Disposed,
}

impl EngineState {
    /// Returns true if local writes are accepted.
    pub fn is_running(&self) -> bool {
        matches!(self, EngineState::Live | EngineState::Reconnecting)
    }

    /// Returns true if the engine may move from `self` to `next`.
    pub fn can_transition_to(&self, next: EngineState) -> bool {
        use EngineState::*;
        matches!(
            (self, next),
            (Uninitialized, Hydrating)
                | (Hydrating, Live)
                | (Hydrating, Uninitialized)
                | (Live, Reconnecting)
                | (Reconnecting, Live)
                | (Live, Live)
                | (Reconnecting, Reconnecting)
        ) || (next == Disposed && *self != Disposed)
    }
}

/// Counters describing what the engine has done.
#[derive(Debug, Clone, Default)]
pub struct MirrorStats {
    /// Events published to subscribers, hydration batch included.
    pub events_published: u64,
    /// Change-stream puts and patches applied.
    pub stream_changes_applied: u64,
    /// Times the change stream was re-opened after a failure.
    pub reconnects: u64,
    /// Local writes the remote accepted.
    pub forwarded: u64,
    /// Local writes the remote did not accept after retries.
    pub forward_failures: u64,
    /// Most recent error message.
    pub last_error: Option<String>,
    /// When hydration finished.
    pub hydrated_at: Option<Instant>,
}

/// Outcome of hydration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HydrationReport {
    /// Entries read from the local replica.
    pub loaded: usize,
    /// Entries in the remote snapshot, if one was fetched.
    pub fetched: Option<usize>,
    /// Keys added or overwritten from the remote snapshot.
    pub introduced: usize,
    /// Local keys dropped because the remote snapshot replaced them.
    pub removed: usize,
    /// Why the local replica could not be read, if it could not.
    pub local_load_error: Option<String>,
    /// Why the remote snapshot could not be fetched, if it could not.
    pub remote_error: Option<String>,
}

impl HydrationReport {
    /// Returns true if both sources were read without trouble.
    pub fn is_clean(&self) -> bool {
        self.local_load_error.is_none() && self.remote_error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        use EngineState::*;
        assert!(Uninitialized.can_transition_to(Hydrating));
        assert!(Hydrating.can_transition_to(Live));
        assert!(Live.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Live));
        assert!(Live.can_transition_to(Disposed));
        assert!(Uninitialized.can_transition_to(Disposed));

        assert!(!Uninitialized.can_transition_to(Live));
        assert!(!Live.can_transition_to(Hydrating));
        assert!(!Disposed.can_transition_to(Live));
        assert!(!Disposed.can_transition_to(Disposed));
    }

    #[test]
    fn running_states() {
        assert!(EngineState::Live.is_running());
        assert!(EngineState::Reconnecting.is_running());
        assert!(!EngineState::Hydrating.is_running());
        assert!(!EngineState::Disposed.is_running());
    }

    #[test]
    fn clean_report() {
        let mut report = HydrationReport::default();
        assert!(report.is_clean());
        report.remote_error = Some("offline".into());
        assert!(!report.is_clean());
    }
}
