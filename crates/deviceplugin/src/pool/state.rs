/// Lifecycle of one pool.
///
/// ```text
/// Uninitialized -> Initializing -> Registered -> Serving <-> Degraded
///                        |                          \         /
///                        v                           Terminating -> Terminated
///                    Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum PoolState {
    Uninitialized,
    Initializing,
    Registered,
    /// Streaming, every device healthy.
    Serving,
    /// Streaming, at least one device unhealthy or none left.
    Degraded,
    Terminating,
    Terminated,
}

impl PoolState {
    pub fn can_transition_to(self, next: PoolState) -> bool {
        use PoolState::*;

        matches!(
            (self, next),
            (Uninitialized, Initializing)
                | (Initializing, Registered)
                | (Initializing, Terminated)
                | (Registered, Serving)
                | (Registered, Degraded)
                | (Serving, Degraded)
                | (Degraded, Serving)
                | (Registered, Terminating)
                | (Serving, Terminating)
                | (Degraded, Terminating)
                | (Terminating, Terminated)
        )
    }

    /// Whether the pool currently advertises devices.
    pub fn is_live(self) -> bool {
        matches!(self, PoolState::Serving | PoolState::Degraded)
    }

    pub fn is_terminal(self) -> bool {
        self == PoolState::Terminated
    }
}

#[cfg(test)]
mod tests {
    use super::PoolState::*;
    use super::*;

    const ALL: [PoolState; 7] = [
        Uninitialized,
        Initializing,
        Registered,
        Serving,
        Degraded,
        Terminating,
        Terminated,
    ];

    #[test]
    fn happy_path_is_allowed() {
        let path = [Uninitialized, Initializing, Registered, Serving, Degraded, Serving, Terminating, Terminated];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn early_failure_goes_straight_to_terminated() {
        assert!(Initializing.can_transition_to(Terminated));
        assert!(!Uninitialized.can_transition_to(Terminated));
    }

    #[test]
    fn terminated_is_final() {
        for next in ALL {
            assert!(!Terminated.can_transition_to(next));
        }
        assert!(Terminated.is_terminal());
    }

    #[test]
    fn no_skipping_registration() {
        assert!(!Initializing.can_transition_to(Serving));
        assert!(!Uninitialized.can_transition_to(Registered));
        assert!(!Serving.can_transition_to(Registered));
    }

    #[test]
    fn liveness() {
        let live = ALL.iter().filter(|s| s.is_live()).copied().collect::<Vec<_>>();
        assert_eq!(live, vec![Serving, Degraded]);
    }
}
