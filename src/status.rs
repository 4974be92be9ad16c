//! The job state machine.
//!
//! ```text
//! Idle --spawn ok--> Running --wait ok--> Exited(code)
//!                         |--kill-------> Killed(code)
//!                         '--wait err---> Errored(code)
//! Idle --spawn err--> Errored(-1)
//! ```
//!
//! `Exited`, `Killed`, and `Errored` are terminal: once reached, no further
//! transition is permitted.

/// Default exit code before a terminal state is known or reachable.
pub const NO_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Running,
    Exited(i32),
    Killed(i32),
    Errored(i32),
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Exited(_) | Status::Killed(_) | Status::Errored(_)
        )
    }

    /// Exit code carried by a terminal status, `NO_EXIT_CODE` otherwise.
    pub fn exit_code(self) -> i32 {
        match self {
            Status::Exited(c) | Status::Killed(c) | Status::Errored(c) => c,
            Status::Idle | Status::Running => NO_EXIT_CODE,
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_terminal_states_report_no_exit_code() {
        assert_eq!(Status::Idle.exit_code(), NO_EXIT_CODE);
        assert_eq!(Status::Running.exit_code(), NO_EXIT_CODE);
        assert!(!Status::Idle.is_terminal());
        assert!(!Status::Running.is_terminal());
    }

    #[test]
    fn terminal_states_carry_their_exit_code() {
        assert_eq!(Status::Exited(0).exit_code(), 0);
        assert_eq!(Status::Killed(-1).exit_code(), -1);
        assert_eq!(Status::Errored(7).exit_code(), 7);
        assert!(Status::Exited(0).is_terminal());
        assert!(Status::Killed(-1).is_terminal());
        assert!(Status::Errored(7).is_terminal());
    }

    #[test]
    fn status_is_copy_and_clone() {
        let s = Status::Exited(3);
        let t = s;
        assert_eq!(s, t);
        let u = s;
        assert_eq!(s, u);
    }

    #[test]
    fn default_is_idle() {
        assert_eq!(Status::default(), Status::Idle);
    }
}
