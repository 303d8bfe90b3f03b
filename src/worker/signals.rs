//! Termination analysis for worker processes.
//!
//! Classifies how a worker ended so that the parent can log a useful reason
//! and report it when a worker dies before finishing its bootstrap.

use nix::sys::signal::Signal;
use std::process::ExitStatus;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by a signal the parent sent while stopping it.
    Stopped(Signal),
    /// Killed by some other signal.
    Signaled(Signal),
    /// Likely out of memory (SIGKILL the parent did not send).
    OutOfMemory,
    /// Crashed on a memory fault (SIGSEGV or SIGBUS).
    Crashed(Signal),
    /// Status could not be determined.
    Unknown,
}

impl TerminationReason {
    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Whether the worker ended because the parent asked it to.
    pub fn is_requested(&self) -> bool {
        matches!(self, Self::Stopped(_))
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Stopped(sig) => format!("stopped by {:?}", sig),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::OutOfMemory => "was killed, likely out of memory (SIGKILL)".to_string(),
            Self::Crashed(sig) => format!("crashed ({:?})", sig),
            Self::Unknown => "terminated for an unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze an `ExitStatus`.
///
/// `sent` is the last signal the parent delivered to the worker, if any. A
/// death by that signal is classified as a requested stop.
pub fn analyze_exit_status(status: ExitStatus, sent: Option<Signal>) -> TerminationReason {
    use std::os::unix::process::ExitStatusExt;

    if let Some(code) = status.code() {
        return TerminationReason::Exited(code);
    }

    let Some(signal) = status.signal().and_then(|raw| Signal::try_from(raw).ok()) else {
        return TerminationReason::Unknown;
    };

    if Some(signal) == sent {
        return TerminationReason::Stopped(signal);
    }

    match signal {
        Signal::SIGKILL => TerminationReason::OutOfMemory,
        Signal::SIGSEGV | Signal::SIGBUS => TerminationReason::Crashed(signal),
        _ => TerminationReason::Signaled(signal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    // Raw wait statuses: exit codes live in the high byte, signals in the low bits.
    fn exited(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    fn signaled(signal: Signal) -> ExitStatus {
        ExitStatus::from_raw(signal as i32)
    }

    #[test]
    fn test_normal_exit() {
        assert_eq!(
            analyze_exit_status(exited(0), None),
            TerminationReason::Exited(0)
        );
        assert!(analyze_exit_status(exited(0), None).is_success());
        assert_eq!(
            analyze_exit_status(exited(3), Some(Signal::SIGINT)),
            TerminationReason::Exited(3)
        );
    }

    #[test]
    fn test_requested_stop() {
        let reason = analyze_exit_status(signaled(Signal::SIGINT), Some(Signal::SIGINT));
        assert_eq!(reason, TerminationReason::Stopped(Signal::SIGINT));
        assert!(reason.is_requested());

        let reason = analyze_exit_status(signaled(Signal::SIGKILL), Some(Signal::SIGKILL));
        assert!(reason.is_requested());
    }

    #[test]
    fn test_unrequested_signals() {
        assert_eq!(
            analyze_exit_status(signaled(Signal::SIGKILL), None),
            TerminationReason::OutOfMemory
        );
        assert_eq!(
            analyze_exit_status(signaled(Signal::SIGSEGV), Some(Signal::SIGINT)),
            TerminationReason::Crashed(Signal::SIGSEGV)
        );
        assert_eq!(
            analyze_exit_status(signaled(Signal::SIGTERM), None),
            TerminationReason::Signaled(Signal::SIGTERM)
        );
    }

    #[test]
    fn test_description() {
        assert!(TerminationReason::Exited(2).to_string().contains("code 2"));
        assert!(TerminationReason::OutOfMemory.to_string().contains("memory"));
        assert!(
            TerminationReason::Stopped(Signal::SIGINT)
                .to_string()
                .contains("SIGINT")
        );
    }
}
