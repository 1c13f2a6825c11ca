use std::process::Stdio;

/// How a supervised child's stdout/stderr are routed.
///
/// Resolved once per launch: debugging runs want to see the child's chatter
/// on the supervisor's own streams, normal runs send it to the null device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Child output is inherited from the supervisor process's streams.
    Forward,
    /// Child output goes to the platform null device.
    Discard,
}

impl OutputMode {
    /// Resolve the mode from the ambient tracing verbosity.
    ///
    /// Forward when debug is enabled for the `procwarden` target, discard
    /// otherwise.
    pub fn from_ambient() -> Self {
        if tracing::enabled!(target: "procwarden", tracing::Level::DEBUG) {
            OutputMode::Forward
        } else {
            OutputMode::Discard
        }
    }

    /// Stdio configuration for one of the child's output streams.
    ///
    /// `Stdio::null()` resolves the platform null device (`/dev/null`,
    /// `NUL`) inside the standard library.
    pub(crate) fn stdio(self) -> Stdio {
        match self {
            OutputMode::Forward => Stdio::inherit(),
            OutputMode::Discard => Stdio::null(),
        }
    }
}
