//! Process termination with custom exit codes.

use std::fmt;

/// An error carrying a user-facing message and the exit code the process
/// should terminate with.
#[derive(Debug)]
pub struct TerminationError {
    message: String,
    exit_code: i32,
}

impl TerminationError {
    pub fn new(message: impl Into<String>, exit_code: i32) -> Self {
        Self { message: message.into(), exit_code }
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }
}

impl fmt::Display for TerminationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TerminationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_its_exit_code() {
        let err = TerminationError::new("datastore is not migrated", 3);
        assert_eq!(err.exit_code(), 3);
        assert_eq!(err.to_string(), "datastore is not migrated");
    }

    #[test]
    fn downcasts_from_anyhow() {
        let err: anyhow::Error = TerminationError::new("boom", 7).into();
        let termination = err.downcast_ref::<TerminationError>().unwrap();
        assert_eq!(termination.exit_code(), 7);
    }
}
