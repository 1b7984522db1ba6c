use std::any::Any;

/// Errors surfaced by the tree model.
///
/// The type is `Clone` because one command result is fanned out to every
/// caller that attached to it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("tree model is disposed")]
    Disposed,

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("obsolete result for command generation {0}")]
    Obsolete(u64),

    #[error("visitor failed: {0}")]
    Visitor(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("structure provider error: {0}")]
    Provider(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, TreeError>;

impl TreeError {
    /// Returns true for errors that only mean "the work was called off".
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_) | Self::Disposed | Self::Obsolete(_))
    }
}

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_kinds() {
        assert!(TreeError::Disposed.is_cancellation());
        assert!(TreeError::Cancelled("node evicted".into()).is_cancellation());
        assert!(TreeError::Obsolete(3).is_cancellation());
        assert!(!TreeError::Visitor("boom".into()).is_cancellation());
    }

    #[test]
    fn panic_message_handles_common_payloads() {
        let payload = std::panic::catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload =
            std::panic::catch_unwind(|| panic!("formatted {}", 42)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 42");
    }
}
