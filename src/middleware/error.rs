use thiserror::Error;

/// Misuse of the handler registry during setup.
///
/// These indicate a configuration bug, not a runtime condition: callers are
/// expected to abort startup on them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SetupError {
    #[error("Handler '{handler}' must be bound to at least one operation kind")]
    EmptyKinds { handler: &'static str },

    #[error("Handler registry is already shared with connections, transactions or statements; register handlers before opening them")]
    RegistryShared,
}
