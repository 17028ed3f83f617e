use thiserror::Error;

/// Why the reducer refused an action.
///
/// `Expected` errors are business-rule violations that are safe to show to
/// the user. `Unexpected` errors mean an invariant was broken and point at a
/// defect somewhere upstream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReducerError {
    #[error("{0}")]
    Expected(String),

    #[error("Unexpected reducer error: {0}")]
    Unexpected(String),
}

impl ReducerError {
    pub fn expected(message: impl Into<String>) -> Self {
        Self::Expected(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    pub fn is_expected(&self) -> bool {
        matches!(self, Self::Expected(_))
    }

    /// The message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Expected(m) | Self::Unexpected(m) => m,
        }
    }
}
