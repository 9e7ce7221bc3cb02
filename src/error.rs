use thiserror::Error;

/// Crate-wide error taxonomy. Mirrors the error kinds the core distinguishes
/// (see spec §7): each variant maps to one outbound behaviour in the Hub's
/// command dispatcher.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("malformed message: {0}")]
    ClientProtocol(String),

    #[error("admin privileges required")]
    Authorization,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("media error: {0}")]
    Media(String),

    #[error("storage error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("fatal startup error: {0}")]
    Fatal(String),
}

impl AppError {
    /// Whether this error should close the originating connection. Per §7,
    /// only malformed-beyond-recovery transport framing does; every
    /// `AppError` variant surfaces as an `error` envelope without closing.
    pub fn closes_connection(&self) -> bool {
        false
    }

    /// User-facing message sent back in the `error` envelope.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
