//! Error types for the inspection protocol.

use crate::channel::ChannelError;
use crate::language::KernelLanguage;

/// Failure to turn a kernel reply into structured data.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid escape sequence at byte {0}")]
    InvalidEscape(usize),

    #[error("Payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by inspection handlers and the session manager.
#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    #[error("Language not supported: {0}")]
    UnsupportedLanguage(KernelLanguage),

    #[error("Kernel channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Malformed kernel reply: {0}")]
    Decode(#[from] DecodeError),

    #[error("Kernel reported {ename}: {evalue}")]
    Kernel { ename: String, evalue: String },

    #[error("Reply ended without a result")]
    NoResult,

    #[error("Inspection superseded by a kernel restart")]
    Superseded,

    #[error("Handler has been disposed")]
    Disposed,

    #[error("No active inspection handler")]
    NoActiveHandler,

    #[error("Invalid session id: {0}")]
    InvalidSessionId(&'static str),
}

impl InspectError {
    /// True for the designed fallback of an unsupported kernel language.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, InspectError::UnsupportedLanguage(_))
    }
}
