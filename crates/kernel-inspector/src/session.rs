//! Session identifiers.

use std::fmt;

use crate::error::InspectError;

const MAX_SESSION_ID_LEN: usize = 4096;

/// Opaque token naming one kernel session (typically a document path).
///
/// Validated on construction; compared byte-for-byte afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Result<Self, InspectError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(InspectError::InvalidSessionId("empty"));
        }
        if id.len() > MAX_SESSION_ID_LEN {
            return Err(InspectError::InvalidSessionId("too long"));
        }
        if id.chars().any(char::is_control) {
            return Err(InspectError::InvalidSessionId("contains control characters"));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = InspectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SessionId::new(s)
    }
}

impl TryFrom<&std::path::Path> for SessionId {
    type Error = InspectError;

    fn try_from(path: &std::path::Path) -> Result<Self, Self::Error> {
        SessionId::new(path.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ids() {
        let id: SessionId = "notebooks/analysis.ipynb".parse().unwrap();
        assert_eq!(id.as_str(), "notebooks/analysis.ipynb");
        assert_eq!(id.to_string(), "notebooks/analysis.ipynb");

        let from_path = SessionId::try_from(std::path::Path::new("/tmp/a.py")).unwrap();
        assert_eq!(from_path.as_str(), "/tmp/a.py");
    }

    #[test]
    fn test_rejected_ids() {
        assert!(matches!(
            SessionId::new("   "),
            Err(InspectError::InvalidSessionId("empty"))
        ));
        assert!(SessionId::new("a\nb").is_err());
        assert!(SessionId::new("x".repeat(MAX_SESSION_ID_LEN + 1)).is_err());
    }
}
