use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A submission identifier. Opaque from the core's point of view — the
/// document store assigns it before the core ever sees a `SubmissionTask`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(String);

impl SubmissionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl AsRef<str> for SubmissionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content hash of a file, treated uniformly as a hex string (spec.md §9
/// open question 2: the source mixed `file_hash.sha256` and `file_hash`;
/// we standardize on the hash string everywhere).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileHash(String);

impl FileHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }
}

impl AsRef<str> for FileHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered service name, e.g. `"pe_extractor"` or `"yara_scan"`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceName(String);

impl ServiceName {
    pub fn new(id: &str) -> Result<Self, IdError> {
        if id.is_empty() || id.len() > 64 {
            return Err(IdError::Length);
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(IdError::Chars);
        }
        Ok(Self(id.to_string()))
    }

    /// Builds a name without validation, for cases where the value is
    /// already known-good (loaded from the schedule cache, for instance).
    pub fn new_unchecked(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl AsRef<str> for ServiceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum IdError {
    #[error("service name must be between 1 and 64 characters")]
    Length,
    #[error("service name must be lowercase alphanumeric or underscore")]
    Chars,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_name_rejects_uppercase() {
        assert!(matches!(ServiceName::new("YARA"), Err(IdError::Chars)));
    }

    #[test]
    fn service_name_accepts_snake_case() {
        assert!(ServiceName::new("pe_extractor").is_ok());
    }
}
