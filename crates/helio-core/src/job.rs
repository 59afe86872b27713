//! Job identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a server-owned job (a discovery scan or an action
/// execution).
///
/// Backed by a random UUID so ids are never reused within a process
/// lifetime. The id is opaque to callers; they only pass it back to poll,
/// subscribe, or stop.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Mints a fresh job id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Returns a shortened display form (first 8 hex characters).
    ///
    /// Useful for compact log lines.
    #[must_use]
    pub fn short(&self) -> String {
        let full = self.0.simple().to_string();
        full.get(..8).unwrap_or(&full).to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ids_are_unique() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_short_form_is_eight_chars() {
        let id = JobId::new();
        assert_eq!(id.short().len(), 8);
    }

    #[test]
    fn test_display_round_trips_through_serde() {
        let id = JobId::new();
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, format!("\"{id}\""));
        let back: JobId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, id);
    }
}
