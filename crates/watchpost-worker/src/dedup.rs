//! Incident deduplication.
//!
//! Identity of an incident is `(type, description, location)` after
//! normalization. The wall-clock "Observed at <timestamp>: " prefix the
//! classifier puts on descriptions never takes part in identity, and neither
//! do confidence or severity.

use std::collections::HashSet;
use std::fmt;
use std::sync::{LazyLock, Mutex, PoisonError};

use regex::Regex;
use watchpost_models::DetectedIncident;

static OBSERVED_AT_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^observed at \d{4}-\d{2}-\d{2}t\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:z|[+-]\d{2}:?\d{2}):\s*",
    )
    .unwrap()
});

/// Normalized identity of an incident. Only used for set membership.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lower-case and collapse every whitespace run to a single space.
fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Compute the identity key of an incident.
pub fn key_of(incident: &DetectedIncident) -> DedupKey {
    let description = OBSERVED_AT_PREFIX.replace(incident.description.trim(), "");
    DedupKey(format!(
        "{}|{}|{}",
        incident.incident_type.to_lowercase().trim(),
        normalize(&description),
        normalize(&incident.location)
    ))
}

/// Keep the first occurrence of each key within one classification result.
pub fn dedup_frame(incidents: Vec<DetectedIncident>) -> Vec<(DedupKey, DetectedIncident)> {
    let mut seen = HashSet::new();
    incidents
        .into_iter()
        .filter_map(|incident| {
            let key = key_of(&incident);
            seen.insert(key.clone()).then_some((key, incident))
        })
        .collect()
}

/// Keys accepted so far in one session.
///
/// Pipelines for different frames run concurrently; [`try_accept`] is the
/// only way in, and checks and inserts under one lock.
///
/// [`try_accept`]: SessionSeenSet::try_accept
#[derive(Debug, Default)]
pub struct SessionSeenSet {
    keys: Mutex<HashSet<DedupKey>>,
}

impl SessionSeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn keys(&self) -> std::sync::MutexGuard<'_, HashSet<DedupKey>> {
        // The set stays consistent even if a holder panicked
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `key`, returning true if it was not yet present.
    pub fn try_accept(&self, key: &DedupKey) -> bool {
        self.keys().insert(key.clone())
    }

    pub fn contains(&self, key: &DedupKey) -> bool {
        self.keys().contains(key)
    }

    pub fn clear(&self) {
        self.keys().clear();
    }

    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use watchpost_models::Severity;

    fn incident(kind: &str, description: &str, location: &str) -> DetectedIncident {
        DetectedIncident::new(kind, description, location)
    }

    #[test]
    fn test_key_is_idempotent() {
        let i = incident("Trespassing", "Person climbing fence", "MG Road");
        assert_eq!(key_of(&i), key_of(&i));
        assert_eq!(key_of(&i).as_str(), "trespassing|person climbing fence|mg road");
    }

    #[test]
    fn test_key_ignores_case_and_whitespace() {
        let a = incident("Trespassing ", "Person  climbing\tfence ", " MG   Road");
        let b = incident("trespassing", "person climbing fence", "mg road");
        assert_eq!(key_of(&a), key_of(&b));
    }

    #[test]
    fn test_key_strips_observed_at_prefix() {
        let a = incident(
            "Suspicious Loitering",
            "Observed at 2024-07-29T18:35:00Z: person loitering",
            "Cubbon Park",
        );
        let b = incident(
            "Suspicious Loitering",
            "Observed at 2024-07-30T09:00:00.500Z: person loitering",
            "Cubbon Park",
        );
        let c = incident(
            "Suspicious Loitering",
            "OBSERVED AT 2024-07-30T09:00:00+05:30:   person loitering",
            "Cubbon Park",
        );
        assert_eq!(key_of(&a), key_of(&b));
        assert_eq!(key_of(&a), key_of(&c));
        assert_eq!(key_of(&a).as_str(), "suspicious loitering|person loitering|cubbon park");
    }

    #[test]
    fn test_prefix_only_stripped_at_start() {
        let a = incident("X", "note: Observed at 2024-07-29T18:35:00Z: y", "z");
        assert!(key_of(&a).as_str().contains("observed at"));
    }

    #[test]
    fn test_key_ignores_severity_and_confidence() {
        let a = incident("Road Hazards", "debris", "NH 48").with_severity(Severity::High).with_confidence(0.9);
        let b = incident("Road Hazards", "debris", "NH 48").with_confidence(0.4);
        assert_eq!(key_of(&a), key_of(&b));
    }

    #[test]
    fn test_dedup_frame_keeps_first() {
        let first = incident("Trespassing", "person at gate", "Gate 1").with_severity(Severity::Low);
        let dup = incident("trespassing", "Person at  gate", "gate 1").with_severity(Severity::High);
        let other = incident("Abandoned Object", "bag", "Gate 1");

        let unique = dedup_frame(vec![first.clone(), dup, other]);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].1, first);
    }

    #[test]
    fn test_seen_set_accepts_once() {
        let seen = SessionSeenSet::new();
        let key = key_of(&incident("A", "b", "c"));
        assert!(seen.try_accept(&key));
        assert!(!seen.try_accept(&key));
        assert_eq!(seen.len(), 1);

        seen.clear();
        assert!(seen.is_empty());
        assert!(seen.try_accept(&key));
    }

    #[test]
    fn test_seen_set_concurrent_accepts() {
        let seen = Arc::new(SessionSeenSet::new());
        let key = key_of(&incident("A", "b", "c"));

        let accepted: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let seen = Arc::clone(&seen);
                    let key = key.clone();
                    scope.spawn(move || seen.try_accept(&key) as usize)
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(accepted, 1);
    }
}
