//! Nearest-neighbour identity matching

use std::sync::{Arc, RwLock};

use serde::Serialize;

use super::embedder::Detection;
use super::roster::{KnownIdentity, Roster};

/// Outcome of matching one detection against a roster
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Matched identity, or None for an unknown face
    pub identity_id: Option<String>,
    /// Distance to the nearest roster entry (infinite for an empty roster)
    pub distance: f32,
    /// `1 - distance`, floored at zero
    pub confidence: f32,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        self.identity_id.is_some()
    }
}

/// Euclidean distance; None if the vectors have different lengths
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    let sum: f32 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
    Some(sum.sqrt())
}

/// Match an embedding against every identity in the roster.
///
/// The nearest identity wins if its distance is strictly below `threshold`.
/// Exactly equal distances go to the lexicographically smallest identity id.
pub fn match_embedding(embedding: &[f32], roster: &Roster, threshold: f32) -> MatchResult {
    let mut best: Option<(&KnownIdentity, f32)> = None;

    for identity in roster.identities() {
        let Some(distance) = euclidean_distance(embedding, &identity.embedding) else {
            continue;
        };
        let closer = match best {
            None => !distance.is_nan(),
            Some((current, best_distance)) => {
                distance < best_distance
                    || (distance == best_distance && identity.identity_id < current.identity_id)
            }
        };
        if closer {
            best = Some((identity, distance));
        }
    }

    match best {
        Some((identity, distance)) => MatchResult {
            identity_id: (distance < threshold).then(|| identity.identity_id.clone()),
            distance,
            confidence: (1.0 - distance).max(0.0),
        },
        None => MatchResult {
            identity_id: None,
            distance: f32::INFINITY,
            confidence: 0.0,
        },
    }
}

/// Holds the current roster snapshot and the match threshold.
///
/// Readers take an `Arc` to the snapshot once per detection cycle and match
/// every face against it, so a concurrent reload never mixes two rosters
/// within a cycle.
pub struct IdentityMatcher {
    roster: RwLock<Arc<Roster>>,
    threshold: f32,
}

impl IdentityMatcher {
    pub fn new(threshold: f32) -> Self {
        Self {
            roster: RwLock::new(Arc::new(Roster::default())),
            threshold,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Current roster snapshot
    pub fn snapshot(&self) -> Arc<Roster> {
        self.roster.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Swap in a new roster built from `identities`; returns the new snapshot
    pub fn replace_roster(&self, identities: Vec<KnownIdentity>) -> Arc<Roster> {
        let mut guard = self.roster.write().unwrap_or_else(|e| e.into_inner());
        let next = Arc::new(Roster::new(identities, guard.generation() + 1));
        *guard = next.clone();
        next
    }

    pub fn known_count(&self) -> usize {
        self.snapshot().len()
    }

    /// Match a detection against a snapshot obtained from `snapshot()`
    pub fn match_detection(&self, detection: &Detection, roster: &Roster) -> MatchResult {
        match_embedding(&detection.embedding, roster, self.threshold)
    }
}
