use crate::runtime::RuntimeHandle;
use crate::types::Artifact;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Identifier of a build match in the session's table.
pub type MatchId = u64;

/// An artifact as published to request handling.
#[derive(Debug, Clone)]
pub struct ServedArtifact {
    pub artifact: Artifact,
    /// The build match whose run produced this artifact.
    pub origin: MatchId,
    pub runtime: Option<RuntimeHandle>,
    pub serial: u64,
}

/// Served path (no leading slash) to artifact.
pub type ArtifactMap = BTreeMap<String, Arc<ServedArtifact>>;

/// An output refused because `owner` already serves its path.
#[derive(Debug)]
pub struct Rejected {
    pub path: String,
    pub owner: MatchId,
    pub artifact: ServedArtifact,
}

/// Result of [`ArtifactStore::swap`].
#[derive(Debug, Default)]
pub struct SwapOutcome {
    /// Paths now served for the origin, normalized.
    pub published: Vec<String>,
    /// Entries no longer served.
    pub replaced: Vec<Arc<ServedArtifact>>,
    pub rejected: Vec<Rejected>,
}

/// Published artifacts.
///
/// Readers take a snapshot and keep using it for the whole request; writers
/// replace the map wholesale so a reader never sees half of a rebuild.
#[derive(Debug, Default)]
pub struct ArtifactStore {
    current: RwLock<Arc<ArtifactMap>>,
}

pub(crate) fn normalize(path: &str) -> &str {
    path.trim_start_matches('/')
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<ArtifactMap> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Replaces every artifact of `origin` with `outputs` in one step.
    ///
    /// A path another match already serves keeps its current owner; the
    /// competing output is handed back in [`SwapOutcome::rejected`].
    pub fn swap(
        &self,
        origin: MatchId,
        outputs: impl IntoIterator<Item = (String, ServedArtifact)>,
    ) -> SwapOutcome {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next: ArtifactMap = (**guard).clone();

        let mut outcome = SwapOutcome::default();
        next.retain(|_, served| {
            if served.origin == origin {
                outcome.replaced.push(served.clone());
                false
            } else {
                true
            }
        });
        for (path, served) in outputs {
            let path = normalize(&path).to_string();
            let owner = next
                .get(&path)
                .map(|served| served.origin)
                .filter(|owner| *owner != origin);
            if let Some(owner) = owner {
                outcome.rejected.push(Rejected {
                    path,
                    owner,
                    artifact: served,
                });
                continue;
            }
            if let Some(previous) = next.insert(path.clone(), Arc::new(served)) {
                outcome.replaced.push(previous);
            }
            outcome.published.push(path);
        }

        *guard = Arc::new(next);
        outcome
    }

    /// Stops serving everything `origin` produced.
    pub fn remove_origin(&self, origin: MatchId) -> Vec<Arc<ServedArtifact>> {
        self.swap(origin, std::iter::empty()).replaced
    }

    /// Empties the store, returning what it held.
    pub fn drain(&self) -> Vec<Arc<ServedArtifact>> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let old = std::mem::take(&mut *guard);
        old.values().cloned().collect()
    }
}
