// SPDX-License-Identifier: MIT OR Apache-2.0
//! rumi-dict
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The SharedDict: a namespaced `token -> value` store where a bound value
//! may itself be a token in the same namespace, resolved transitively (§4.7).
//! `propose` rejects collisions and cycles; `resolve` stops after a bounded
//! number of hops rather than looping forever on a legitimately long chain.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rumi_core::SharedDictRule;
use rumi_error::{ErrorKind, RumiError};
use serde::{Deserialize, Serialize};

/// Maximum number of hops `resolve` will walk before returning a partial
/// result with `hop_limit: true`.
pub const DEFAULT_HOP_LIMIT: usize = 10;

/// Errors from SharedDict operations.
#[derive(Debug, thiserror::Error)]
pub enum DictError {
    /// The proposed binding would close a cycle reachable from its value.
    #[error("proposing {namespace}/{token} -> {value} would create a cycle")]
    Cycle {
        /// Namespace of the rejected proposal.
        namespace: String,
        /// Token of the rejected proposal.
        token: String,
        /// Value of the rejected proposal.
        value: String,
    },
    /// `(namespace, token)` already binds a different value.
    #[error("{namespace}/{token} already binds {existing}, refusing to rebind to {attempted}")]
    Collision {
        /// Namespace of the rejected proposal.
        namespace: String,
        /// Token of the rejected proposal.
        token: String,
        /// Value already bound.
        existing: String,
        /// Value that was rejected.
        attempted: String,
    },
    /// `resolve`/`explain`/`remove` referenced a token with no binding.
    #[error("no binding for {namespace}/{token}")]
    UnknownToken {
        /// Namespace queried.
        namespace: String,
        /// Token queried.
        token: String,
    },
    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<DictError> for RumiError {
    fn from(err: DictError) -> Self {
        let kind = match &err {
            DictError::Cycle { .. } => ErrorKind::Cycle,
            DictError::Collision { .. } => ErrorKind::Collision,
            DictError::UnknownToken { .. } => ErrorKind::NotApproved,
            DictError::Io(_) | DictError::Json(_) => ErrorKind::SchemaInvalid,
        };
        RumiError::new(kind, err.to_string())
    }
}

/// Outcome of a [`SharedDict::resolve`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveResult {
    /// The terminal (or best reached) value.
    pub value: String,
    /// `true` if resolution stopped because it hit [`DEFAULT_HOP_LIMIT`]
    /// rather than reaching a true terminal.
    pub hop_limit: bool,
}

/// Outcome of a single proposal, as recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ProposalOutcome {
    Accepted,
    RejectedCycle,
    RejectedCollision,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalEntry {
    ts: DateTime<Utc>,
    namespace: String,
    token: String,
    value: String,
    provenance: String,
    outcome: ProposalOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Snapshot {
    saved_at: DateTime<Utc>,
    rules: Vec<SharedDictRule>,
}

/// Filesystem-backed SharedDict.
///
/// Persists as `snapshot.json` (full state) + `journal.jsonl` (append-only
/// record of every accepted/rejected proposal). Recovery loads the snapshot
/// then replays journal entries newer than it.
pub struct SharedDict {
    dir: PathBuf,
    rules: BTreeMap<(String, String), SharedDictRule>,
}

impl SharedDict {
    /// Open (or initialize) a SharedDict rooted at
    /// `<user_data_root>/settings/shared_dict/`.
    pub fn open(user_data_root: impl AsRef<Path>) -> Result<Self, DictError> {
        let dir = user_data_root.as_ref().join("settings/shared_dict");
        std::fs::create_dir_all(&dir)?;

        let snapshot_path = dir.join("snapshot.json");
        let (mut rules, saved_at) = if snapshot_path.is_file() {
            let raw = std::fs::read_to_string(&snapshot_path)?;
            let snapshot: Snapshot = serde_json::from_str(&raw)?;
            let rules = snapshot
                .rules
                .into_iter()
                .map(|r| ((r.namespace.clone(), r.token.clone()), r))
                .collect();
            (rules, snapshot.saved_at)
        } else {
            (BTreeMap::new(), DateTime::<Utc>::UNIX_EPOCH)
        };

        let journal_path = dir.join("journal.jsonl");
        if journal_path.is_file() {
            let raw = std::fs::read_to_string(&journal_path)?;
            for line in raw.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let entry: JournalEntry = serde_json::from_str(line)?;
                if entry.ts > saved_at && entry.outcome == ProposalOutcome::Accepted {
                    rules.insert(
                        (entry.namespace.clone(), entry.token.clone()),
                        SharedDictRule {
                            namespace: entry.namespace,
                            token: entry.token,
                            value: entry.value,
                            provenance: entry.provenance,
                        },
                    );
                }
            }
        }

        Ok(Self { dir, rules })
    }

    fn append_journal(&self, entry: &JournalEntry) -> Result<(), DictError> {
        let path = self.dir.join("journal.jsonl");
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Overwrite `snapshot.json` with the current full rule set.
    pub fn save_snapshot(&self) -> Result<(), DictError> {
        let snapshot = Snapshot {
            saved_at: Utc::now(),
            rules: self.rules.values().cloned().collect(),
        };
        let path = self.dir.join("snapshot.json");
        std::fs::write(path, serde_json::to_string_pretty(&snapshot)?)?;
        Ok(())
    }

    /// Returns `true` if walking forward from `value` (treating it as a
    /// token in `namespace`) ever reaches `token` again.
    fn would_cycle(&self, namespace: &str, token: &str, value: &str) -> bool {
        let mut current = value.to_string();
        let mut visited = std::collections::BTreeSet::new();
        loop {
            if current == token {
                return true;
            }
            if !visited.insert(current.clone()) {
                // Already-existing cycle unrelated to this proposal; not our concern here.
                return false;
            }
            match self.rules.get(&(namespace.to_string(), current.clone())) {
                Some(rule) => current = rule.value.clone(),
                None => return false,
            }
        }
    }

    /// Propose a new binding. Rejected if it would collide with an existing
    /// different binding for the same `(namespace, token)`, or if it would
    /// close a cycle reachable from `value`. Accepting an identical
    /// `(namespace, token, value)` proposal twice is a no-op.
    pub fn propose(
        &mut self,
        namespace: &str,
        token: &str,
        value: &str,
        provenance: &str,
    ) -> Result<(), DictError> {
        let key = (namespace.to_string(), token.to_string());

        if let Some(existing) = self.rules.get(&key) {
            if existing.value == value {
                return Ok(());
            }
            self.append_journal(&JournalEntry {
                ts: Utc::now(),
                namespace: namespace.into(),
                token: token.into(),
                value: value.into(),
                provenance: provenance.into(),
                outcome: ProposalOutcome::RejectedCollision,
            })?;
            return Err(DictError::Collision {
                namespace: namespace.into(),
                token: token.into(),
                existing: existing.value.clone(),
                attempted: value.into(),
            });
        }

        if self.would_cycle(namespace, token, value) {
            self.append_journal(&JournalEntry {
                ts: Utc::now(),
                namespace: namespace.into(),
                token: token.into(),
                value: value.into(),
                provenance: provenance.into(),
                outcome: ProposalOutcome::RejectedCycle,
            })?;
            tracing::warn!(namespace, token, value, "shared_dict proposal rejected: cycle");
            return Err(DictError::Cycle {
                namespace: namespace.into(),
                token: token.into(),
                value: value.into(),
            });
        }

        self.rules.insert(
            key,
            SharedDictRule {
                namespace: namespace.into(),
                token: token.into(),
                value: value.into(),
                provenance: provenance.into(),
            },
        );
        self.append_journal(&JournalEntry {
            ts: Utc::now(),
            namespace: namespace.into(),
            token: token.into(),
            value: value.into(),
            provenance: provenance.into(),
            outcome: ProposalOutcome::Accepted,
        })?;
        self.save_snapshot()?;
        tracing::info!(namespace, token, value, "shared_dict proposal accepted");
        Ok(())
    }

    /// Resolve `token` in `namespace`, walking the chain of bindings until a
    /// terminal value or [`DEFAULT_HOP_LIMIT`] is reached.
    pub fn resolve(&self, namespace: &str, token: &str) -> Result<ResolveResult, DictError> {
        let rule = self
            .rules
            .get(&(namespace.to_string(), token.to_string()))
            .ok_or_else(|| DictError::UnknownToken {
                namespace: namespace.into(),
                token: token.into(),
            })?;

        let mut current_value = rule.value.clone();
        let mut hops = 1usize;
        loop {
            if hops > DEFAULT_HOP_LIMIT {
                return Ok(ResolveResult { value: current_value, hop_limit: true });
            }
            match self.rules.get(&(namespace.to_string(), current_value.clone())) {
                Some(next) => {
                    current_value = next.value.clone();
                    hops += 1;
                }
                None => return Ok(ResolveResult { value: current_value, hop_limit: false }),
            }
        }
    }

    /// Return the full resolution path for `token`, starting with `token`
    /// itself, for diagnostics.
    pub fn explain(&self, namespace: &str, token: &str) -> Vec<String> {
        let mut path = vec![token.to_string()];
        let mut current = token.to_string();
        let mut hops = 0usize;
        while let Some(rule) = self.rules.get(&(namespace.to_string(), current.clone())) {
            path.push(rule.value.clone());
            current = rule.value.clone();
            hops += 1;
            if hops > DEFAULT_HOP_LIMIT {
                break;
            }
        }
        path
    }

    /// All rules bound in `namespace`.
    pub fn list(&self, namespace: &str) -> Vec<&SharedDictRule> {
        self.rules
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, rule)| rule)
            .collect()
    }

    /// Remove a binding, if present.
    pub fn remove(&mut self, namespace: &str, token: &str) -> Result<(), DictError> {
        self.rules.remove(&(namespace.to_string(), token.to_string()));
        self.save_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(tmp: &tempfile::TempDir) -> SharedDict {
        SharedDict::open(tmp.path()).unwrap()
    }

    #[test]
    fn propose_then_resolve_returns_value() {
        let tmp = tempfile::tempdir().unwrap();
        let mut d = dict(&tmp);
        d.propose("ns", "A", "literal", "test").unwrap();
        let result = d.resolve("ns", "A").unwrap();
        assert_eq!(result, ResolveResult { value: "literal".into(), hop_limit: false });
    }

    #[test]
    fn resolve_walks_transitive_chain() {
        let tmp = tempfile::tempdir().unwrap();
        let mut d = dict(&tmp);
        d.propose("ns", "A", "B", "test").unwrap();
        d.propose("ns", "B", "C", "test").unwrap();
        d.propose("ns", "C", "terminal", "test").unwrap();
        let result = d.resolve("ns", "A").unwrap();
        assert_eq!(result.value, "terminal");
        assert!(!result.hop_limit);
    }

    #[test]
    fn propose_rejects_cycle() {
        let tmp = tempfile::tempdir().unwrap();
        let mut d = dict(&tmp);
        d.propose("ns", "A", "B", "test").unwrap();
        d.propose("ns", "B", "C", "test").unwrap();
        let err = d.propose("ns", "C", "A", "test").unwrap_err();
        assert!(matches!(err, DictError::Cycle { .. }));
    }

    #[test]
    fn propose_rejects_collision() {
        let tmp = tempfile::tempdir().unwrap();
        let mut d = dict(&tmp);
        d.propose("ns", "A", "B", "test").unwrap();
        let err = d.propose("ns", "A", "C", "test").unwrap_err();
        assert!(matches!(err, DictError::Collision { .. }));
    }

    #[test]
    fn identical_reproposal_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let mut d = dict(&tmp);
        d.propose("ns", "A", "B", "test").unwrap();
        d.propose("ns", "A", "B", "test").unwrap();
        assert_eq!(d.list("ns").len(), 1);
    }

    #[test]
    fn resolve_past_hop_limit_returns_partial_with_flag() {
        let tmp = tempfile::tempdir().unwrap();
        let mut d = dict(&tmp);
        // Build a straight chain of 15 hops: t0 -> t1 -> ... -> t14 -> "end"
        for i in 0..14 {
            d.propose("ns", &format!("t{i}"), &format!("t{}", i + 1), "test").unwrap();
        }
        d.propose("ns", "t14", "end", "test").unwrap();

        let result = d.resolve("ns", "t0").unwrap();
        assert!(result.hop_limit);
        assert_ne!(result.value, "end");
    }

    #[test]
    fn resolve_unknown_token_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let d = dict(&tmp);
        let err = d.resolve("ns", "nope").unwrap_err();
        assert!(matches!(err, DictError::UnknownToken { .. }));
    }

    #[test]
    fn explain_returns_full_walk() {
        let tmp = tempfile::tempdir().unwrap();
        let mut d = dict(&tmp);
        d.propose("ns", "A", "B", "test").unwrap();
        d.propose("ns", "B", "terminal", "test").unwrap();
        assert_eq!(d.explain("ns", "A"), vec!["A", "B", "terminal"]);
    }

    #[test]
    fn remove_deletes_binding() {
        let tmp = tempfile::tempdir().unwrap();
        let mut d = dict(&tmp);
        d.propose("ns", "A", "B", "test").unwrap();
        d.remove("ns", "A").unwrap();
        assert!(d.resolve("ns", "A").is_err());
    }

    #[test]
    fn list_scopes_to_namespace() {
        let tmp = tempfile::tempdir().unwrap();
        let mut d = dict(&tmp);
        d.propose("ns1", "A", "x", "test").unwrap();
        d.propose("ns2", "A", "y", "test").unwrap();
        assert_eq!(d.list("ns1").len(), 1);
        assert_eq!(d.list("ns2").len(), 1);
    }

    #[test]
    fn recovery_replays_journal_after_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mut d = dict(&tmp);
            d.propose("ns", "A", "B", "test").unwrap();
        }
        let reloaded = dict(&tmp);
        assert_eq!(reloaded.resolve("ns", "A").unwrap().value, "B");
    }

    proptest::proptest! {
        #[test]
        fn acyclicity_holds_after_random_accepted_proposals(
            pairs in proptest::collection::vec((0..6usize, 0..6usize), 1..30)
        ) {
            let tmp = tempfile::tempdir().unwrap();
            let mut d = dict(&tmp);
            for (t, v) in pairs {
                let token = format!("n{t}");
                let value = format!("n{v}");
                if token == value {
                    continue;
                }
                // Ignore the result: collisions/cycles are expected and
                // must simply be rejected, not panic or corrupt state.
                let _ = d.propose("ns", &token, &value, "proptest");
            }

            // No token should resolve back to itself via any accepted chain.
            for i in 0..6 {
                let token = format!("n{i}");
                if let Ok(result) = d.resolve("ns", &token) {
                    prop_assert_ne!(result.value, token);
                }
            }
        }
    }
}
