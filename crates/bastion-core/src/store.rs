//! Authoritative local record of the desired forwarding rules for one gateway.
//!
//! The store is an ordered set keyed by [`RuleKey`]; insertion order is kept
//! for display only. It can be backed by a JSON file so the record survives
//! between invocations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{StoreError, ValidationError};
use crate::rule::PortRule;

const STORE_VERSION: u32 = 1;

/// Result of a store mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreChange {
    Applied,
    NoOp,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    rules: Vec<PortRule>,
}

/// Ordered, duplicate-free set of port rules.
#[derive(Debug, Default)]
pub struct RuleStore {
    rules: Vec<PortRule>,
    path: Option<PathBuf>,
}

impl RuleStore {
    /// An empty store with no backing file.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open the store backed by `path`, starting empty if the file does not
    /// exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if !path.exists() {
            debug!(path = %path.display(), "rule store not found, starting empty");
            return Ok(Self {
                rules: Vec::new(),
                path: Some(path),
            });
        }

        let data = std::fs::read(&path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        let file: StoreFile = serde_json::from_slice(&data).map_err(|e| StoreError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        if file.version != STORE_VERSION {
            return Err(StoreError::Corrupt {
                path,
                reason: format!("unsupported store version {}", file.version),
            });
        }

        let mut store = Self {
            rules: Vec::with_capacity(file.rules.len()),
            path: Some(path),
        };
        for rule in file.rules {
            if store.contains(&rule) {
                warn!(rule = %rule, "duplicate rule in store file, keeping first");
                continue;
            }
            store.rules.push(rule);
        }
        debug!(count = store.rules.len(), "loaded rule store");
        Ok(store)
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Persist the store. A no-op for in-memory stores.
    ///
    /// Writes to a sibling temp file and renames it over the target.
    pub fn save(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        let file = StoreFile {
            version: STORE_VERSION,
            rules: self.rules.clone(),
        };
        let data = serde_json::to_vec_pretty(&file).map_err(|e| StoreError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;
        debug!(path = %path.display(), count = self.rules.len(), "saved rule store");
        Ok(())
    }

    pub fn validate(&self, rule: &PortRule) -> Result<(), ValidationError> {
        rule.validate()
    }

    pub fn contains(&self, rule: &PortRule) -> bool {
        let key = rule.key();
        self.rules.iter().any(|r| r.key() == key)
    }

    /// Add a rule. Adding a rule that is already present is a no-op; a rule
    /// with the same key but a different target replaces the stored one in
    /// place.
    pub fn add(&mut self, rule: &PortRule) -> Result<StoreChange, ValidationError> {
        self.validate(rule)?;
        let key = rule.key();
        match self.rules.iter_mut().find(|r| r.key() == key) {
            Some(existing) if existing == rule => Ok(StoreChange::NoOp),
            Some(existing) => {
                *existing = rule.clone();
                Ok(StoreChange::Applied)
            }
            None => {
                self.rules.push(rule.clone());
                Ok(StoreChange::Applied)
            }
        }
    }

    /// Remove a rule. Removing an absent rule is a no-op.
    pub fn remove(&mut self, rule: &PortRule) -> Result<StoreChange, ValidationError> {
        self.validate(rule)?;
        let key = rule.key();
        let before = self.rules.len();
        self.rules.retain(|r| r.key() != key);
        if self.rules.len() == before {
            Ok(StoreChange::NoOp)
        } else {
            Ok(StoreChange::Applied)
        }
    }

    /// Snapshot of the rules in insertion order.
    pub fn list(&self) -> RuleSnapshot {
        RuleSnapshot {
            rules: self.rules.clone().into(),
            pos: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Finite iterator over a point-in-time copy of the store.
///
/// Clone it before iterating (or call [`RuleSnapshot::rewind`]) to walk the
/// same snapshot again; later store mutations are not observed.
#[derive(Debug, Clone)]
pub struct RuleSnapshot {
    rules: Arc<[PortRule]>,
    pos: usize,
}

impl RuleSnapshot {
    pub fn rewind(&mut self) {
        self.pos = 0;
    }
}

impl Iterator for RuleSnapshot {
    type Item = PortRule;

    fn next(&mut self) -> Option<Self::Item> {
        let rule = self.rules.get(self.pos)?.clone();
        self.pos += 1;
        Some(rule)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.rules.len() - self.pos;
        (left, Some(left))
    }
}

impl ExactSizeIterator for RuleSnapshot {}
