use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use super::{PolicySet, PolicySummary, BUILTIN_POLICY_NAME};
use crate::error::GateError;

/// Outcome of one reload pass over the policy directory.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct ReloadReport {
    pub loaded: Vec<String>,
    pub rejected: Vec<RejectedPolicy>,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct RejectedPolicy {
    pub name: String,
    pub error: String,
}

/// Named policy sets loaded from `*.toml` files, plus the built-in default.
///
/// Sessions hold `Arc` snapshots, so a reload never changes the rules a
/// running session evaluates against. A document that fails validation
/// leaves the previously loaded set of the same name in place.
pub struct PolicyStore {
    dir: Option<PathBuf>,
    sets: RwLock<BTreeMap<String, Arc<PolicySet>>>,
}

impl PolicyStore {
    pub fn builtin_only() -> Result<Self> {
        let mut sets = BTreeMap::new();
        sets.insert(
            BUILTIN_POLICY_NAME.to_string(),
            Arc::new(PolicySet::builtin()?),
        );
        Ok(Self {
            dir: None,
            sets: RwLock::new(sets),
        })
    }

    pub fn open(dir: Option<&Path>) -> Result<(Self, ReloadReport)> {
        let mut store = Self::builtin_only()?;
        store.dir = dir.map(Path::to_path_buf);
        let report = store.reload()?;
        Ok((store, report))
    }

    /// Adds or replaces a set directly; used for sets that do not come from
    /// the policy directory.
    pub fn insert(&self, policy: PolicySet) {
        let mut sets = match self.sets.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sets.insert(policy.name.clone(), Arc::new(policy));
    }

    pub fn get(&self, name: &str) -> Option<Arc<PolicySet>> {
        let sets = match self.sets.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sets.get(name).cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<PolicySet>> {
        self.get(name).ok_or_else(|| {
            anyhow!(GateError::validation(
                name,
                None,
                "no policy with this name is loaded"
            ))
        })
    }

    pub fn list(&self) -> Vec<PolicySummary> {
        let sets = match self.sets.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sets.values().map(|policy| policy.summary()).collect()
    }

    pub fn len(&self) -> usize {
        match self.sets.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-reads every document in the policy directory. Each file is loaded
    /// all-or-nothing; rejected files are reported and logged.
    pub fn reload(&self) -> Result<ReloadReport> {
        let mut report = ReloadReport::default();
        let Some(dir) = &self.dir else {
            return Ok(report);
        };
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read policy dir {}", dir.display()))?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("toml"))
            .collect();
        paths.sort();

        let mut fresh = Vec::new();
        for path in paths {
            let name = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or_default()
                .to_string();
            match PolicySet::load_file(&path) {
                Ok(policy) => {
                    log::info!("loaded policy {} ({})", policy.name, &policy.digest[..12]);
                    report.loaded.push(policy.name.clone());
                    fresh.push(policy);
                }
                Err(err) => {
                    log::warn!("rejected policy {}: {:#}", path.display(), err);
                    report.rejected.push(RejectedPolicy {
                        name,
                        error: format!("{:#}", err),
                    });
                }
            }
        }

        let mut sets = match self.sets.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for policy in fresh {
            sets.insert(policy.name.clone(), Arc::new(policy));
        }
        Ok(report)
    }
}
