use super::model::{DefinitionSummary, ProcessDefinition, ProcessDefinitionSource};
use crate::error::{EngineError, EngineResult};
use crate::storage::IndexStore;
use crate::types::DefinitionId;
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};

type Versions = BTreeMap<u32, Arc<ProcessDefinition>>;

/// Registry of deployed, versioned process definitions.
///
/// Sources are written to the index store before they become visible, so a
/// deployed definition is always available to recovery.
pub struct DefinitionStore {
    index: Arc<dyn IndexStore>,
    definitions: RwLock<HashMap<String, Versions>>,
}

fn lock_poisoned<T>(_: T) -> EngineError {
    EngineError::Storage("definition store lock poisoned".to_string())
}

impl DefinitionStore {
    pub fn new(index: Arc<dyn IndexStore>) -> Self {
        Self {
            index,
            definitions: RwLock::new(HashMap::new()),
        }
    }

    /// Validate and deploy a source as the next version of its key
    pub fn deploy(&self, source: ProcessDefinitionSource) -> EngineResult<DefinitionId> {
        let mut definitions = self.definitions.write().map_err(lock_poisoned)?;
        let version = definitions
            .get(&source.key)
            .and_then(|versions| versions.keys().next_back().copied())
            .unwrap_or(0)
            + 1;
        let id = DefinitionId::new(source.key.clone(), version);

        let definition = ProcessDefinition::compile(id.clone(), source.clone())?;
        self.index
            .save_definition(&id, &source)
            .map_err(EngineError::storage)?;
        definitions
            .entry(id.key.clone())
            .or_default()
            .insert(version, Arc::new(definition));

        tracing::info!("Deployed process definition {}", id);
        Ok(id)
    }

    pub fn get(&self, id: &DefinitionId) -> EngineResult<Arc<ProcessDefinition>> {
        self.definitions
            .read()
            .map_err(lock_poisoned)?
            .get(&id.key)
            .and_then(|versions| versions.get(&id.version))
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("definition {id}")))
    }

    /// Highest deployed version of a key
    pub fn latest(&self, key: &str) -> EngineResult<Arc<ProcessDefinition>> {
        self.definitions
            .read()
            .map_err(lock_poisoned)?
            .get(key)
            .and_then(|versions| versions.values().next_back())
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("definition {key}")))
    }

    pub fn versions(&self, key: &str) -> EngineResult<Vec<DefinitionSummary>> {
        let definitions = self.definitions.read().map_err(lock_poisoned)?;
        let versions = definitions
            .get(key)
            .ok_or_else(|| EngineError::NotFound(format!("definition {key}")))?;
        Ok(versions.values().map(|d| DefinitionSummary::from(d.as_ref())).collect())
    }

    /// Every deployed version, ordered by key then version
    pub fn list(&self) -> EngineResult<Vec<DefinitionSummary>> {
        let definitions = self.definitions.read().map_err(lock_poisoned)?;
        let mut summaries: Vec<DefinitionSummary> = definitions
            .values()
            .flat_map(|versions| versions.values())
            .map(|d| DefinitionSummary::from(d.as_ref()))
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    /// Reload every definition recorded in the index store
    pub fn load_persisted(&self) -> EngineResult<usize> {
        let persisted = self.index.load_definitions().map_err(EngineError::storage)?;
        let mut definitions = self.definitions.write().map_err(lock_poisoned)?;
        let mut loaded = 0;
        for (id, source) in persisted {
            let definition = ProcessDefinition::compile(id.clone(), source)?;
            definitions
                .entry(id.key.clone())
                .or_default()
                .insert(id.version, Arc::new(definition));
            loaded += 1;
        }
        tracing::info!("Loaded {} persisted process definitions", loaded);
        Ok(loaded)
    }

    /// Remove superseded versions that no instance references. The latest
    /// version of every key is always kept.
    pub fn prune(&self, referenced: &HashSet<DefinitionId>) -> EngineResult<Vec<DefinitionId>> {
        let mut definitions = self.definitions.write().map_err(lock_poisoned)?;
        let mut removed = Vec::new();

        for (key, versions) in definitions.iter_mut() {
            let Some(&latest) = versions.keys().next_back() else {
                continue;
            };
            let stale: Vec<u32> = versions
                .keys()
                .copied()
                .filter(|&v| v != latest && !referenced.contains(&DefinitionId::new(key.clone(), v)))
                .collect();
            for version in stale {
                let id = DefinitionId::new(key.clone(), version);
                self.index
                    .delete_definition(&id)
                    .map_err(EngineError::storage)?;
                versions.remove(&version);
                removed.push(id);
            }
        }

        if !removed.is_empty() {
            tracing::info!("Pruned {} unreferenced definition versions", removed.len());
        }
        Ok(removed)
    }
}

/// Read every `*.json` and `*.toml` definition source below a directory
pub fn load_sources_from_dir(dir: &Path) -> Result<Vec<ProcessDefinitionSource>> {
    let mut paths = Vec::new();
    for entry in walkdir::WalkDir::new(dir).follow_links(true) {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        if entry.file_type().is_file() {
            paths.push(entry.into_path());
        }
    }
    paths.sort();

    let mut sources = Vec::new();
    for path in paths {
        let parsed = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("Failed to parse {}", path.display()))?
            }
            Some("toml") => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                toml::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))?
            }
            _ => continue,
        };
        sources.push(parsed);
    }

    Ok(sources)
}
