//! Deployed, compiled definitions. Definitions are immutable once compiled
//! and are handed out as `Arc`s shared by every session.

use crate::definition::{compile, DefinitionDoc, ProcessDefinition};
use crate::error::{EngineError, EngineResult};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

pub trait DefinitionSource: Send + Sync {
    /// A specific version, or the latest deployed one for `None`.
    fn get(&self, process_id: &str, version: Option<&str>) -> Option<Arc<ProcessDefinition>>;

    /// Latest version of every deployed process.
    fn all(&self) -> Vec<Arc<ProcessDefinition>>;

    /// Bumped on every deployment. Sessions rebuild their start-trigger
    /// table when it moves.
    fn revision(&self) -> u64;
}

#[derive(Default)]
struct Deployments {
    by_version: HashMap<(String, String), Arc<ProcessDefinition>>,
    latest: HashMap<String, String>,
    revision: u64,
}

#[derive(Default)]
pub struct InMemoryDefinitionSource {
    inner: RwLock<Deployments>,
}

impl InMemoryDefinitionSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deploy a compiled definition. Deploying identical content again is a
    /// no-op; a version may not change content once deployed, since live
    /// instances address its node arena by index.
    pub fn deploy(&self, definition: ProcessDefinition) -> EngineResult<Arc<ProcessDefinition>> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let key = (definition.id.clone(), definition.version.clone());
        if let Some(existing) = inner.by_version.get(&key) {
            if existing.version_hash != definition.version_hash {
                return Err(EngineError::definition(
                    &definition.id,
                    format!(
                        "version '{}' is already deployed with different content",
                        definition.version
                    ),
                ));
            }
            return Ok(existing.clone());
        }

        let definition = Arc::new(definition);
        inner.latest.insert(definition.id.clone(), definition.version.clone());
        inner.by_version.insert(key, definition.clone());
        inner.revision += 1;
        tracing::info!(
            process_id = %definition.id,
            version = %definition.version,
            hash = %definition.version_hash_hex(),
            "Deployed process definition"
        );
        Ok(definition)
    }

    pub fn deploy_doc(&self, doc: &DefinitionDoc) -> EngineResult<Arc<ProcessDefinition>> {
        self.deploy(compile(doc)?)
    }

    /// Compile and deploy every `.yaml`, `.yml` and `.json` file in `dir`.
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .with_context(|| format!("Reading definitions directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml") | Some("json")
                )
            })
            .collect();
        paths.sort();
        for path in &paths {
            let doc = DefinitionDoc::load_from_file(path)?;
            self.deploy_doc(&doc)
                .with_context(|| format!("Compiling {}", path.display()))?;
        }
        Ok(paths.len())
    }
}

impl DefinitionSource for InMemoryDefinitionSource {
    fn get(&self, process_id: &str, version: Option<&str>) -> Option<Arc<ProcessDefinition>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let version = match version {
            Some(v) => v.to_string(),
            None => inner.latest.get(process_id)?.clone(),
        };
        inner
            .by_version
            .get(&(process_id.to_string(), version))
            .cloned()
    }

    fn all(&self) -> Vec<Arc<ProcessDefinition>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut defs: Vec<_> = inner
            .latest
            .iter()
            .filter_map(|(id, v)| inner.by_version.get(&(id.clone(), v.clone())).cloned())
            .collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        defs
    }

    fn revision(&self) -> u64 {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).revision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ProcessBuilder;

    fn def(version: &str) -> ProcessDefinition {
        ProcessBuilder::new("p")
            .version(version)
            .start("s")
            .end("e")
            .connect("s", "e")
            .build()
            .unwrap()
    }

    #[test]
    fn latest_version_wins_without_explicit_version() {
        let source = InMemoryDefinitionSource::new();
        source.deploy(def("1")).unwrap();
        source.deploy(def("2")).unwrap();
        assert_eq!(source.get("p", None).unwrap().version, "2");
        assert_eq!(source.get("p", Some("1")).unwrap().version, "1");
        assert!(source.get("q", None).is_none());
        assert_eq!(source.all().len(), 1);
        assert_eq!(source.revision(), 2);
    }

    #[test]
    fn redeploying_a_version_requires_identical_content() {
        let source = InMemoryDefinitionSource::new();
        let first = source.deploy(def("1")).unwrap();
        let again = source.deploy(def("1")).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(source.revision(), 1);

        let changed = ProcessBuilder::new("p")
            .version("1")
            .start("s")
            .task("extra", "manual")
            .end("e")
            .chain(&["s", "extra", "e"])
            .build()
            .unwrap();
        let err = source.deploy(changed).unwrap_err();
        assert!(matches!(err, EngineError::Definition { .. }));
        assert_eq!(source.get("p", Some("1")).unwrap().nodes().len(), 2);
        assert_eq!(source.revision(), 1);
    }
}
