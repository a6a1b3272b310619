//! Session workspace: directory layout and catalog persistence
//!
//! Layout under the work tree:
//!
//! - `<work_tree>/<display_name>/` per-case working directory (the id
//!   is used instead when display names collide);
//! - `<work_tree>/.canary/cases.index` stable id -> path index;
//! - `<work_tree>/.canary/cases/<id>.json` per-case snapshots;
//! - `<work_tree>/.canary/…` cache space for plugins (batching).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::case::{BaselineAction, CaseId, TestCase};
use crate::catalog::Catalog;
use crate::error::{EngineError, EngineResult};

pub const CACHE_DIR: &str = ".canary";
pub const INDEX_FILE: &str = "cases.index";
pub const CASES_DIR: &str = "cases";

/// Base directory for a test session
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct Index {
    version: u32,
    cases: BTreeMap<CaseId, PathBuf>,
}

impl Workspace {
    /// Create (or reuse) a session directory
    pub fn create(root: impl Into<PathBuf>) -> EngineResult<Self> {
        let workspace = Self { root: root.into() };
        std::fs::create_dir_all(workspace.cases_dir())
            .map_err(|e| EngineError::Session(format!("cannot create session directory: {e}")))?;
        Ok(workspace)
    }

    /// Open an existing session directory
    pub fn open(root: impl Into<PathBuf>) -> EngineResult<Self> {
        let workspace = Self { root: root.into() };
        if !workspace.index_file().exists() {
            return Err(EngineError::Session(format!(
                "{} is not a canary session directory",
                workspace.root.display()
            )));
        }
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(CACHE_DIR)
    }

    pub fn index_file(&self) -> PathBuf {
        self.cache_dir().join(INDEX_FILE)
    }

    fn cases_dir(&self) -> PathBuf {
        self.cache_dir().join(CASES_DIR)
    }

    fn case_file(&self, id: &CaseId) -> PathBuf {
        self.cases_dir().join(format!("{}.json", id))
    }

    /// Assign each case its working directory: the display name, or
    /// the id when display names collide
    pub fn assign_directories(&self, catalog: &mut Catalog) {
        let mut seen: BTreeMap<String, usize> = BTreeMap::new();
        for case in catalog.iter() {
            *seen.entry(case.display_name()).or_insert(0) += 1;
        }
        let collisions: BTreeSet<String> = seen
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|(name, _)| name)
            .collect();
        let root = self.root.clone();
        for case in catalog.iter_mut() {
            let name = case.display_name();
            let dir = if collisions.contains(&name) {
                case.id.to_string()
            } else {
                name
            };
            case.working_directory = Some(root.join(dir));
        }
    }

    /// Persist the full catalog: the id -> path index plus one JSON
    /// snapshot per case
    pub fn save_catalog(&self, catalog: &Catalog) -> EngineResult<()> {
        for case in catalog.iter() {
            self.save_case(case)?;
        }
        let index = Index {
            version: 1,
            cases: catalog
                .iter()
                .map(|case| {
                    let path = case
                        .working_directory
                        .clone()
                        .unwrap_or_else(|| self.root.join(case.id.to_string()));
                    (case.id.clone(), path)
                })
                .collect(),
        };
        let text = serde_json::to_string_pretty(&index)?;
        std::fs::write(self.index_file(), text)?;
        Ok(())
    }

    /// Reload the catalog persisted by `save_catalog`.  The round trip
    /// preserves ids, edges, parameters, and keywords exactly.
    pub fn load_catalog(&self) -> EngineResult<Catalog> {
        let text = std::fs::read_to_string(self.index_file())
            .map_err(|e| EngineError::Session(format!("cannot read case index: {e}")))?;
        let index: Index = serde_json::from_str(&text)?;
        let mut catalog = Catalog::new();
        for id in index.cases.keys() {
            catalog.insert(self.load_case(id)?)?;
        }
        Ok(catalog)
    }

    pub fn save_case(&self, case: &TestCase) -> EngineResult<()> {
        let text = serde_json::to_string_pretty(case)?;
        std::fs::write(self.case_file(&case.id), text)?;
        Ok(())
    }

    pub fn load_case(&self, id: &CaseId) -> EngineResult<TestCase> {
        let text = std::fs::read_to_string(self.case_file(id))
            .map_err(|e| EngineError::Session(format!("cannot read case {id}: {e}")))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Resolve an id prefix or display name to the case directory
    pub fn location(&self, needle: &str) -> EngineResult<PathBuf> {
        let catalog = self.load_catalog()?;
        let case = catalog
            .find(needle)
            .ok_or_else(|| EngineError::CaseNotFound(needle.to_string()))?;
        case.working_directory
            .clone()
            .ok_or_else(|| EngineError::Session(format!("{needle}: case has no directory")))
    }

    /// Apply a case's baseline actions, replacing source-tree files
    /// with outputs from the case directory.  Returns the number of
    /// files rebaselined.
    pub fn rebaseline(&self, case: &TestCase) -> EngineResult<usize> {
        let workdir = case.working_directory.clone().ok_or_else(|| {
            EngineError::Session(format!("{}: case has no directory", case.display_name()))
        })?;
        let source_dir = case
            .file_root
            .join(&case.file_path)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| case.file_root.clone());
        let mut applied = 0;
        for action in &case.baseline {
            match action {
                BaselineAction::Pair { src, dst } => {
                    let from = workdir.join(src);
                    let to = source_dir.join(dst);
                    std::fs::copy(&from, &to).map_err(|e| {
                        EngineError::Persistence(format!(
                            "rebaseline {} -> {}: {}",
                            from.display(),
                            to.display(),
                            e
                        ))
                    })?;
                    applied += 1;
                }
                BaselineAction::Flag(flag) => {
                    warn!(
                        case = %case.display_name(),
                        %flag,
                        "flag-style baselines require re-running the test body"
                    );
                }
            }
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::{DepEdge, Scalar};
    use std::collections::BTreeMap as Map;

    fn case(family: &str, n: i64) -> TestCase {
        let mut params = Map::new();
        params.insert("n".to_string(), Scalar::Int(n));
        let mut case =
            TestCase::new("/src", format!("{family}.canary.toml"), family, params);
        case.attach_implicit_keywords();
        case
    }

    #[test]
    fn test_catalog_round_trip_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(dir.path()).unwrap();

        let up = case("up", 1);
        let mut down = case("down", 2);
        down.dependencies.push(DepEdge {
            id: up.id.clone(),
            result: Default::default(),
        });
        let mut catalog = Catalog::from_cases(vec![up, down]).unwrap();
        workspace.assign_directories(&mut catalog);
        workspace.save_catalog(&catalog).unwrap();

        let reloaded = workspace.load_catalog().unwrap();
        assert_eq!(reloaded.len(), catalog.len());
        for original in catalog.iter() {
            let copy = reloaded.get(&original.id).expect("case survived");
            assert_eq!(copy.display_name(), original.display_name());
            assert_eq!(copy.parameters, original.parameters);
            assert_eq!(copy.keywords, original.keywords);
            assert_eq!(
                copy.dependencies.iter().map(|e| &e.id).collect::<Vec<_>>(),
                original.dependencies.iter().map(|e| &e.id).collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn test_colliding_display_names_fall_back_to_id() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(dir.path()).unwrap();
        // same display name, different files
        let a = TestCase::new("/src", "one/t.canary.toml", "t", Map::new());
        let b = TestCase::new("/src", "two/t.canary.toml", "t", Map::new());
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        let mut catalog = Catalog::from_cases(vec![a, b]).unwrap();
        workspace.assign_directories(&mut catalog);
        let dir_a = catalog.get(&a_id).unwrap().working_directory.clone().unwrap();
        let dir_b = catalog.get(&b_id).unwrap().working_directory.clone().unwrap();
        assert_ne!(dir_a, dir_b);
        assert!(dir_a.ends_with(a_id.to_string()));
    }

    #[test]
    fn test_location_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(dir.path()).unwrap();
        let c = case("flow", 3);
        let id = c.id.clone();
        let mut catalog = Catalog::from_cases(vec![c]).unwrap();
        workspace.assign_directories(&mut catalog);
        workspace.save_catalog(&catalog).unwrap();
        let location = workspace.location(&id.as_str()[..8]).unwrap();
        assert!(location.ends_with("flow.n=3"));
    }

    #[test]
    fn test_open_rejects_non_session_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Workspace::open(dir.path()).is_err());
    }
}
