//! The case catalog: a closed, id-addressed set of test cases

use std::collections::BTreeMap;

use crate::case::{CaseId, TestCase};
use crate::error::{EngineError, EngineResult};
use crate::graph::DepGraph;

/// All cases known to the session, keyed by id.
///
/// The catalog is a closed set: every dependency edge resolves to a
/// member.  Id collisions are a fatal error caught at construction.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    cases: BTreeMap<CaseId, TestCase>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_cases(cases: Vec<TestCase>) -> EngineResult<Self> {
        let mut catalog = Self::new();
        for case in cases {
            catalog.insert(case)?;
        }
        Ok(catalog)
    }

    pub fn insert(&mut self, case: TestCase) -> EngineResult<()> {
        if let Some(existing) = self.cases.get(&case.id) {
            return Err(EngineError::IdCollision {
                id: case.id.to_string(),
                a: existing.display_name(),
                b: case.display_name(),
            });
        }
        self.cases.insert(case.id.clone(), case);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn contains(&self, id: &CaseId) -> bool {
        self.cases.contains_key(id)
    }

    pub fn get(&self, id: &CaseId) -> Option<&TestCase> {
        self.cases.get(id)
    }

    pub fn get_mut(&mut self, id: &CaseId) -> Option<&mut TestCase> {
        self.cases.get_mut(id)
    }

    pub fn case(&self, id: &CaseId) -> EngineResult<&TestCase> {
        self.get(id)
            .ok_or_else(|| EngineError::CaseNotFound(id.to_string()))
    }

    pub fn ids(&self) -> impl Iterator<Item = &CaseId> {
        self.cases.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TestCase> {
        self.cases.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TestCase> {
        self.cases.values_mut()
    }

    /// Unmasked cases only
    pub fn active(&self) -> impl Iterator<Item = &TestCase> {
        self.iter().filter(|c| c.active())
    }

    /// Build the dependency graph over resolved edges
    pub fn graph(&self) -> DepGraph {
        let mut graph = DepGraph::new();
        for case in self.iter() {
            graph.add_node(case.id.clone());
            for edge in &case.dependencies {
                graph.add_edge(case.id.clone(), edge.id.clone());
            }
        }
        graph
    }

    /// Find a case by id prefix or exact display name
    pub fn find(&self, needle: &str) -> Option<&TestCase> {
        self.iter()
            .find(|c| c.id.as_str().starts_with(needle) || c.display_name() == needle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::Scalar;
    use std::collections::BTreeMap as Map;

    fn case(family: &str, a: i64) -> TestCase {
        let mut params = Map::new();
        params.insert("a".to_string(), Scalar::Int(a));
        TestCase::new("/src", format!("{family}.canary.toml"), family, params)
    }

    #[test]
    fn test_duplicate_id_is_fatal() {
        let mut catalog = Catalog::new();
        catalog.insert(case("t", 1)).unwrap();
        assert!(catalog.insert(case("t", 1)).is_err());
    }

    #[test]
    fn test_find_by_prefix_and_display_name() {
        let catalog = Catalog::from_cases(vec![case("t", 1), case("t", 2)]).unwrap();
        let first = catalog.iter().next().unwrap();
        let prefix = &first.id.as_str()[..8];
        assert_eq!(catalog.find(prefix).unwrap().id, first.id);
        assert!(catalog.find("t.a=2").is_some());
        assert!(catalog.find("nope").is_none());
    }
}
