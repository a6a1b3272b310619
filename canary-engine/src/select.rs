//! Case selection: keyword, parameter, owner, and name filters
//!
//! A case matching every applied filter stays schedulable; anything
//! else is masked with a human-readable reason but kept in the
//! catalog.  Dependencies of selected cases are implicitly pulled in
//! with a warning.

use std::collections::BTreeSet;
use tracing::warn;

use crate::case::CaseId;
use crate::catalog::Catalog;
use crate::error::EngineResult;
use crate::expr::{ParamExpr, WordExpr};
use regex::Regex;

/// One selection filter
#[derive(Debug, Clone)]
pub enum Filter {
    /// Boolean expression over implicit keywords, user keywords, and
    /// the family name
    Keyword(String),
    /// Boolean expression over parameter bindings
    Parameter(String),
    /// Set membership against the case's owner list
    Owner(Vec<String>),
    /// Regular expression applied to the display name
    Regex(String),
    /// Id prefix match
    IdPrefix(String),
}

/// The filters applied to a session, conjunctive
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub filters: Vec<Filter>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keyword(mut self, expr: impl Into<String>) -> Self {
        self.filters.push(Filter::Keyword(expr.into()));
        self
    }

    pub fn parameter(mut self, expr: impl Into<String>) -> Self {
        self.filters.push(Filter::Parameter(expr.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

/// Apply the selection, masking deselected cases, then pull masked
/// dependencies of selected cases back in.
pub fn apply(catalog: &mut Catalog, selection: &Selection) -> EngineResult<()> {
    if !selection.is_empty() {
        // compile once; expression errors are user errors
        let mut compiled: Vec<CompiledFilter> = Vec::with_capacity(selection.filters.len());
        for filter in &selection.filters {
            compiled.push(CompiledFilter::compile(filter)?);
        }
        for case in catalog.iter_mut() {
            if case.mask.is_some() {
                continue;
            }
            for filter in &compiled {
                if !filter.matches(case) {
                    case.mask = Some(filter.reject_reason());
                    break;
                }
            }
        }
    }
    pull_in_dependencies(catalog);
    Ok(())
}

enum CompiledFilter {
    Keyword(WordExpr),
    Parameter(ParamExpr),
    Owner(BTreeSet<String>),
    Regex(Regex),
    IdPrefix(String),
}

impl CompiledFilter {
    fn compile(filter: &Filter) -> EngineResult<Self> {
        Ok(match filter {
            Filter::Keyword(expr) => CompiledFilter::Keyword(WordExpr::parse(expr)?),
            Filter::Parameter(expr) => CompiledFilter::Parameter(ParamExpr::parse(expr)?),
            Filter::Owner(owners) => {
                CompiledFilter::Owner(owners.iter().cloned().collect())
            }
            Filter::Regex(pattern) => CompiledFilter::Regex(Regex::new(pattern).map_err(|e| {
                crate::error::EngineError::InvalidExpression {
                    expr: pattern.clone(),
                    reason: e.to_string(),
                }
            })?),
            Filter::IdPrefix(prefix) => CompiledFilter::IdPrefix(prefix.clone()),
        })
    }

    fn matches(&self, case: &crate::case::TestCase) -> bool {
        match self {
            CompiledFilter::Keyword(expr) => expr.evaluate(&case.keywords),
            CompiledFilter::Parameter(expr) => expr.evaluate(&case.parameters),
            CompiledFilter::Owner(owners) => {
                case.owners.iter().any(|owner| owners.contains(owner))
            }
            CompiledFilter::Regex(re) => re.is_match(&case.display_name()),
            CompiledFilter::IdPrefix(prefix) => case.id.as_str().starts_with(prefix),
        }
    }

    fn reject_reason(&self) -> String {
        match self {
            CompiledFilter::Keyword(_) => "deselected by keyword expression".to_string(),
            CompiledFilter::Parameter(_) => "deselected by parameter expression".to_string(),
            CompiledFilter::Owner(_) => "deselected by owner expression".to_string(),
            CompiledFilter::Regex(_) => "deselected by name pattern".to_string(),
            CompiledFilter::IdPrefix(_) => "deselected by id".to_string(),
        }
    }
}

/// Unmask dependencies of selected cases (transitively), warning for
/// each case pulled back in
fn pull_in_dependencies(catalog: &mut Catalog) {
    loop {
        let mut pulled: Vec<CaseId> = Vec::new();
        for case in catalog.iter() {
            if case.mask.is_some() {
                continue;
            }
            for edge in &case.dependencies {
                if let Some(dep) = catalog.get(&edge.id) {
                    if dep.mask.is_some() {
                        pulled.push(edge.id.clone());
                    }
                }
            }
        }
        if pulled.is_empty() {
            return;
        }
        for id in pulled {
            if let Some(dep) = catalog.get_mut(&id) {
                if let Some(reason) = dep.mask.take() {
                    warn!(
                        case = %dep.display_name(),
                        %reason,
                        "masked dependency pulled into session"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::{DepEdge, Scalar, TestCase};
    use std::collections::BTreeMap;

    fn case(family: &str, params: &[(&str, i64)], keywords: &[&str]) -> TestCase {
        let parameters: BTreeMap<String, Scalar> = params
            .iter()
            .map(|(k, v)| (k.to_string(), Scalar::Int(*v)))
            .collect();
        let mut case = TestCase::new("/src", format!("{family}.canary.toml"), family, parameters);
        for kw in keywords {
            case.keywords.insert(kw.to_string());
        }
        case.attach_implicit_keywords();
        case
    }

    #[test]
    fn test_keyword_selection_masks_nonmatching() {
        let cases = vec![
            case("a", &[], &["fast"]),
            case("b", &[], &["slow"]),
        ];
        let mut catalog = Catalog::from_cases(cases).unwrap();
        let selection = Selection::new().keyword("fast");
        apply(&mut catalog, &selection).unwrap();
        let by_family = |f: &str| catalog.iter().find(|c| c.family == f).unwrap().clone();
        assert!(by_family("a").mask.is_none());
        assert!(by_family("b").mask.is_some());
    }

    #[test]
    fn test_family_name_is_selectable() {
        let cases = vec![case("a", &[], &[]), case("b", &[], &[])];
        let mut catalog = Catalog::from_cases(cases).unwrap();
        apply(&mut catalog, &Selection::new().keyword("a")).unwrap();
        assert!(catalog.iter().find(|c| c.family == "a").unwrap().mask.is_none());
        assert!(catalog.iter().find(|c| c.family == "b").unwrap().mask.is_some());
    }

    #[test]
    fn test_parameter_selection() {
        let cases = vec![
            case("t", &[("cpus", 1)], &[]),
            case("t", &[("cpus", 4)], &[]),
        ];
        let mut catalog = Catalog::from_cases(cases).unwrap();
        apply(&mut catalog, &Selection::new().parameter("cpus>2")).unwrap();
        let masked: Vec<bool> = catalog.iter().map(|c| c.mask.is_some()).collect();
        assert_eq!(masked.iter().filter(|m| **m).count(), 1);
    }

    #[test]
    fn test_dependencies_pulled_in() {
        let upstream = case("prep", &[], &["slow"]);
        let mut downstream = case("run", &[], &["fast"]);
        downstream.dependencies.push(DepEdge {
            id: upstream.id.clone(),
            result: Default::default(),
        });
        let up_id = upstream.id.clone();
        let mut catalog = Catalog::from_cases(vec![upstream, downstream]).unwrap();
        apply(&mut catalog, &Selection::new().keyword("fast")).unwrap();
        // prep was deselected by keyword but pulled back as a dependency
        assert!(catalog.get(&up_id).unwrap().mask.is_none());
    }
}
