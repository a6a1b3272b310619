//! Dependency resolution: patterns to explicit case-to-case edges
//!
//! Pattern grammar:
//!
//! - `name` matches any case whose family is `name`;
//! - `name.k=v[.k=v…]` additionally requires the given parameter
//!   bindings, where `v` may be `*` or a glob;
//! - `dir/name[.k=v…]` scopes the match to cases from that directory
//!   (relative to the scoping root);
//! - `${param}` substitutions are taken from the depending case's own
//!   parameters before matching.
//!
//! Matches drop self-edges and sort by id for determinism.  A
//! cardinality mismatch marks the depending case NOT_RUN; a cycle in
//! the resolved graph is fatal.

use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::case::{CaseId, DepEdge, DepPattern, StatusName, TestCase};
use crate::catalog::Catalog;
use crate::error::{EngineError, EngineResult};
use crate::expr::fnmatch;

/// Resolve every case's dependency patterns against the catalog, then
/// verify the resulting graph is acyclic.
pub fn resolve(catalog: &mut Catalog) -> EngineResult<()> {
    let index: Vec<MatchTarget> = catalog
        .iter()
        .map(|case| MatchTarget {
            id: case.id.clone(),
            family: case.family.clone(),
            dir: parent_dir(case),
            parameters: case.parameters.clone(),
        })
        .collect();

    let ids: Vec<CaseId> = catalog.ids().cloned().collect();
    for id in ids {
        let (patterns, parameters) = {
            let case = catalog.case(&id)?;
            (case.dep_patterns.clone(), case.parameters.clone())
        };
        if patterns.is_empty() {
            continue;
        }
        let mut edges: Vec<DepEdge> = Vec::new();
        let mut failure: Option<String> = None;
        for pattern in &patterns {
            match resolve_pattern(&id, pattern, &parameters, &index) {
                Ok(matched) => edges.extend(matched),
                Err(reason) => {
                    failure = Some(reason);
                    break;
                }
            }
        }
        let case = catalog
            .get_mut(&id)
            .ok_or_else(|| EngineError::CaseNotFound(id.to_string()))?;
        if let Some(reason) = failure {
            warn!(case = %case.display_name(), %reason, "dependency resolution failed");
            case.status
                .set(StatusName::NotRun, Some(reason))
                .map_err(|e| EngineError::Internal(e.to_string()))?;
            continue;
        }
        // merge with edges attached at expansion (composite base), then
        // dedup by upstream id and sort for determinism
        edges.extend(case.dependencies.drain(..));
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        edges.dedup_by(|a, b| a.id == b.id);
        debug!(case = %case.display_name(), edges = edges.len(), "resolved dependencies");
        case.dependencies = edges;
    }

    catalog.graph().check_acyclic()
}

struct MatchTarget {
    id: CaseId,
    family: String,
    dir: String,
    parameters: BTreeMap<String, crate::case::Scalar>,
}

fn parent_dir(case: &TestCase) -> String {
    case.file_path
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn resolve_pattern(
    own_id: &CaseId,
    pattern: &DepPattern,
    parameters: &BTreeMap<String, crate::case::Scalar>,
    index: &[MatchTarget],
) -> Result<Vec<DepEdge>, String> {
    let text = substitute(&pattern.pattern, parameters)
        .map_err(|name| format!("unresolved dependency: unknown parameter ${{{name}}}"))?;

    let (dir, rest) = match text.rsplit_once('/') {
        Some((dir, rest)) => (Some(dir.to_string()), rest.to_string()),
        None => (None, text.clone()),
    };
    let mut parts = rest.split('.');
    let mut name = parts.next().unwrap_or_default().to_string();
    let mut bindings: Vec<(String, String)> = Vec::new();
    for part in parts {
        match part.split_once('=') {
            Some((k, v)) => bindings.push((k.to_string(), v.to_string())),
            // a segment without '=' continues the previous value (or
            // the family name): "a.x=0.5" binds x to "0.5"
            None => match bindings.last_mut() {
                Some((_, value)) => {
                    value.push('.');
                    value.push_str(part);
                }
                None => {
                    name.push('.');
                    name.push_str(part);
                }
            },
        }
    }

    let mut matched: Vec<DepEdge> = Vec::new();
    for target in index {
        if &target.id == own_id {
            continue;
        }
        if let Some(dir) = &dir {
            if !fnmatch(dir, &target.dir) {
                continue;
            }
        }
        if !fnmatch(&name, &target.family) {
            continue;
        }
        let mut ok = true;
        for (key, value) in &bindings {
            match target.parameters.get(key) {
                Some(actual) if value == "*" || fnmatch(value, &actual.to_string()) => {}
                _ => {
                    ok = false;
                    break;
                }
            }
        }
        if ok {
            matched.push(DepEdge {
                id: target.id.clone(),
                result: pattern.result,
            });
        }
    }

    matched.sort_by(|a, b| a.id.cmp(&b.id));
    if !pattern.expect.satisfied_by(matched.len()) {
        return Err(format!(
            "unresolved dependency: {:?} matched {} case(s)",
            pattern.pattern,
            matched.len()
        ));
    }
    Ok(matched)
}

/// Apply `${param}` substitutions from the depending case's parameters
fn substitute(
    pattern: &str,
    parameters: &BTreeMap<String, crate::case::Scalar>,
) -> Result<String, String> {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let end = tail.find('}').ok_or_else(|| pattern.to_string())?;
        let name = &tail[..end];
        match parameters.get(name) {
            Some(value) => out.push_str(&value.to_string()),
            None => return Err(name.to_string()),
        }
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
