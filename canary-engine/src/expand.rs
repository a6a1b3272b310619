//! Test-case expansion: draft specs to concrete cases
//!
//! For each active testname the activation predicates are evaluated
//! once to decide which parameter sets apply, the surviving sets are
//! combined (concatenation for identical name-tuples, Cartesian
//! product otherwise), and one case is constructed per resulting
//! parameter row.  A composite base case is synthesized last when the
//! draft declares one.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::case::{DepEdge, ResourceRequest, Scalar, TestCase};
use crate::draft::{DraftSpec, ParameterSet};
use crate::error::{EngineError, EngineResult};
use crate::when::{applies, WhenContext};

/// Session-level context needed during expansion
#[derive(Debug, Clone, Default)]
pub struct ExpandContext {
    pub platform: String,
    pub on_options: Vec<String>,
}

impl ExpandContext {
    fn when<'a>(
        &'a self,
        testname: Option<&'a str>,
        parameters: Option<&'a BTreeMap<String, Scalar>>,
    ) -> WhenContext<'a> {
        WhenContext {
            testname,
            platform: &self.platform,
            on_options: &self.on_options,
            parameters,
        }
    }
}

/// Expand one draft into zero or more test cases.
///
/// Errors are fatal for the draft (the caller drops it with a
/// diagnostic and continues with other drafts).
pub fn expand(draft: &DraftSpec, ctx: &ExpandContext) -> EngineResult<Vec<TestCase>> {
    let mut cases = Vec::new();
    for testname in draft.active_testnames() {
        let named = expand_testname(draft, &testname, ctx)?;
        cases.extend(named);
    }
    Ok(cases)
}

fn expand_testname(
    draft: &DraftSpec,
    testname: &str,
    ctx: &ExpandContext,
) -> EngineResult<Vec<TestCase>> {
    // decide which parameter sets apply to this testname
    let mut active_sets: Vec<&ParameterSet> = Vec::new();
    for set in &draft.paramsets {
        let when_ctx = ctx.when(Some(testname), None);
        let keep = match set.when() {
            Some(w) => w.evaluate(&when_ctx)?.value,
            None => true,
        };
        if keep {
            active_sets.push(set);
        }
    }

    let rows = combine(&active_sets)?;
    debug!(
        file = %draft.display_path(),
        testname,
        cases = rows.len().max(1),
        "expanding parameter space"
    );

    // a draft-wide mask applies to every case it generates
    let global_mask = global_mask(draft, testname, ctx)?;

    let mut cases: Vec<TestCase> = Vec::new();
    for parameters in rows_or_single(rows) {
        validate_special_parameters(draft, &parameters)?;
        let case = build_case(draft, testname, parameters, global_mask.clone(), ctx)?;
        cases.push(case);
    }

    // the composite base depends on every parameterized sibling; a
    // draft with no parameter rows has nothing to reduce over
    let reducible = cases.iter().any(|c| !c.parameters.is_empty());
    if let Some(base) = draft.composite_base.as_ref().filter(|_| reducible) {
        let when_ctx = ctx.when(Some(testname), None);
        if applies(&base.when, &when_ctx)? {
            let mut mask = global_mask.clone();
            if mask.is_none() && cases.iter().any(|c| c.mask.is_some()) {
                mask = Some("masked dependencies".to_string());
            }
            let mut parent = build_case(draft, testname, BTreeMap::new(), mask, ctx)?;
            parent.composite = Some(base.value.clone());
            parent.dependencies = cases
                .iter()
                .map(|c| DepEdge {
                    id: c.id.clone(),
                    result: Default::default(),
                })
                .collect();
            cases.push(parent);
        }
    }

    Ok(cases)
}

fn rows_or_single(rows: Vec<BTreeMap<String, Scalar>>) -> Vec<BTreeMap<String, Scalar>> {
    if rows.is_empty() {
        vec![BTreeMap::new()]
    } else {
        rows
    }
}

fn global_mask(
    draft: &DraftSpec,
    testname: &str,
    ctx: &ExpandContext,
) -> EngineResult<Option<String>> {
    if let Some(reason) = &draft.skip_reason {
        return Ok(Some(reason.clone()));
    }
    for enable in &draft.enable {
        let when_ctx = ctx.when(Some(testname), None);
        if applies(&enable.when, &when_ctx)? && !enable.value {
            return Ok(Some("disabled by enable directive".to_string()));
        }
    }
    Ok(None)
}

/// Combine parameter sets: identical name-tuples concatenate by row,
/// disjoint tuples combine by Cartesian product.  Duplicate rows after
/// combination deduplicate preserving first appearance.
pub fn combine(sets: &[&ParameterSet]) -> EngineResult<Vec<BTreeMap<String, Scalar>>> {
    if sets.is_empty() {
        return Ok(Vec::new());
    }
    // group by name-tuple, preserving first-appearance order
    let mut groups: Vec<(Vec<String>, Vec<Vec<Scalar>>)> = Vec::new();
    for set in sets {
        let names = set.names().to_vec();
        let rows = set.rows()?;
        if let Some(group) = groups.iter_mut().find(|(n, _)| *n == names) {
            group.1.extend(rows);
        } else {
            groups.push((names, rows));
        }
    }

    // Cartesian product across groups
    let mut combined: Vec<BTreeMap<String, Scalar>> = vec![BTreeMap::new()];
    for (names, rows) in &groups {
        let mut next = Vec::with_capacity(combined.len() * rows.len().max(1));
        for base in &combined {
            for row in rows {
                let mut merged = base.clone();
                for (name, value) in names.iter().zip(row.iter()) {
                    merged.insert(name.clone(), value.clone());
                }
                next.push(merged);
            }
        }
        combined = next;
    }

    // dedup preserving first appearance
    let mut seen = BTreeSet::new();
    let mut rows = Vec::with_capacity(combined.len());
    for row in combined {
        let key: String = row
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        if seen.insert(key) {
            rows.push(row);
        }
    }
    Ok(rows)
}

fn validate_special_parameters(
    draft: &DraftSpec,
    parameters: &BTreeMap<String, Scalar>,
) -> EngineResult<()> {
    for name in ["cpus", "gpus", "nodes"] {
        if let Some(value) = parameters.get(name) {
            match value.as_int() {
                Some(n) if n >= 0 => {}
                _ => {
                    return Err(EngineError::InvalidSpec {
                        file: draft.display_path(),
                        reason: format!(
                            "parameter {:?} must be a non-negative integer, got {}",
                            name, value
                        ),
                    })
                }
            }
        }
    }
    Ok(())
}

fn build_case(
    draft: &DraftSpec,
    testname: &str,
    parameters: BTreeMap<String, Scalar>,
    mask: Option<String>,
    ctx: &ExpandContext,
) -> EngineResult<TestCase> {
    let mut case = TestCase::new(
        draft.file_root.clone(),
        draft.file_path.clone(),
        testname,
        parameters,
    );

    {
        let when_ctx = ctx.when(Some(testname), Some(&case.parameters));

        // keywords: union of all matching lists
        for keywords in &draft.keywords {
            if applies(&keywords.when, &when_ctx)? {
                case.keywords.extend(keywords.value.iter().cloned());
            }
        }

        // first matching timeout wins
        for timeout in &draft.timeouts {
            if applies(&timeout.when, &when_ctx)? {
                case.timeout = Some(timeout.value);
                break;
            }
        }

        for xstatus in &draft.xstatus {
            if applies(&xstatus.when, &when_ctx)? {
                case.xstatus = xstatus.value;
                break;
            }
        }

        for flag in &draft.will_fail {
            if applies(&flag.when, &when_ctx)? && flag.value {
                case.will_fail = true;
            }
        }

        for flag in &draft.exclusive {
            if applies(&flag.when, &when_ctx)? && flag.value {
                case.exclusive = true;
            }
        }

        for asset in &draft.assets {
            if applies(&asset.when, &when_ctx)? {
                case.assets.push(asset.value.clone());
            }
        }

        for baseline in &draft.baseline {
            if applies(&baseline.when, &when_ctx)? {
                case.baseline.push(baseline.value.clone());
            }
        }

        // attribute overrides merge right-wins
        for attrs in &draft.attributes {
            if applies(&attrs.when, &when_ctx)? {
                for (key, value) in &attrs.value {
                    case.attributes.insert(key.clone(), value.clone());
                }
            }
        }

        for pattern in &draft.dep_patterns {
            if applies(&pattern.when, &when_ctx)? {
                case.dep_patterns.push(pattern.value.clone());
            }
        }
    }

    case.owners = draft.owners.clone();
    case.command = draft.command.clone();
    case.pass_regex = draft.pass_regex.clone();
    case.fail_regex = draft.fail_regex.clone();
    case.skip_return_code = draft.skip_return_code;
    if let Some(runtime) = draft.runtime_estimate {
        case.runtime_estimate = runtime;
    }
    case.resources = required_resources(draft, &case);
    case.mask = mask;
    case.attach_implicit_keywords();
    Ok(case)
}

/// Resource requirements derived from parameters plus any explicit
/// alternative groups, which are used verbatim
fn required_resources(draft: &DraftSpec, case: &TestCase) -> Vec<Vec<ResourceRequest>> {
    if !draft.resource_groups.is_empty() {
        return draft.resource_groups.clone();
    }
    let cpus = case
        .parameters
        .get("cpus")
        .and_then(Scalar::as_int)
        .unwrap_or(1)
        .max(0) as u32;
    let gpus = case
        .parameters
        .get("gpus")
        .and_then(Scalar::as_int)
        .unwrap_or(0)
        .max(0) as u32;
    let mut group = vec![ResourceRequest::new("cpus", cpus.max(1))];
    if gpus > 0 {
        group.push(ResourceRequest::new("gpus", gpus));
    }
    vec![group]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::Conditional;
    use crate::when::When;

    fn ctx() -> ExpandContext {
        ExpandContext {
            platform: "linux".to_string(),
            on_options: Vec::new(),
        }
    }

    fn list_set(names: &[&str], rows: Vec<Vec<Scalar>>) -> ParameterSet {
        ParameterSet::List {
            names: names.iter().map(|s| s.to_string()).collect(),
            rows,
            when: None,
        }
    }

    #[test]
    fn test_simple_parameter_expansion() {
        // parameterize("a", [1, 2, 3]) yields three cases
        let mut draft = DraftSpec::new("/src", "flow.canary.toml", "flow");
        draft.paramsets.push(list_set(
            &["a"],
            vec![
                vec![Scalar::Int(1)],
                vec![Scalar::Int(2)],
                vec![Scalar::Int(3)],
            ],
        ));
        let cases = expand(&draft, &ctx()).unwrap();
        assert_eq!(cases.len(), 3);
        let names: Vec<String> = cases.iter().map(|c| c.display_name()).collect();
        assert_eq!(names, vec!["flow.a=1", "flow.a=2", "flow.a=3"]);
        for case in &cases {
            assert!(case.parameters.contains_key("a"));
            assert!(case.keywords.contains("a"));
        }
    }

    #[test]
    fn test_cartesian_product_of_disjoint_sets() {
        let mut draft = DraftSpec::new("/src", "t.canary.toml", "t");
        draft.paramsets.push(list_set(
            &["a", "b"],
            vec![
                vec![Scalar::Str("a1".into()), Scalar::Str("b1".into())],
                vec![Scalar::Str("a2".into()), Scalar::Str("b2".into())],
            ],
        ));
        draft.paramsets.push(list_set(
            &["x"],
            vec![vec![Scalar::Str("x1".into())], vec![Scalar::Str("x2".into())]],
        ));
        let cases = expand(&draft, &ctx()).unwrap();
        assert_eq!(cases.len(), 4);
        assert_eq!(cases[0].display_name(), "t.a=a1.b=b1.x=x1");
        assert_eq!(cases[3].display_name(), "t.a=a2.b=b2.x=x2");
    }

    #[test]
    fn test_same_names_concatenate_and_dedup() {
        let mut draft = DraftSpec::new("/src", "t.canary.toml", "t");
        draft
            .paramsets
            .push(list_set(&["a"], vec![vec![Scalar::Int(1)], vec![Scalar::Int(2)]]));
        draft
            .paramsets
            .push(list_set(&["a"], vec![vec![Scalar::Int(2)], vec![Scalar::Int(3)]]));
        let cases = expand(&draft, &ctx()).unwrap();
        let names: Vec<String> = cases.iter().map(|c| c.display_name()).collect();
        assert_eq!(names, vec!["t.a=1", "t.a=2", "t.a=3"]);
    }

    #[test]
    fn test_negative_cpus_is_fatal() {
        let mut draft = DraftSpec::new("/src", "t.canary.toml", "t");
        draft
            .paramsets
            .push(list_set(&["cpus"], vec![vec![Scalar::Int(-2)]]));
        assert!(expand(&draft, &ctx()).is_err());
    }

    #[test]
    fn test_composite_base_depends_on_siblings() {
        let mut draft = DraftSpec::new("/src", "flow.canary.toml", "flow");
        draft.paramsets.push(list_set(
            &["a"],
            vec![
                vec![Scalar::Int(1)],
                vec![Scalar::Int(2)],
                vec![Scalar::Int(3)],
            ],
        ));
        draft.composite_base = Some(Conditional::unconditional(
            crate::case::CompositeMode::Flag("--base".to_string()),
        ));
        let cases = expand(&draft, &ctx()).unwrap();
        assert_eq!(cases.len(), 4);
        let base = cases.last().unwrap();
        assert!(base.parameters.is_empty());
        assert_eq!(base.dependencies.len(), 3);
        assert!(base.composite.is_some());
        let ids: BTreeSet<_> = cases[..3].iter().map(|c| c.id.clone()).collect();
        for edge in &base.dependencies {
            assert!(ids.contains(&edge.id));
        }
    }

    #[test]
    fn test_keywords_respect_when() {
        let mut draft = DraftSpec::new("/src", "t.canary.toml", "t");
        draft
            .paramsets
            .push(list_set(&["np"], vec![vec![Scalar::Int(1)], vec![Scalar::Int(4)]]));
        draft.keywords.push(Conditional::unconditional(vec!["base".to_string()]));
        draft.keywords.push(Conditional::new(
            vec!["parallel".to_string()],
            Some(When::parse("parameters='np>1'").unwrap()),
        ));
        let cases = expand(&draft, &ctx()).unwrap();
        assert!(!cases[0].keywords.contains("parallel"));
        assert!(cases[1].keywords.contains("parallel"));
        assert!(cases[0].keywords.contains("base"));
    }

    #[test]
    fn test_resource_derivation_from_parameters() {
        let mut draft = DraftSpec::new("/src", "t.canary.toml", "t");
        draft.paramsets.push(list_set(
            &["cpus", "gpus"],
            vec![vec![Scalar::Int(4), Scalar::Int(1)]],
        ));
        let cases = expand(&draft, &ctx()).unwrap();
        assert_eq!(cases[0].resources.len(), 1);
        assert_eq!(cases[0].resources[0][0], ResourceRequest::new("cpus", 4));
        assert_eq!(cases[0].resources[0][1], ResourceRequest::new("gpus", 1));
    }

    #[test]
    fn test_disabled_draft_masks_cases() {
        let mut draft = DraftSpec::new("/src", "t.canary.toml", "t");
        draft.enable.push(Conditional::unconditional(false));
        let cases = expand(&draft, &ctx()).unwrap();
        assert_eq!(cases.len(), 1);
        assert!(cases[0].mask.is_some());
    }
}
