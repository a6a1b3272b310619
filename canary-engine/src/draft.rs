//! Draft specs: the inert output of parser plugins
//!
//! A draft holds everything a test file declared, with activation
//! predicates still attached.  Expansion evaluates the predicates and
//! produces concrete test cases; drafts hold no resolved edges.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::case::{
    AssetAction, BaselineAction, CompositeMode, DepPattern, ResourceGroup, Scalar,
};
use crate::error::{EngineError, EngineResult};
use crate::when::When;

/// A directive value guarded by an optional activation predicate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conditional<T> {
    pub value: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<When>,
}

impl<T> Conditional<T> {
    pub fn new(value: T, when: Option<When>) -> Self {
        Self { value, when }
    }

    pub fn unconditional(value: T) -> Self {
        Self { value, when: None }
    }
}

/// One parameter space declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParameterSet {
    /// Rows are zipped across the names
    List {
        names: Vec<String>,
        rows: Vec<Vec<Scalar>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        when: Option<When>,
    },
    /// One-at-a-time perturbations around a reference point
    Centered {
        names: Vec<String>,
        center: Vec<Scalar>,
        steps: Vec<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        when: Option<When>,
    },
    /// Uniform samples from per-name ranges, seeded for repeatability
    Random {
        names: Vec<String>,
        ranges: Vec<(f64, f64)>,
        samples: usize,
        #[serde(default = "default_seed")]
        seed: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        when: Option<When>,
    },
}

fn default_seed() -> u64 {
    1234
}

impl ParameterSet {
    pub fn names(&self) -> &[String] {
        match self {
            ParameterSet::List { names, .. }
            | ParameterSet::Centered { names, .. }
            | ParameterSet::Random { names, .. } => names,
        }
    }

    pub fn when(&self) -> Option<&When> {
        match self {
            ParameterSet::List { when, .. }
            | ParameterSet::Centered { when, .. }
            | ParameterSet::Random { when, .. } => when.as_ref(),
        }
    }

    /// Materialize the concrete parameter rows
    pub fn rows(&self) -> EngineResult<Vec<Vec<Scalar>>> {
        match self {
            ParameterSet::List { names, rows, .. } => {
                for row in rows {
                    if row.len() != names.len() {
                        return Err(EngineError::InvalidSpec {
                            file: String::new(),
                            reason: format!(
                                "parameter row {:?} does not match names {:?}",
                                row, names
                            ),
                        });
                    }
                }
                Ok(rows.clone())
            }
            ParameterSet::Centered {
                names,
                center,
                steps,
                ..
            } => {
                if center.len() != names.len() || steps.len() != names.len() {
                    return Err(EngineError::InvalidSpec {
                        file: String::new(),
                        reason: "centered space needs one center and step per name".to_string(),
                    });
                }
                let mut rows = vec![center.clone()];
                for (i, step) in steps.iter().enumerate() {
                    if *step == 0.0 {
                        continue;
                    }
                    let base = center[i].as_f64().ok_or_else(|| EngineError::InvalidSpec {
                        file: String::new(),
                        reason: format!("centered parameter {:?} is not numeric", names[i]),
                    })?;
                    for direction in [-1.0, 1.0] {
                        let mut row = center.clone();
                        row[i] = numeric_scalar(base + direction * step, &center[i]);
                        rows.push(row);
                    }
                }
                Ok(rows)
            }
            ParameterSet::Random {
                names,
                ranges,
                samples,
                seed,
                ..
            } => {
                if ranges.len() != names.len() {
                    return Err(EngineError::InvalidSpec {
                        file: String::new(),
                        reason: "random space needs one range per name".to_string(),
                    });
                }
                let mut rng = fastrand::Rng::with_seed(*seed);
                let mut rows = Vec::with_capacity(*samples);
                for _ in 0..*samples {
                    let mut row = Vec::with_capacity(ranges.len());
                    for (lo, hi) in ranges {
                        row.push(Scalar::Float(lo + rng.f64() * (hi - lo)));
                    }
                    rows.push(row);
                }
                Ok(rows)
            }
        }
    }
}

/// Keep integer typing when a perturbed center was an integer and the
/// result is whole
fn numeric_scalar(value: f64, like: &Scalar) -> Scalar {
    if matches!(like, Scalar::Int(_)) && value.fract() == 0.0 {
        Scalar::Int(value as i64)
    } else {
        Scalar::Float(value)
    }
}

/// What a parser plugin emits for one test file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DraftSpec {
    pub file_root: PathBuf,
    pub file_path: PathBuf,
    /// Default testname (the file stem unless overridden)
    pub family: String,
    /// `name`/`testname` directives; the family when empty
    #[serde(default)]
    pub testnames: Vec<String>,
    #[serde(default)]
    pub paramsets: Vec<ParameterSet>,
    #[serde(default)]
    pub keywords: Vec<Conditional<Vec<String>>>,
    /// First timeout whose predicate holds wins
    #[serde(default)]
    pub timeouts: Vec<Conditional<f64>>,
    /// Expected exit status; -1 means any non-zero
    #[serde(default)]
    pub xstatus: Vec<Conditional<i32>>,
    #[serde(default)]
    pub will_fail: Vec<Conditional<bool>>,
    #[serde(default)]
    pub exclusive: Vec<Conditional<bool>>,
    #[serde(default)]
    pub assets: Vec<Conditional<AssetAction>>,
    #[serde(default)]
    pub baseline: Vec<Conditional<BaselineAction>>,
    /// `set_attribute` entries, merged right-wins
    #[serde(default)]
    pub attributes: Vec<Conditional<BTreeMap<String, serde_json::Value>>>,
    #[serde(default)]
    pub dep_patterns: Vec<Conditional<DepPattern>>,
    #[serde(default)]
    pub composite_base: Option<Conditional<CompositeMode>>,
    /// `enable` directives; any matching false disables the testname
    #[serde(default)]
    pub enable: Vec<Conditional<bool>>,
    /// `skipif` reason; masks every case from this draft
    #[serde(default)]
    pub skip_reason: Option<String>,
    #[serde(default)]
    pub owners: Vec<String>,
    /// Explicit alternative resource groups, used verbatim
    #[serde(default)]
    pub resource_groups: Vec<ResourceGroup>,
    /// Executable body (argv)
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub pass_regex: Vec<String>,
    #[serde(default)]
    pub fail_regex: Vec<String>,
    #[serde(default)]
    pub skip_return_code: Option<i32>,
    /// Expected runtime in seconds from previous sessions
    #[serde(default)]
    pub runtime_estimate: Option<f64>,
}

impl DraftSpec {
    pub fn new(
        file_root: impl Into<PathBuf>,
        file_path: impl Into<PathBuf>,
        family: impl Into<String>,
    ) -> Self {
        Self {
            file_root: file_root.into(),
            file_path: file_path.into(),
            family: family.into(),
            ..Default::default()
        }
    }

    /// The testnames this draft generates cases for
    pub fn active_testnames(&self) -> Vec<String> {
        if self.testnames.is_empty() {
            vec![self.family.clone()]
        } else {
            self.testnames.clone()
        }
    }

    pub fn display_path(&self) -> String {
        self.file_path.to_string_lossy().to_string()
    }
}
