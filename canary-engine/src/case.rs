//! Test case model: identity, parameters, status state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use crate::error::{EngineError, EngineResult};
use crate::resource::Assignment;

/// Unique identifier for a test case
///
/// Ids are the first 20 hex characters of a SHA-256 digest over the
/// case's file root, file path, family name, and sorted parameters.
/// Two distinct cases hashing to the same id is a fatal catalog error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseId(String);

impl CaseId {
    /// Wrap a pre-computed id (used when reloading a persisted catalog)
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated id for log lines
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(7)]
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A scalar parameter value: int, float, or string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    /// Parse from text, preferring int, then float, then string
    pub fn parse(s: &str) -> Scalar {
        if let Ok(i) = s.parse::<i64>() {
            Scalar::Int(i)
        } else if let Ok(f) = s.parse::<f64>() {
            Scalar::Float(f)
        } else {
            Scalar::Str(s.to_string())
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Scalar::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Float(f) => Some(*f),
            Scalar::Str(s) => s.parse::<f64>().ok(),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Float(x) => write!(f, "{}", x),
            Scalar::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Scalar {
    fn from(i: i64) -> Self {
        Scalar::Int(i)
    }
}

impl From<f64> for Scalar {
    fn from(f: f64) -> Self {
        Scalar::Float(f)
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Str(s.to_string())
    }
}

/// Case execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusName {
    /// Case is created but not yet queued
    Created,
    /// Case has unmet dependencies
    Pending,
    /// Case is ready to run
    Ready,
    /// Case is currently executing
    Running,
    /// Case ran and exited cleanly
    Success,
    /// Case ran and exited with the diff exit code
    Diff,
    /// Case ran and failed
    Fail,
    /// Case ran out of time and was killed
    Timeout,
    /// Case was cancelled before reaching a verdict
    Cancelled,
    /// A dependency did not pass acceptance for this case
    NotRun,
    /// Case asked to be skipped
    Skip,
}

impl StatusName {
    /// Terminal states never re-schedule within a session
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            StatusName::Created | StatusName::Pending | StatusName::Ready | StatusName::Running
        )
    }

    /// Canonical display label (matches the persisted result vocabulary)
    pub fn label(self) -> &'static str {
        match self {
            StatusName::Created => "CREATED",
            StatusName::Pending => "PENDING",
            StatusName::Ready => "READY",
            StatusName::Running => "RUNNING",
            StatusName::Success => "SUCCESS",
            StatusName::Diff => "DIFF",
            StatusName::Fail => "FAIL",
            StatusName::Timeout => "TIMEOUT",
            StatusName::Cancelled => "CANCELLED",
            StatusName::NotRun => "NOT_RUN",
            StatusName::Skip => "SKIP",
        }
    }
}

impl fmt::Display for StatusName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Status with an optional human-readable reason
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub name: StatusName,
    pub message: Option<String>,
}

impl Status {
    pub fn new() -> Self {
        Self {
            name: StatusName::Created,
            message: None,
        }
    }

    /// Transition to a new status, enforcing the one-way lifecycle.
    ///
    /// The only backward move allowed is RUNNING -> READY (retry).
    pub fn set(&mut self, name: StatusName, message: Option<String>) -> EngineResult<()> {
        if !Self::allowed(self.name, name) {
            return Err(EngineError::InvalidStatusTransition {
                from: self.name.label().to_string(),
                to: name.label().to_string(),
            });
        }
        self.name = name;
        self.message = message;
        Ok(())
    }

    fn allowed(from: StatusName, to: StatusName) -> bool {
        use StatusName::*;
        if from == to {
            return true;
        }
        match from {
            Created => matches!(to, Pending | Ready) || to.is_terminal(),
            Pending => matches!(to, Ready) || to.is_terminal(),
            Ready => matches!(to, Running) || to.is_terminal(),
            Running => matches!(to, Ready) || to.is_terminal(),
            // terminal states are final
            _ => false,
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}

/// One item of a resource requirement group, e.g. 4 slots of "cpus"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(rename = "type")]
    pub rtype: String,
    pub slots: u32,
}

impl ResourceRequest {
    pub fn new(rtype: impl Into<String>, slots: u32) -> Self {
        Self {
            rtype: rtype.into(),
            slots,
        }
    }
}

/// One alternative set of resource items; every item in the group must
/// be satisfied for the group to satisfy the case
pub type ResourceGroup = Vec<ResourceRequest>;

/// Edge acceptance filter: which upstream results let the edge count
/// as "met"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultFilter {
    /// Met when the upstream passed or diffed (the implicit policy)
    #[default]
    PassOrDiff,
    Success,
    Diff,
    /// Met on any terminal status
    Any,
}

impl ResultFilter {
    pub fn parse(s: &str) -> EngineResult<Self> {
        match s.trim() {
            "success" | "pass" => Ok(ResultFilter::Success),
            "diff" => Ok(ResultFilter::Diff),
            "success|diff" | "diff|success" => Ok(ResultFilter::PassOrDiff),
            "*" => Ok(ResultFilter::Any),
            other => Err(EngineError::InvalidExpression {
                expr: other.to_string(),
                reason: "expected one of: success, diff, success|diff, *".to_string(),
            }),
        }
    }

    /// Evaluate against the upstream status.  Returns `None` while the
    /// upstream is not terminal.
    pub fn met(self, upstream: StatusName) -> Option<bool> {
        if !upstream.is_terminal() {
            return None;
        }
        let ok = match self {
            ResultFilter::Success => upstream == StatusName::Success,
            ResultFilter::Diff => upstream == StatusName::Diff,
            ResultFilter::PassOrDiff => {
                matches!(upstream, StatusName::Success | StatusName::Diff)
            }
            ResultFilter::Any => true,
        };
        Some(ok)
    }
}

/// Required match cardinality for a dependency pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expect {
    /// `+`: at least one match
    AtLeastOne,
    /// `*`: any number of matches, including zero
    Any,
    /// Exactly this many matches
    Exactly(usize),
}

impl Default for Expect {
    fn default() -> Self {
        Expect::AtLeastOne
    }
}

impl Expect {
    pub fn parse(s: &str) -> EngineResult<Self> {
        match s.trim() {
            "+" => Ok(Expect::AtLeastOne),
            "*" => Ok(Expect::Any),
            other => other
                .parse::<usize>()
                .map(Expect::Exactly)
                .map_err(|_| EngineError::InvalidExpression {
                    expr: other.to_string(),
                    reason: "expected an integer, '+', or '*'".to_string(),
                }),
        }
    }

    pub fn satisfied_by(self, n: usize) -> bool {
        match self {
            Expect::AtLeastOne => n >= 1,
            Expect::Any => true,
            Expect::Exactly(k) => n == k,
        }
    }
}

/// An unresolved dependency pattern carried on a case until the
/// catalog-wide resolution pass turns it into explicit edges
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepPattern {
    /// `name`, `name.k=v`, or `dir/name.k=v`; values may be globs and
    /// may contain `${param}` substitutions
    pub pattern: String,
    #[serde(default)]
    pub result: ResultFilter,
    #[serde(default)]
    pub expect: Expect,
}

/// A resolved case-to-case dependency edge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepEdge {
    pub id: CaseId,
    #[serde(default)]
    pub result: ResultFilter,
}

/// Asset staging action applied to the case working directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Copy,
    Link,
    Source,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetAction {
    pub kind: AssetKind,
    pub src: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
}

/// Rebaseline action declared by the test file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineAction {
    /// Replace `dst` (in the source tree) with `src` (from the case
    /// working directory)
    Pair { src: String, dst: String },
    /// Re-run the test body with this flag
    Flag(String),
}

/// How a composite base case invokes the test body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeMode {
    /// Append this flag to the command line
    Flag(String),
    /// Run this override script instead of the test body
    Script(String),
}

/// A concrete, runnable test case
///
/// Everything except the runtime fields (`status`, `start`, `stop`,
/// `returncode`, `measurements`) is immutable after resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: CaseId,
    pub file_root: PathBuf,
    pub file_path: PathBuf,
    pub family: String,
    pub parameters: BTreeMap<String, Scalar>,
    pub keywords: BTreeSet<String>,
    #[serde(default)]
    pub owners: Vec<String>,
    /// Alternative resource groups; any one group satisfies the case
    pub resources: Vec<ResourceGroup>,
    pub timeout: Option<f64>,
    /// Expected exit code; 0 is a normal pass, -1 means any non-zero
    #[serde(default)]
    pub xstatus: i32,
    #[serde(default)]
    pub will_fail: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub assets: Vec<AssetAction>,
    #[serde(default)]
    pub baseline: Vec<BaselineAction>,
    #[serde(default)]
    pub pass_regex: Vec<String>,
    #[serde(default)]
    pub fail_regex: Vec<String>,
    #[serde(default)]
    pub skip_return_code: Option<i32>,
    /// Executable body (argv); run from the case working directory
    pub command: Vec<String>,
    #[serde(default)]
    pub composite: Option<CompositeMode>,
    /// Merged `set_attribute` map (right-wins)
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    /// Masked cases stay in the catalog but are never scheduled
    #[serde(default)]
    pub mask: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<DepEdge>,
    #[serde(default)]
    pub dep_patterns: Vec<DepPattern>,
    /// Expected runtime in seconds, used for scheduling and packing
    pub runtime_estimate: f64,
    #[serde(default)]
    pub attempts: u32,

    // runtime fields, written by the worker that owns the case
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stop: Option<DateTime<Utc>>,
    #[serde(default)]
    pub returncode: Option<i32>,
    #[serde(default)]
    pub measurements: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(skip)]
    pub assignment: Option<Assignment>,
}

impl TestCase {
    pub fn new(
        file_root: impl Into<PathBuf>,
        file_path: impl Into<PathBuf>,
        family: impl Into<String>,
        parameters: BTreeMap<String, Scalar>,
    ) -> Self {
        let file_root = file_root.into();
        let file_path = file_path.into();
        let family = family.into();
        let id = Self::compute_id(&file_root, &file_path, &family, &parameters);
        Self {
            id,
            file_root,
            file_path,
            family,
            parameters,
            keywords: BTreeSet::new(),
            owners: Vec::new(),
            resources: Vec::new(),
            timeout: None,
            xstatus: 0,
            will_fail: false,
            exclusive: false,
            assets: Vec::new(),
            baseline: Vec::new(),
            pass_regex: Vec::new(),
            fail_regex: Vec::new(),
            skip_return_code: None,
            command: Vec::new(),
            composite: None,
            attributes: BTreeMap::new(),
            mask: None,
            dependencies: Vec::new(),
            dep_patterns: Vec::new(),
            runtime_estimate: 60.0,
            attempts: 0,
            status: Status::new(),
            start: None,
            stop: None,
            returncode: None,
            measurements: BTreeMap::new(),
            working_directory: None,
            assignment: None,
        }
    }

    fn compute_id(
        file_root: &PathBuf,
        file_path: &PathBuf,
        family: &str,
        parameters: &BTreeMap<String, Scalar>,
    ) -> CaseId {
        let mut hasher = Sha256::new();
        hasher.update(file_root.to_string_lossy().as_bytes());
        hasher.update([0x1f]);
        hasher.update(file_path.to_string_lossy().as_bytes());
        hasher.update([0x1f]);
        hasher.update(family.as_bytes());
        for (name, value) in parameters {
            hasher.update([0x1f]);
            hasher.update(name.as_bytes());
            hasher.update([0x3d]);
            hasher.update(value.to_string().as_bytes());
        }
        let digest = hex::encode(hasher.finalize());
        CaseId(digest[..20].to_string())
    }

    /// Human-readable canonical name: `family.k=v.k=v` with parameters
    /// sorted by name
    pub fn display_name(&self) -> String {
        if self.parameters.is_empty() {
            return self.family.clone();
        }
        let params: Vec<String> = self
            .parameters
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        format!("{}.{}", self.family, params.join("."))
    }

    /// Processing cores the case occupies
    pub fn cpus(&self) -> u32 {
        if let Some(n) = self.parameters.get("cpus").and_then(Scalar::as_int) {
            return n.max(0) as u32;
        }
        self.resources
            .iter()
            .map(|group| {
                group
                    .iter()
                    .filter(|r| r.rtype == "cpus")
                    .map(|r| r.slots)
                    .sum::<u32>()
            })
            .max()
            .filter(|n| *n > 0)
            .unwrap_or(1)
    }

    /// GPU devices the case occupies
    pub fn gpus(&self) -> u32 {
        if let Some(n) = self.parameters.get("gpus").and_then(Scalar::as_int) {
            return n.max(0) as u32;
        }
        self.resources
            .iter()
            .map(|group| {
                group
                    .iter()
                    .filter(|r| r.rtype == "gpus")
                    .map(|r| r.slots)
                    .sum::<u32>()
            })
            .max()
            .unwrap_or(0)
    }

    /// Scheduling cost; larger cases dispatch first so long tests
    /// start earliest
    pub fn cost(&self) -> f64 {
        let cpus = self.cpus() as f64;
        (cpus * cpus + self.runtime_estimate * self.runtime_estimate).sqrt()
    }

    /// Whether the case participates in the session (unmasked)
    pub fn active(&self) -> bool {
        self.mask.is_none()
    }

    /// Attach the implicit keywords: family, parameter names, and the
    /// terminal status vocabulary used for post-hoc filtering
    pub fn attach_implicit_keywords(&mut self) {
        self.keywords.insert(self.family.clone());
        let names: Vec<String> = self.parameters.keys().cloned().collect();
        for name in names {
            self.keywords.insert(name);
        }
        for kw in ["ready", "success", "diff", "fail", "timeout"] {
            self.keywords.insert(kw.to_string());
        }
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
