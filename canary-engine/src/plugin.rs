//! Parser plugin surface
//!
//! One plugin per file suffix: `matches(path)` gates it, `parse`
//! returns `None` (not mine) or the draft specs for the file.  The
//! registry iterates plugins in priority order and takes the first
//! non-`None` answer.  A declarative TOML parser ships built in; any
//! richer surface syntax lives behind this interface.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::case::{
    AssetAction, AssetKind, BaselineAction, CompositeMode, DepPattern, Expect, ResourceGroup,
    ResultFilter, Scalar,
};
use crate::draft::{Conditional, DraftSpec, ParameterSet};
use crate::error::{EngineError, EngineResult};
use crate::when::When;

/// A post-session reporter (console, JUnit, dashboards).  Reporters
/// observe the finished catalog; they never mutate it.
pub trait Reporter: Send + Sync {
    fn name(&self) -> &'static str;

    fn report(&self, catalog: &crate::catalog::Catalog) -> EngineResult<()>;
}

/// A test-file parser
pub trait ParserPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this plugin understands the file
    fn matches(&self, path: &Path) -> bool;

    /// Parse one file into draft specs; `None` defers to the next
    /// plugin
    fn parse(&self, root: &Path, relpath: &Path) -> EngineResult<Option<Vec<DraftSpec>>>;
}

/// Priority-ordered plugin list
pub struct ParserRegistry {
    plugins: Vec<Arc<dyn ParserPlugin>>,
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ParserRegistry {
    /// Registry holding only the built-in TOML parser
    pub fn builtin() -> Self {
        Self {
            plugins: vec![Arc::new(TomlParser)],
        }
    }

    pub fn empty() -> Self {
        Self {
            plugins: Vec::new(),
        }
    }

    /// Register a plugin ahead of the existing ones (try-first)
    pub fn register_first(&mut self, plugin: Arc<dyn ParserPlugin>) {
        self.plugins.insert(0, plugin);
    }

    /// Register a plugin after the existing ones (try-last)
    pub fn register(&mut self, plugin: Arc<dyn ParserPlugin>) {
        self.plugins.push(plugin);
    }

    /// Parse one file with the first plugin that claims it
    pub fn parse_file(
        &self,
        root: &Path,
        relpath: &Path,
    ) -> EngineResult<Option<Vec<DraftSpec>>> {
        for plugin in &self.plugins {
            if !plugin.matches(relpath) {
                continue;
            }
            if let Some(drafts) = plugin.parse(root, relpath)? {
                return Ok(Some(drafts));
            }
        }
        Ok(None)
    }

    /// Walk `root` collecting drafts from every recognized file.
    /// Spec errors drop the affected file with a diagnostic; other
    /// files continue.
    pub fn discover(&self, root: &Path) -> EngineResult<Vec<DraftSpec>> {
        let mut drafts = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let entries = std::fs::read_dir(&dir).map_err(|e| {
                EngineError::Session(format!("cannot scan {}: {}", dir.display(), e))
            })?;
            for entry in entries.flatten() {
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') {
                    continue;
                }
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                let relpath = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
                match self.parse_file(root, &relpath) {
                    Ok(Some(found)) => {
                        debug!(file = %relpath.display(), drafts = found.len(), "parsed");
                        drafts.extend(found);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(file = %relpath.display(), error = %err, "dropping unparsable test file");
                    }
                }
            }
        }
        Ok(drafts)
    }
}

/// Built-in parser for declarative `*.canary.toml` test files
pub struct TomlParser;

pub const TOML_SUFFIX: &str = ".canary.toml";

impl ParserPlugin for TomlParser {
    fn name(&self) -> &'static str {
        "toml"
    }

    fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .map(|n| n.to_string_lossy().ends_with(TOML_SUFFIX))
            .unwrap_or(false)
    }

    fn parse(&self, root: &Path, relpath: &Path) -> EngineResult<Option<Vec<DraftSpec>>> {
        let file = root.join(relpath);
        let text = std::fs::read_to_string(&file).map_err(|e| EngineError::Parse {
            file: file.display().to_string(),
            reason: e.to_string(),
        })?;
        let raw: RawSpec = toml::from_str(&text).map_err(|e| EngineError::Parse {
            file: file.display().to_string(),
            reason: e.to_string(),
        })?;
        let draft = raw.into_draft(root, relpath)?;
        Ok(Some(vec![draft]))
    }
}

// serde shape of a *.canary.toml file

#[derive(Debug, Default, Deserialize)]
struct RawSpec {
    #[serde(default)]
    test: RawTest,
    #[serde(default)]
    parameterize: Vec<RawParameterize>,
    #[serde(default)]
    keywords: Vec<RawConditionalList>,
    #[serde(default)]
    timeouts: Vec<RawConditionalNumber>,
    #[serde(default)]
    depends_on: Vec<RawDependsOn>,
    #[serde(default)]
    copy: Vec<RawAsset>,
    #[serde(default)]
    link: Vec<RawAsset>,
    #[serde(default)]
    source: Vec<RawAsset>,
    #[serde(default)]
    baseline: Vec<RawBaseline>,
    #[serde(default)]
    set_attribute: Vec<RawAttributes>,
    #[serde(default)]
    analyze: Option<RawAnalyze>,
    #[serde(default)]
    enable: Vec<RawEnable>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTest {
    family: Option<String>,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    command: Vec<String>,
    timeout: Option<f64>,
    xstatus: Option<i32>,
    will_fail: Option<bool>,
    exclusive: Option<bool>,
    skipif: Option<String>,
    skip_return_code: Option<i32>,
    runtime: Option<f64>,
    #[serde(default)]
    owners: Vec<String>,
    #[serde(default)]
    pass_regex: Vec<String>,
    #[serde(default)]
    fail_regex: Vec<String>,
    /// Alternative resource groups, e.g.
    /// `[[{type = "gpus", slots = 2}], [{type = "cpus", slots = 8}]]`
    #[serde(default)]
    resource_groups: Vec<ResourceGroup>,
}

#[derive(Debug, Deserialize)]
struct RawParameterize {
    names: String,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    values: Vec<Vec<toml::Value>>,
    #[serde(default)]
    center: Vec<toml::Value>,
    #[serde(default)]
    steps: Vec<f64>,
    #[serde(default)]
    ranges: Vec<Vec<f64>>,
    #[serde(default)]
    samples: Option<usize>,
    #[serde(default)]
    seed: Option<u64>,
    when: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawConditionalList {
    value: Vec<String>,
    when: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawConditionalNumber {
    value: f64,
    when: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDependsOn {
    pattern: String,
    result: Option<String>,
    expect: Option<String>,
    when: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAsset {
    src: String,
    dst: Option<String>,
    when: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBaseline {
    src: Option<String>,
    dst: Option<String>,
    flag: Option<String>,
    when: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAttributes {
    #[serde(default)]
    attributes: BTreeMap<String, serde_json::Value>,
    when: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAnalyze {
    flag: Option<String>,
    script: Option<String>,
    when: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEnable {
    value: bool,
    when: Option<String>,
}

impl RawSpec {
    fn into_draft(self, root: &Path, relpath: &Path) -> EngineResult<DraftSpec> {
        let file = relpath.display().to_string();
        let stem = default_family(relpath);
        let family = self.test.family.clone().unwrap_or(stem);
        let mut draft = DraftSpec::new(root, relpath, family);
        draft.testnames = self.test.names.clone();
        if !self.test.keywords.is_empty() {
            draft
                .keywords
                .push(Conditional::unconditional(self.test.keywords.clone()));
        }
        for kw in &self.keywords {
            draft
                .keywords
                .push(Conditional::new(kw.value.clone(), parse_when(&kw.when, &file)?));
        }
        if let Some(timeout) = self.test.timeout {
            draft.timeouts.push(Conditional::unconditional(timeout));
        }
        for timeout in &self.timeouts {
            draft
                .timeouts
                .push(Conditional::new(timeout.value, parse_when(&timeout.when, &file)?));
        }
        if let Some(x) = self.test.xstatus {
            draft.xstatus.push(Conditional::unconditional(x));
        }
        if let Some(flag) = self.test.will_fail {
            draft.will_fail.push(Conditional::unconditional(flag));
        }
        if let Some(flag) = self.test.exclusive {
            draft.exclusive.push(Conditional::unconditional(flag));
        }
        draft.skip_reason = self.test.skipif.clone();
        draft.skip_return_code = self.test.skip_return_code;
        draft.runtime_estimate = self.test.runtime;
        draft.owners = self.test.owners.clone();
        draft.pass_regex = self.test.pass_regex.clone();
        draft.fail_regex = self.test.fail_regex.clone();
        draft.resource_groups = self.test.resource_groups.clone();
        draft.command = self.test.command.clone();

        for p in self.parameterize {
            draft.paramsets.push(p.into_paramset(&file)?);
        }

        for dep in &self.depends_on {
            let result = match &dep.result {
                Some(text) => ResultFilter::parse(text)?,
                None => ResultFilter::default(),
            };
            let expect = match &dep.expect {
                Some(text) => Expect::parse(text)?,
                None => Expect::default(),
            };
            draft.dep_patterns.push(Conditional::new(
                DepPattern {
                    pattern: dep.pattern.clone(),
                    result,
                    expect,
                },
                parse_when(&dep.when, &file)?,
            ));
        }

        for (kind, assets) in [
            (AssetKind::Copy, &self.copy),
            (AssetKind::Link, &self.link),
            (AssetKind::Source, &self.source),
        ] {
            for asset in assets {
                draft.assets.push(Conditional::new(
                    AssetAction {
                        kind,
                        src: asset.src.clone(),
                        dst: asset.dst.clone(),
                    },
                    parse_when(&asset.when, &file)?,
                ));
            }
        }

        for baseline in &self.baseline {
            let action = match (&baseline.src, &baseline.dst, &baseline.flag) {
                (Some(src), Some(dst), None) => BaselineAction::Pair {
                    src: src.clone(),
                    dst: dst.clone(),
                },
                (None, None, Some(flag)) => BaselineAction::Flag(flag.clone()),
                _ => {
                    return Err(EngineError::Parse {
                        file,
                        reason: "baseline needs either src+dst or flag".to_string(),
                    })
                }
            };
            draft
                .baseline
                .push(Conditional::new(action, parse_when(&baseline.when, &file)?));
        }

        for attrs in &self.set_attribute {
            draft.attributes.push(Conditional::new(
                attrs.attributes.clone(),
                parse_when(&attrs.when, &file)?,
            ));
        }

        if let Some(analyze) = &self.analyze {
            let mode = match (&analyze.flag, &analyze.script) {
                (Some(flag), None) => CompositeMode::Flag(flag.clone()),
                (None, Some(script)) => CompositeMode::Script(script.clone()),
                (None, None) => CompositeMode::Flag("--analyze".to_string()),
                _ => {
                    return Err(EngineError::Parse {
                        file,
                        reason: "analyze takes flag or script, not both".to_string(),
                    })
                }
            };
            draft.composite_base = Some(Conditional::new(mode, parse_when(&analyze.when, &file)?));
        }

        for enable in &self.enable {
            draft
                .enable
                .push(Conditional::new(enable.value, parse_when(&enable.when, &file)?));
        }

        Ok(draft)
    }
}

impl RawParameterize {
    fn into_paramset(self, file: &str) -> EngineResult<ParameterSet> {
        let names: Vec<String> = self
            .names
            .split(',')
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        let when = parse_when(&self.when, file)?;
        match self.kind.as_deref() {
            None | Some("list") => {
                let rows = self
                    .values
                    .iter()
                    .map(|row| row.iter().map(toml_scalar).collect::<EngineResult<Vec<_>>>())
                    .collect::<EngineResult<Vec<_>>>()?;
                Ok(ParameterSet::List { names, rows, when })
            }
            Some("centered") => {
                let center = self
                    .center
                    .iter()
                    .map(toml_scalar)
                    .collect::<EngineResult<Vec<_>>>()?;
                Ok(ParameterSet::Centered {
                    names,
                    center,
                    steps: self.steps,
                    when,
                })
            }
            Some("random") => {
                let ranges = self
                    .ranges
                    .iter()
                    .map(|pair| {
                        if pair.len() == 2 {
                            Ok((pair[0], pair[1]))
                        } else {
                            Err(EngineError::Parse {
                                file: file.to_string(),
                                reason: "random range must be [lo, hi]".to_string(),
                            })
                        }
                    })
                    .collect::<EngineResult<Vec<_>>>()?;
                Ok(ParameterSet::Random {
                    names,
                    ranges,
                    samples: self.samples.unwrap_or(10),
                    seed: self.seed.unwrap_or(1234),
                    when,
                })
            }
            Some(other) => Err(EngineError::Parse {
                file: file.to_string(),
                reason: format!("unknown parameter space kind {:?}", other),
            }),
        }
    }
}

fn default_family(relpath: &Path) -> String {
    let name = relpath
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.strip_suffix(TOML_SUFFIX).unwrap_or(&name).to_string()
}

fn parse_when(when: &Option<String>, file: &str) -> EngineResult<Option<When>> {
    match when {
        Some(text) => When::parse(text).map(Some).map_err(|e| EngineError::Parse {
            file: file.to_string(),
            reason: e.to_string(),
        }),
        None => Ok(None),
    }
}

fn toml_scalar(value: &toml::Value) -> EngineResult<Scalar> {
    match value {
        toml::Value::Integer(i) => Ok(Scalar::Int(*i)),
        toml::Value::Float(f) => Ok(Scalar::Float(*f)),
        toml::Value::String(s) => Ok(Scalar::Str(s.clone())),
        toml::Value::Boolean(b) => Ok(Scalar::Str(b.to_string())),
        other => Err(EngineError::Parse {
            file: String::new(),
            reason: format!("unsupported parameter value {:?}", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_spec(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn test_toml_parser_produces_draft() {
        let dir = tempfile::tempdir().unwrap();
        write_spec(
            dir.path(),
            "flow.canary.toml",
            r#"
[test]
keywords = ["3d", "mhd"]
command = ["./flow.sh"]
timeout = 600.0

[[parameterize]]
names = "a"
values = [[1], [2], [3]]

[[depends_on]]
pattern = "mesh.n=*"
result = "success"
expect = "+"
"#,
        );
        let registry = ParserRegistry::builtin();
        let drafts = registry
            .parse_file(dir.path(), Path::new("flow.canary.toml"))
            .unwrap()
            .unwrap();
        assert_eq!(drafts.len(), 1);
        let draft = &drafts[0];
        assert_eq!(draft.family, "flow");
        assert_eq!(draft.paramsets.len(), 1);
        assert_eq!(draft.dep_patterns.len(), 1);
        assert_eq!(draft.timeouts[0].value, 600.0);
    }

    #[test]
    fn test_discover_walks_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        write_spec(dir.path(), "a.canary.toml", "[test]\ncommand = [\"./a.sh\"]\n");
        write_spec(
            &dir.path().join("sub"),
            "b.canary.toml",
            "[test]\ncommand = [\"./b.sh\"]\n",
        );
        write_spec(dir.path(), "ignored.txt", "not a test");
        let registry = ParserRegistry::builtin();
        let drafts = registry.discover(dir.path()).unwrap();
        let mut families: Vec<String> = drafts.iter().map(|d| d.family.clone()).collect();
        families.sort();
        assert_eq!(families, vec!["a", "b"]);
    }

    #[test]
    fn test_bad_file_is_dropped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_spec(dir.path(), "bad.canary.toml", "not [valid toml");
        write_spec(dir.path(), "good.canary.toml", "[test]\ncommand = [\"./g.sh\"]\n");
        let registry = ParserRegistry::builtin();
        let drafts = registry.discover(dir.path()).unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].family, "good");
    }

    #[test]
    fn test_analyze_section_sets_composite_base() {
        let dir = tempfile::tempdir().unwrap();
        write_spec(
            dir.path(),
            "t.canary.toml",
            r#"
[test]
command = ["./t.sh"]

[[parameterize]]
names = "n"
values = [[1], [2]]

[analyze]
flag = "--base"
"#,
        );
        let registry = ParserRegistry::builtin();
        let drafts = registry
            .parse_file(dir.path(), Path::new("t.canary.toml"))
            .unwrap()
            .unwrap();
        assert!(drafts[0].composite_base.is_some());
    }
}
