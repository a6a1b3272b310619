//! Slurm backend: sbatch submission, squeue/sacct polling, scancel

use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::backend::{Job, SchedulerBackend, SubmitSpec};
use crate::error::{HpcError, HpcResult};

pub struct Slurm {
    node_count: u32,
    cpus_per_node: u32,
    gpus_per_node: u32,
}

impl Slurm {
    pub fn new(node_count: u32, cpus_per_node: u32, gpus_per_node: u32) -> Self {
        Self {
            node_count: node_count.max(1),
            cpus_per_node: cpus_per_node.max(1),
            gpus_per_node,
        }
    }

    /// Describe the allocation from the usual SLURM_* variables, with
    /// local-machine fallbacks
    pub fn from_environment() -> Self {
        let node_count = env_u32("SLURM_NNODES").or_else(|| env_u32("SLURM_JOB_NUM_NODES"));
        let cpus_per_node = env_u32("SLURM_CPUS_ON_NODE");
        let gpus_per_node = env_u32("SLURM_GPUS_PER_NODE");
        Self::new(
            node_count.unwrap_or(1),
            cpus_per_node.unwrap_or_else(|| num_cpus::get() as u32),
            gpus_per_node.unwrap_or(0),
        )
    }
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok()?.parse().ok()
}

#[async_trait]
impl SchedulerBackend for Slurm {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn node_count(&self) -> u32 {
        self.node_count
    }

    fn count_per_node(&self, rtype: &str) -> Option<u32> {
        match rtype {
            "cpus" => Some(self.cpus_per_node),
            "gpus" => Some(self.gpus_per_node),
            _ => None,
        }
    }

    fn polling_frequency(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn submit(&self, spec: SubmitSpec) -> HpcResult<Box<dyn Job>> {
        let script = render_script(&spec);
        if let Some(parent) = spec.scriptname.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&spec.scriptname, script)?;

        let output = Command::new("sbatch")
            .arg(&spec.scriptname)
            .output()
            .await
            .map_err(|e| HpcError::Backend(format!("sbatch: {e}")))?;
        if !output.status.success() {
            return Err(HpcError::Backend(format!(
                "sbatch failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let jobid = parse_jobid(&stdout).ok_or_else(|| {
            HpcError::Backend(format!("cannot parse sbatch output: {stdout:?}"))
        })?;
        debug!(job = %spec.name, %jobid, "submitted to slurm");
        Ok(Box::new(SlurmJob { jobid }))
    }
}

struct SlurmJob {
    jobid: String,
}

#[async_trait]
impl Job for SlurmJob {
    fn id(&self) -> String {
        self.jobid.clone()
    }

    async fn poll(&mut self) -> HpcResult<Option<i32>> {
        // queued or running while squeue still reports the job
        let queued = Command::new("squeue")
            .args(["-h", "-o", "%t", "-j", &self.jobid])
            .output()
            .await
            .map_err(|e| HpcError::Backend(format!("squeue: {e}")))?;
        if queued.status.success() {
            let state = String::from_utf8_lossy(&queued.stdout);
            if !state.trim().is_empty() {
                return Ok(None);
            }
        }
        // gone from the queue: ask sacct for the exit code
        let done = Command::new("sacct")
            .args(["-n", "-X", "-P", "-o", "State,ExitCode", "-j", &self.jobid])
            .output()
            .await
            .map_err(|e| HpcError::Backend(format!("sacct: {e}")))?;
        let text = String::from_utf8_lossy(&done.stdout);
        Ok(Some(parse_exit_code(&text)))
    }

    async fn cancel(&mut self) -> HpcResult<()> {
        let status = Command::new("scancel")
            .arg(&self.jobid)
            .status()
            .await
            .map_err(|e| HpcError::Backend(format!("scancel: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(HpcError::Backend(format!(
                "scancel {} exited with {:?}",
                self.jobid,
                status.code()
            )))
        }
    }
}

fn render_script(spec: &SubmitSpec) -> String {
    let mut script = String::new();
    script.push_str("#!/bin/sh\n");
    script.push_str(&format!("#SBATCH --job-name={}\n", spec.name));
    script.push_str(&format!("#SBATCH --nodes={}\n", spec.nodes));
    script.push_str(&format!("#SBATCH --time={}\n", hhmmss(spec.qtime)));
    script.push_str(&format!("#SBATCH --output={}\n", spec.output.display()));
    script.push_str(&format!("#SBATCH --error={}\n", spec.error.display()));
    for flag in &spec.submit_flags {
        script.push_str(&format!("#SBATCH {}\n", flag));
    }
    for (var, value) in &spec.variables {
        script.push_str(&format!("export {}={}\n", var, value));
    }
    for command in &spec.commands {
        script.push_str(&format!("{}\n", command));
    }
    script
}

fn parse_jobid(stdout: &str) -> Option<String> {
    // "Submitted batch job 123456"
    stdout
        .split_whitespace()
        .last()
        .filter(|token| token.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
}

fn parse_exit_code(sacct_output: &str) -> i32 {
    for line in sacct_output.lines() {
        let mut fields = line.trim().split('|');
        let state = fields.next().unwrap_or_default();
        let exit = fields.next().unwrap_or_default();
        if state.starts_with("COMPLETED") {
            return 0;
        }
        if let Some((code, _signal)) = exit.split_once(':') {
            if let Ok(code) = code.parse::<i32>() {
                return if code == 0 && !state.starts_with("COMPLETED") {
                    1
                } else {
                    code
                };
            }
        }
    }
    1
}

fn hhmmss(seconds: f64) -> String {
    let total = seconds.ceil() as u64;
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_render_script_headers() {
        let spec = SubmitSpec {
            name: "canary.abc1234".to_string(),
            commands: vec!["canary hpc-exec abc".to_string()],
            nodes: 2,
            scriptname: "/tmp/canary-inp.sh".into(),
            output: "/tmp/canary-out.txt".into(),
            error: "/tmp/canary-out.txt".into(),
            submit_flags: vec!["--account=ABC".to_string()],
            variables: BTreeMap::from([("CANARY_BATCH_ID".to_string(), "abc".to_string())]),
            qtime: 3700.0,
        };
        let script = render_script(&spec);
        assert!(script.contains("#SBATCH --nodes=2"));
        assert!(script.contains("#SBATCH --time=01:01:40"));
        assert!(script.contains("#SBATCH --account=ABC"));
        assert!(script.contains("export CANARY_BATCH_ID=abc"));
        assert!(script.ends_with("canary hpc-exec abc\n"));
    }

    #[test]
    fn test_parse_jobid() {
        assert_eq!(
            parse_jobid("Submitted batch job 123456\n").as_deref(),
            Some("123456")
        );
        assert!(parse_jobid("error: something").is_none());
    }

    #[test]
    fn test_parse_exit_code() {
        assert_eq!(parse_exit_code("COMPLETED|0:0\n"), 0);
        assert_eq!(parse_exit_code("FAILED|17:0\n"), 17);
        assert_eq!(parse_exit_code("TIMEOUT|0:1\n"), 1);
        assert_eq!(parse_exit_code(""), 1);
    }

    #[test]
    fn test_hhmmss() {
        assert_eq!(hhmmss(0.0), "00:00:00");
        assert_eq!(hhmmss(90.0), "00:01:30");
        assert_eq!(hhmmss(3661.0), "01:01:01");
    }
}
