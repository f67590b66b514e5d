use crate::config::SandboxConfig;
use crate::utils::cancel::CancelToken;
use crate::utils::subprocess::{scrubbed_command, truncate_at_utf8_boundary};
use anyhow::Result;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};


/// Per-stream output cap before truncation. A marker is appended and the
/// cut never splits a UTF-8 character.
const MAX_STREAM_BYTES: usize = 512 * 1024;
const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// One shell execution request. The runner holds no state between runs.
pub struct ExecSpec<'a> {
    pub command: &'a str,
    pub workdir: &'a Path,
    pub workspace_root: &'a Path,
    pub allow_network: bool,
    pub timeout: Duration,
    pub cancel: &'a CancelToken,
}

/// Result of a sandboxed execution.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Render stdout + stderr the way tool results expect them.
    pub fn combined_output(&self) -> String {
        let mut out = String::new();
        if !self.stdout.is_empty() {
            out.push_str(&self.stdout);
        }
        if !self.stderr.is_empty() {
            if !out.is_empty() {
                out.push_str("\n--- stderr ---\n");
            }
            out.push_str(&self.stderr);
        }
        if out.is_empty() {
            out.push_str("(no output)");
        }
        out
    }
}

/// Isolation strategy resolved once per run from config and host support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    SandboxExec,
    Docker,
    Fallback,
}

/// Executes shell commands with the strongest available isolation:
/// `sandbox-exec` on macOS, a one-shot Docker container elsewhere, and a
/// plain child process (timeout + scrubbed env + output caps) as fallback.
pub struct SandboxRunner {
    config: SandboxConfig,
}

impl SandboxRunner {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Pick the strategy for this host. `auto` prefers OS isolation and
    /// degrades to the fallback runner when neither is available.
    pub fn strategy(&self) -> Strategy {
        match self.config.mode.as_str() {
            "none" => Strategy::Fallback,
            "sandbox-exec" => Strategy::SandboxExec,
            "docker" => Strategy::Docker,
            _ => {
                if cfg!(target_os = "macos") && binary_exists("sandbox-exec") {
                    Strategy::SandboxExec
                } else if binary_exists("docker") {
                    Strategy::Docker
                } else {
                    Strategy::Fallback
                }
            }
        }
    }

    pub async fn run(&self, spec: ExecSpec<'_>) -> Result<ExecOutcome> {
        let strategy = self.strategy();
        debug!(?strategy, "sandbox run: {}", spec.command);
        let mut cmd = match strategy {
            Strategy::SandboxExec => self.build_sandbox_exec(&spec),
            Strategy::Docker => self.build_docker(&spec),
            Strategy::Fallback => build_fallback(&spec),
        };
        cmd.kill_on_drop(true);

        let started = Instant::now();
        let result = tokio::select! {
            output = tokio::time::timeout(spec.timeout, cmd.output()) => output,
            () = spec.cancel.cancelled() => {
                return Err(crate::errors::CoworkError::Cancelled.into());
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(Ok(output)) => {
                let (stdout, stdout_truncated) = cap_stream(&output.stdout);
                let (stderr, stderr_truncated) = cap_stream(&output.stderr);
                Ok(ExecOutcome {
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout,
                    stderr,
                    stdout_truncated,
                    stderr_truncated,
                    duration_ms,
                    timed_out: false,
                })
            }
            Ok(Err(e)) => Err(anyhow::anyhow!("failed to spawn command: {e}")),
            Err(_) => {
                // Timeout: kill_on_drop reaps the child when cmd drops
                warn!(
                    "command timed out after {}s: {}",
                    spec.timeout.as_secs(),
                    spec.command
                );
                Ok(ExecOutcome {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: format!("command timed out after {}s", spec.timeout.as_secs()),
                    stdout_truncated: false,
                    stderr_truncated: false,
                    duration_ms,
                    timed_out: true,
                })
            }
        }
    }

    fn build_sandbox_exec(&self, spec: &ExecSpec<'_>) -> Command {
        let profile = generate_profile(
            spec.workspace_root,
            spec.allow_network,
            &self.config.additional_read_paths,
            &self.config.additional_write_paths,
        );
        let mut cmd = scrubbed_command("sandbox-exec");
        cmd.arg("-p").arg(profile);
        cmd.arg("sh").arg("-c").arg(spec.command);
        cmd.current_dir(spec.workdir);
        cmd
    }

    fn build_docker(&self, spec: &ExecSpec<'_>) -> Command {
        let args = docker_args(
            &self.config.docker_image,
            spec.workspace_root,
            spec.allow_network,
            self.config.docker_memory_mb,
            self.config.docker_cpus,
            spec.command,
        );
        let mut cmd = scrubbed_command("docker");
        cmd.args(args);
        cmd
    }
}

fn build_fallback(spec: &ExecSpec<'_>) -> Command {
    let mut cmd = scrubbed_command("sh");
    cmd.arg("-c").arg(spec.command);
    cmd.current_dir(spec.workdir);
    cmd
}

fn cap_stream(bytes: &[u8]) -> (String, bool) {
    if bytes.len() <= MAX_STREAM_BYTES {
        return (String::from_utf8_lossy(bytes).to_string(), false);
    }
    let cut = truncate_at_utf8_boundary(bytes, MAX_STREAM_BYTES);
    let mut text = String::from_utf8_lossy(cut).to_string();
    text.push_str(TRUNCATION_MARKER);
    (text, true)
}

fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH").is_some_and(|paths| {
        std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
    })
}

/// Generate a deny-by-default `sandbox-exec` profile: read-only system
/// paths, read-write workspace + temp, localhost-only network unless
/// network permission was granted.
pub fn generate_profile(
    workspace: &Path,
    allow_network: bool,
    extra_read: &[String],
    extra_write: &[String],
) -> String {
    let mut profile = String::from(
        "(version 1)\n\
         (deny default)\n\
         (allow process-fork)\n\
         (allow process-exec)\n\
         (allow sysctl-read)\n\
         (allow mach-lookup)\n\
         (allow file-read-metadata)\n",
    );

    let mut read_only = vec![
        "/usr", "/lib", "/lib64", "/bin", "/sbin", "/etc", "/System", "/Library", "/opt",
        "/private/etc", "/dev/null", "/dev/urandom",
    ]
    .into_iter()
    .map(String::from)
    .collect::<Vec<_>>();
    read_only.extend(extra_read.iter().cloned());
    for path in &read_only {
        profile.push_str(&format!("(allow file-read* (subpath \"{path}\"))\n"));
    }

    let mut read_write = vec![
        workspace.to_string_lossy().to_string(),
        "/tmp".to_string(),
        "/private/tmp".to_string(),
        "/var/tmp".to_string(),
    ];
    read_write.extend(extra_write.iter().cloned());
    for path in &read_write {
        profile.push_str(&format!(
            "(allow file-read* file-write* (subpath \"{path}\"))\n"
        ));
    }

    if allow_network {
        profile.push_str("(allow network*)\n");
    } else {
        profile.push_str("(allow network* (remote ip \"localhost:*\"))\n");
    }

    profile
}

/// Build the `docker run` argument list for a one-shot container: no
/// network unless allowed, read-only root FS, workspace bind-mounted at a
/// fixed path, cpu/memory caps, tmpfs `/tmp`.
pub fn docker_args(
    image: &str,
    workspace: &Path,
    allow_network: bool,
    memory_mb: u32,
    cpus: f32,
    command: &str,
) -> Vec<String> {
    let mut args = vec!["run".to_string(), "--rm".to_string()];
    if !allow_network {
        args.push("--network=none".to_string());
    }
    args.push("--read-only".to_string());
    args.push("--tmpfs".to_string());
    args.push("/tmp:rw,size=256m".to_string());
    args.push("--memory".to_string());
    args.push(format!("{memory_mb}m"));
    args.push("--cpus".to_string());
    args.push(format!("{cpus}"));
    args.push("-v".to_string());
    args.push(format!("{}:/workspace", workspace.display()));
    args.push("-w".to_string());
    args.push("/workspace".to_string());
    args.push(image.to_string());
    args.push("sh".to_string());
    args.push("-c".to_string());
    args.push(command.to_string());
    args
}
