use crate::errors::CoworkError;
use anyhow::{Context, Result};
use regex::Regex;
use std::sync::LazyLock;

mod ast;


pub use ast::{AstViolation, ViolationKind, scan_command};

/// Built-in deny patterns. These cannot be removed by configuration;
/// user-supplied patterns are only ever added on top.
const BUILTIN_PATTERNS: &[&str] = &[
    // Privilege escalation
    r"(?:^|[;&|]\s*)\s*(?:sudo|doas)\b",
    r"(?:^|[;&|]\s*)\s*su\s+(?:-|root)\b",
    // Recursive deletion of the filesystem root
    r"\brm\s+(?:-[a-zA-Z]*[rf][a-zA-Z]*\s+)+(?:--\s+)?(?:/|/\*)\s*$",
    r"\brm\s+(?:-[a-zA-Z]*[rf][a-zA-Z]*\s+)+(?:--\s+)?(?:/|/\*)\s",
    // Pipe-to-shell downloads
    r"\b(?:curl|wget)\b[^|;&]*\|\s*(?:sudo\s+)?(?:sh|bash|zsh|dash|ksh)\b",
    // Fork bomb
    r":\(\)\s*\{.*\};\s*:",
    // Disk-format utilities and raw device writes
    r"\bmkfs(?:\.\w+)?\b",
    r"\bdiskpart\b",
    r"\bdd\b[^;|&]*\bof=/dev/",
    r">\s*/dev/(?:sd|nvme|hd|vd|disk)",
    // Host power control
    r"\b(?:shutdown|reboot|poweroff)\b",
];

/// Shells/interpreters that are dangerous as pipe targets.
const DANGEROUS_PIPE_TARGETS: &[&str] = &[
    "bash", "sh", "zsh", "dash", "ksh", "csh", "tcsh", "fish", "python", "python3", "python2",
    "perl", "ruby", "node", "php",
];

/// Known prefix commands that wrap another command.
const PREFIX_COMMANDS: &[&str] = &["sudo", "env", "command", "nohup", "nice", "time", "doas", "xargs"];

static BUILTINS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    BUILTIN_PATTERNS
        .iter()
        .map(|p| Regex::new(p).expect("builtin guardrail pattern"))
        .collect()
});

/// Shell command inspector: a compiled regex deny list (built-ins plus
/// configured additions), a quote-aware pipeline tokenizer, and a
/// structural AST pass.
pub struct GuardrailEngine {
    extra_patterns: Vec<Regex>,
}

impl GuardrailEngine {
    pub fn new(additional_patterns: &[String]) -> Result<Self> {
        let extra_patterns = additional_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("invalid guardrail pattern: {p}")))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { extra_patterns })
    }

    /// Inspect a shell command. Returns `CommandGuardrail` on any match.
    pub fn inspect(&self, command: &str) -> Result<(), CoworkError> {
        // Normalize shell line continuations before checks so that
        // "rm \\\n-rf /" is treated as "rm -rf /" by the patterns below.
        let command = command.replace("\\\n", " ");

        // Structural analysis first: catches what regex can't reliably see
        // (pipe targets, device redirections, eval). Parse failure falls
        // through silently to the regex and tokenizer layers.
        if let Some(v) = scan_command(&command).into_iter().next() {
            return Err(CoworkError::CommandGuardrail(format!(
                "{} ({:?})",
                v.description, v.kind
            )));
        }

        for pattern in BUILTINS.iter().chain(self.extra_patterns.iter()) {
            if pattern.is_match(&command) {
                return Err(CoworkError::CommandGuardrail(
                    "command matches a blocked pattern".to_string(),
                ));
            }
        }

        // Tokenizer fallback: any pipeline segment after the first whose
        // command is a shell/interpreter means piped code execution.
        if let Some(target) = pipe_target_violation(&command) {
            return Err(CoworkError::CommandGuardrail(format!(
                "piping into '{target}' allows arbitrary code execution"
            )));
        }

        Ok(())
    }
}

/// Extract the base command name from a shell command segment.
/// Handles leading env vars (FOO=bar cmd), sudo/command prefixes,
/// and returns the first actual executable token.
pub fn extract_command_name(segment: &str) -> String {
    let segment = segment.trim();
    // shlex handles quoting/escaping; fall back to whitespace splitting
    // when the input is malformed.
    let parts = shlex::split(segment)
        .unwrap_or_else(|| segment.split_whitespace().map(String::from).collect());
    let mut found_prefix = false;
    for part in &parts {
        // Skip env var assignments (KEY=value)
        if part.contains('=') && !part.starts_with('-') {
            continue;
        }
        // Skip flags (e.g., sudo -u root, env -i, nice -n 10)
        if found_prefix && part.starts_with('-') {
            continue;
        }
        // Basename in case of full path like /usr/bin/ls
        let name = part.rsplit('/').next().unwrap_or(part);
        if PREFIX_COMMANDS.contains(&name) {
            found_prefix = true;
            continue;
        }
        return name.to_string();
    }
    segment.to_string()
}

/// Split a command into pipeline/chain segments, respecting single and
/// double quoting so operators inside quoted strings (e.g.
/// `jq '.[] | .name'`) are not treated as separators. Returns
/// `(segment, piped_into)` pairs where `piped_into` is true when the
/// segment is the target of a `|`.
fn split_segments(command: &str) -> Vec<(String, bool)> {
    let bytes = command.as_bytes();
    let len = bytes.len();
    let mut segments = Vec::new();
    let mut seg_start = 0;
    let mut i = 0;
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;
    let mut next_is_pipe_target = false;

    let mut push = |start: usize, end: usize, piped: bool, out: &mut Vec<(String, bool)>| {
        let seg = command[start..end].trim();
        if !seg.is_empty() {
            out.push((seg.to_string(), piped));
        }
    };

    while i < len {
        if escaped {
            escaped = false;
            i += 1;
            continue;
        }
        let ch = bytes[i];
        if ch == b'\\' && !in_single {
            escaped = true;
            i += 1;
            continue;
        }
        if ch == b'\'' && !in_double {
            in_single = !in_single;
            i += 1;
            continue;
        }
        if ch == b'"' && !in_single {
            in_double = !in_double;
            i += 1;
            continue;
        }
        if !in_single && !in_double {
            let rest = &command[i..];
            let (op_len, is_pipe) = if rest.starts_with("&&") || rest.starts_with("||") {
                (Some(2), false)
            } else if ch == b'|' {
                (Some(1), true)
            } else if matches!(ch, b';' | b'\n') {
                (Some(1), false)
            } else {
                (None, false)
            };
            if let Some(op) = op_len {
                push(seg_start, i, next_is_pipe_target, &mut segments);
                next_is_pipe_target = is_pipe;
                i += op;
                seg_start = i;
                continue;
            }
        }
        i += 1;
    }
    push(seg_start, len, next_is_pipe_target, &mut segments);
    segments
}

/// Returns the offending interpreter name if any pipeline segment pipes
/// into a shell or interpreter.
fn pipe_target_violation(command: &str) -> Option<String> {
    for (segment, piped_into) in split_segments(command) {
        if !piped_into {
            continue;
        }
        let name = extract_command_name(&segment);
        if DANGEROUS_PIPE_TARGETS.contains(&name.as_str()) {
            return Some(name);
        }
    }
    None
}

/// Extract all command names from a shell pipeline/chain.
pub fn extract_all_commands(command: &str) -> Vec<String> {
    split_segments(command)
        .into_iter()
        .map(|(seg, _)| extract_command_name(&seg))
        .collect()
}
