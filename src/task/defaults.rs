//! Task defaulting, prompt sanitization and directory validation.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

use super::task::{short_id, Task};
use crate::config::Config;
use crate::error::DispatchError;

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").expect("valid ANSI regex"));

/// Timeout tiers, checked in order. The first tier with a whole-word match wins.
static TIMEOUT_TIERS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (
            &["refactor", "migrate", "migration", "rewrite", "overhaul", "redesign"][..],
            "60m",
        ),
        (
            &["build", "implement", "feature", "create", "develop", "integrate", "add"][..],
            "30m",
        ),
        (
            &["fix", "debug", "bug", "patch", "repair", "troubleshoot"][..],
            "15m",
        ),
        (
            &[
                "read", "list", "show", "explain", "summarize", "check", "status", "query",
                "what", "find",
            ][..],
            "5m",
        ),
    ]
    .into_iter()
    .map(|(words, timeout)| (word_regex(words), timeout))
    .collect()
});

/// Fallback when no timeout tier matches.
pub const DEFAULT_TIMEOUT: &str = "15m";

/// Build a case-insensitive whole-word alternation.
pub(crate) fn word_regex(words: &[&str]) -> Regex {
    let alternation = words
        .iter()
        .map(|w| regex::escape(w))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternation)).expect("valid keyword regex")
}

/// Infer a timeout from the wording of a prompt.
pub fn estimate_timeout(prompt: &str) -> &'static str {
    TIMEOUT_TIERS
        .iter()
        .find(|(re, _)| re.is_match(prompt))
        .map(|(_, timeout)| *timeout)
        .unwrap_or(DEFAULT_TIMEOUT)
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(format!("{}{}", home, &path[1..]));
        }
    }
    PathBuf::from(path)
}

/// Strip NUL bytes and ANSI escapes, then truncate to `max_len` bytes on a
/// character boundary.
pub fn sanitize_prompt(prompt: &str, max_len: usize) -> String {
    let mut clean = prompt.replace('\0', "");
    if clean.contains('\x1b') {
        clean = ANSI_ESCAPE.replace_all(&clean, "").into_owned();
    }
    if clean.len() != prompt.len() {
        tracing::debug!(
            removed = prompt.len() - clean.len(),
            "Sanitized control sequences from prompt"
        );
    }

    if max_len > 0 && clean.len() > max_len {
        let mut cut = max_len;
        while !clean.is_char_boundary(cut) {
            cut -= 1;
        }
        tracing::warn!(
            original = clean.len(),
            max = max_len,
            "Prompt exceeds maximum length, truncating"
        );
        clean.truncate(cut);
    }
    clean
}

/// Fill empty task fields from the config and the task's agent.
///
/// Applying this twice leaves the task unchanged.
pub fn fill_defaults(cfg: &Config, task: &mut Task) {
    if task.id.is_empty() {
        task.id = Uuid::new_v4().to_string();
    }
    if task.session_id.is_empty() {
        task.session_id = Uuid::new_v4().to_string();
    }
    if task.name.is_empty() {
        task.name = format!("task-{}", short_id(&task.id));
    }
    if task.model.is_empty() {
        task.model = cfg.default_model.clone();
    }
    if task.permission_mode.is_empty() {
        task.permission_mode = cfg.default_permission_mode.clone();
    }
    if task.budget == 0.0 {
        task.budget = cfg.default_budget;
    }

    let default_workdir = expand_home(&cfg.default_workdir.to_string_lossy())
        .to_string_lossy()
        .into_owned();
    if task.workdir.is_empty() {
        task.workdir = default_workdir.clone();
    }
    task.workdir = expand_home(&task.workdir).to_string_lossy().into_owned();
    for dir in task.add_dirs.iter_mut() {
        *dir = expand_home(dir).to_string_lossy().into_owned();
    }

    if let Some(agent) = cfg.agent(&task.agent) {
        if !agent.model.is_empty() && task.model == cfg.default_model {
            task.model = agent.model.clone();
        }
        if !agent.permission_mode.is_empty()
            && task.permission_mode == cfg.default_permission_mode
        {
            task.permission_mode = agent.permission_mode.clone();
        }
        if agent.budget > 0.0 && task.budget == cfg.default_budget {
            task.budget = agent.budget;
        }
        if task.system_prompt.is_empty() && !agent.system_prompt.is_empty() {
            task.system_prompt = agent.system_prompt.clone();
        }
        if let Some(workdir) = &agent.workdir {
            if task.workdir == default_workdir {
                task.workdir = expand_home(&workdir.to_string_lossy())
                    .to_string_lossy()
                    .into_owned();
            }
        }
    }

    if task.timeout.is_empty() {
        task.timeout = estimate_timeout(&task.prompt).to_string();
    }
    task.prompt = sanitize_prompt(&task.prompt, cfg.max_prompt_len);
}

/// Check that the task's workdir and extra dirs fall inside the allow-list.
///
/// An agent's own list takes precedence over the global one; an empty list
/// allows everything.
pub fn validate_dirs(cfg: &Config, task: &Task) -> Result<(), DispatchError> {
    let allowed = match cfg.agent(&task.agent) {
        Some(agent) if !agent.allowed_dirs.is_empty() => &agent.allowed_dirs,
        _ => &cfg.allowed_dirs,
    };
    if allowed.is_empty() {
        return Ok(());
    }
    let allowed: Vec<String> = allowed.iter().map(|d| normalize_dir(d)).collect();

    let check = |kind: &'static str, dir: &str| -> Result<(), DispatchError> {
        let normalized = normalize_dir(dir);
        if allowed.iter().any(|a| normalized.starts_with(a.as_str())) {
            Ok(())
        } else {
            Err(DispatchError::DirectoryNotAllowed {
                kind,
                path: dir.to_string(),
            })
        }
    };

    if !task.workdir.is_empty() {
        check("workdir", &task.workdir)?;
    }
    for dir in &task.add_dirs {
        check("add_dir", dir)?;
    }
    Ok(())
}

/// Expand `~`, make absolute, resolve `.`/`..` lexically and add a trailing separator.
fn normalize_dir(dir: &str) -> String {
    let expanded = expand_home(dir);
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(expanded)
    };

    let mut clean = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::ParentDir => {
                clean.pop();
            }
            Component::CurDir => {}
            other => clean.push(other.as_os_str()),
        }
    }

    let mut out = clean.to_string_lossy().into_owned();
    if !out.ends_with(std::path::MAIN_SEPARATOR) {
        out.push(std::path::MAIN_SEPARATOR);
    }
    out
}

/// Whether `path` lies under `root` after normalization.
pub fn is_within(root: &Path, path: &Path) -> bool {
    normalize_dir(&path.to_string_lossy()).starts_with(&normalize_dir(&root.to_string_lossy()))
}
