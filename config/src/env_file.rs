//! Dev-mode `.env.local` loader.
//!
//! Mirrors dotenv's line grammar closely enough for local development:
//! `KEY=VALUE` per line, optional `export ` prefix, `#` comments and blank
//! lines skipped, matching single or double quotes stripped from the value.
//! Already-set process variables are never overwritten.

use std::path::{Path, PathBuf};

/// File name probed for local overrides.
pub const LOCAL_ENV_FILE: &str = ".env.local";

/// Parse one line into a `(key, value)` pair, or `None` for comments,
/// blanks, and lines without a key before the first `=`.
#[must_use]
pub fn parse_env_line(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }

    let normalized = trimmed.strip_prefix("export ").map_or(trimmed, str::trim);
    let (key, value) = normalized.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    let mut value = value.trim();
    if value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')))
    {
        value = &value[1..value.len() - 1];
    }

    Some((key.to_string(), value.to_string()))
}

/// Candidate locations for `.env.local`, probed in order.
#[must_use]
pub fn candidate_paths() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd.join(LOCAL_ENV_FILE));
    }
    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent();
        for _ in 0..3 {
            let Some(current) = dir else { break };
            let candidate = current.join(LOCAL_ENV_FILE);
            if !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
            dir = current.parent();
        }
    }
    candidates
}

/// Load variables from `path` into the process environment without
/// overwriting anything already set. Returns the number of variables applied.
pub fn apply_env_file(path: &Path) -> std::io::Result<usize> {
    let content = std::fs::read_to_string(path)?;
    let mut applied = 0;
    for line in content.lines() {
        let Some((key, value)) = parse_env_line(line) else {
            continue;
        };
        if std::env::var_os(&key).is_none() {
            // Single-threaded startup path; no concurrent env access yet.
            unsafe { std::env::set_var(&key, &value) };
            applied += 1;
        }
    }
    Ok(applied)
}

/// Load the first `.env.local` found among the candidates.
///
/// Best-effort: absence is normal (logged at debug), read failures are
/// logged and otherwise ignored so startup never fails on a dev convenience.
pub fn load_local_env() {
    let Some(path) = candidate_paths().into_iter().find(|p| p.exists()) else {
        tracing::debug!("no {LOCAL_ENV_FILE} found, skip loading");
        return;
    };

    match apply_env_file(&path) {
        Ok(applied) => {
            tracing::info!(path = %path.display(), applied, "{LOCAL_ENV_FILE} loaded");
        }
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "failed to load {LOCAL_ENV_FILE}");
        }
    }
}
