//! `.env` loading, run before logging so `RUST_LOG` can come from the file.
//!
//! The file is taken from `--env-file`, then `TADO_LOCAL_ENV_FILE`, then
//! `./.env` in the working directory. Variables already present in the
//! process environment always win over the file.

use std::ffi::OsString;
use std::path::PathBuf;

use crate::config;

pub const ENV_FILE_VARIABLE: &str = "TADO_LOCAL_ENV_FILE";

/// Keys read outside [`config::Config::from_env`].
const PROCESS_VARIABLES: &[&str] = &["RUST_LOG", ENV_FILE_VARIABLE];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EnvOrigin {
    Cli,
    Variable,
    WorkingDir,
}

impl EnvOrigin {
    fn describe(self) -> &'static str {
        match self {
            EnvOrigin::Cli => "--env-file",
            EnvOrigin::Variable => ENV_FILE_VARIABLE,
            EnvOrigin::WorkingDir => "working directory",
        }
    }
}

#[derive(Debug)]
pub struct EnvFile {
    pub path: PathBuf,
    pub origin: EnvOrigin,
    /// Keys set from the file.
    pub applied: Vec<String>,
    /// Keys skipped because the process environment already had them.
    pub overridden: Vec<String>,
}

impl EnvFile {
    /// Keys in the file that no part of tado-local reads; usually typos.
    pub fn unknown_keys(&self) -> Vec<&str> {
        self.applied
            .iter()
            .chain(&self.overridden)
            .map(String::as_str)
            .filter(|k| !is_known_variable(k))
            .collect()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} ({}): {} variable(s) applied, {} already set",
            self.path.display(),
            self.origin.describe(),
            self.applied.len(),
            self.overridden.len()
        )
    }
}

fn is_known_variable(key: &str) -> bool {
    config::ENV_VARIABLES.contains(&key) || PROCESS_VARIABLES.contains(&key)
}

/// Resolve and apply the env file for this process, if there is one.
pub fn load_from_process() -> Result<Option<EnvFile>, String> {
    let (path, origin) = match env_file_arg(std::env::args_os().skip(1))? {
        Some(path) => (path, EnvOrigin::Cli),
        None => match std::env::var_os(ENV_FILE_VARIABLE).filter(|v| !v.is_empty()) {
            Some(path) => (PathBuf::from(path), EnvOrigin::Variable),
            None => {
                let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
                let path = cwd.join(".env");
                if !path.is_file() {
                    return Ok(None);
                }
                (path, EnvOrigin::WorkingDir)
            }
        },
    };

    if !path.is_file() {
        return Err(format!("env file from {} not found: {}", origin.describe(), path.display()));
    }
    let contents =
        std::fs::read_to_string(&path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let assignments = parse_env_file(&contents).map_err(|(line, e)| format!("{}:{}: {}", path.display(), line, e))?;

    let mut file = EnvFile {
        path,
        origin,
        applied: Vec::new(),
        overridden: Vec::new(),
    };
    for (key, value) in assignments {
        if std::env::var_os(&key).is_some() {
            file.overridden.push(key);
            continue;
        }
        // SAFETY: runs in main before the runtime or any other thread starts.
        unsafe {
            std::env::set_var(&key, value);
        }
        file.applied.push(key);
    }
    Ok(Some(file))
}

/// Extract `--env-file PATH` / `--env-file=PATH`; nothing else is accepted.
fn env_file_arg(args: impl IntoIterator<Item = OsString>) -> Result<Option<PathBuf>, String> {
    let mut args = args.into_iter();
    let mut found: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        let path = match arg.to_str() {
            Some("--env-file") => args
                .next()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| "`--env-file` requires a path argument".to_string())?,
            Some(s) if s.starts_with("--env-file=") => match &s["--env-file=".len()..] {
                "" => return Err("`--env-file` requires a path argument".to_string()),
                p => OsString::from(p),
            },
            Some("--") => break,
            Some(other) => return Err(format!("unrecognised argument: {}", other)),
            None => return Err("argument contains invalid UTF-8".to_string()),
        };
        if found.replace(PathBuf::from(path)).is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
    }
    Ok(found)
}

/// Parse a whole file; errors carry the 1-based line number.
fn parse_env_file(contents: &str) -> Result<Vec<(String, String)>, (usize, String)> {
    let mut out = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        if let Some(pair) = parse_env_line(line).map_err(|e| (index + 1, e))? {
            out.push(pair);
        }
    }
    Ok(out)
}

fn parse_env_line(line: &str) -> Result<Option<(String, String)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let line = line.strip_prefix("export ").map_or(line, str::trim_start);

    let (key, raw) = line.split_once('=').ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    validate_key(key)?;

    let raw = raw.trim();
    let value = match raw.chars().next() {
        Some(quote @ ('"' | '\'')) => parse_quoted(&raw[1..], quote)?,
        _ => raw.split('#').next().unwrap_or_default().trim_end().to_string(),
    };
    Ok(Some((key.to_string(), value)))
}

fn validate_key(key: &str) -> Result<(), String> {
    let mut chars = key.chars();
    match chars.next() {
        None => Err("environment variable name cannot be empty".to_string()),
        Some(c) if !(c.is_ascii_alphabetic() || c == '_') => Err(format!("invalid environment variable name: {}", key)),
        _ if chars.any(|c| !(c.is_ascii_alphanumeric() || c == '_')) => {
            Err(format!("invalid environment variable name: {}", key))
        }
        _ => Ok(()),
    }
}

/// Body after the opening quote. Backslash escapes apply inside double quotes only.
fn parse_quoted(input: &str, quote: char) -> Result<String, String> {
    let mut value = String::new();
    let mut chars = input.char_indices();

    while let Some((i, ch)) = chars.next() {
        if ch == quote {
            let rest = input[i + ch.len_utf8()..].trim();
            if rest.is_empty() || rest.starts_with('#') {
                return Ok(value);
            }
            return Err(format!("unexpected characters after closing {} quote", quote));
        }
        if ch == '\\' && quote == '"' {
            let Some((_, escaped)) = chars.next() else { break };
            value.push(match escaped {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                other => other,
            });
            continue;
        }
        value.push(ch);
    }
    Err(format!("unterminated {} quoted value", quote))
}
