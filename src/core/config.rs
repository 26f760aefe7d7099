//! Engine configuration - Parsing the `KEY=VALUE` blob handed over by the UI

use std::path::{Path, PathBuf};

use thiserror::Error;

/// `"1"` runs a local engine, anything else attaches to `REMOTE_URL`
pub const ENGINE_ENABLED: &str = "ENGINE_ENABLED";
/// Path to the engine binary
pub const ENGINE_PATH: &str = "ENGINE_PATH";
/// Working directory of the engine process
pub const ENGINE_WORKING_DIR: &str = "ENGINE_WORKING_DIR";
/// Port the local engine serves its app on
pub const APP_PORT: &str = "APP_PORT";
/// Base URL of the engine
pub const REMOTE_URL: &str = "REMOTE_URL";
/// Module resolution path derived for local engines
pub const NODE_MODULES_PATH: &str = "NODE_MODULES_PATH";

/// Errors raised while validating an engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("REMOTE_URL must be set when the engine is disabled")]
    RemoteUrlRequired,

    #[error("{} must be set when the engine is enabled", .missing.join(", "))]
    MissingEngineSettings { missing: Vec<&'static str> },
}

/// Parsed engine settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Whether a local engine process should be supervised
    pub enabled: bool,
    pub engine_path: Option<String>,
    pub working_dir: Option<String>,
    pub app_port: Option<String>,
    pub remote_url: Option<String>,
    /// Every parsed variable in input order, forwarded to the engine
    pub vars: Vec<(String, String)>,
}

/// How the engine is reached, derived from a valid [`EngineConfig`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineMode {
    /// An externally supervised engine
    Remote { url: String },
    /// A local engine process owned by the host
    Local(LocalEngine),
}

/// Everything needed to launch and probe a local engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEngine {
    pub engine_path: PathBuf,
    pub working_dir: PathBuf,
    /// Base URL the health probe targets
    pub remote_url: String,
    /// Environment overlay for the engine process
    pub environment: Vec<(String, String)>,
}

impl EngineConfig {
    /// Parse a newline-delimited `KEY=VALUE` blob and validate it
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config = Self::from_vars(parse_env(raw));
        config.mode()?;
        Ok(config)
    }

    /// Build a config from already split variables without validating it
    pub fn from_vars(vars: Vec<(String, String)>) -> Self {
        let lookup = |key: &str| {
            vars.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .filter(|v| !v.is_empty())
        };

        Self {
            enabled: lookup(ENGINE_ENABLED).as_deref() == Some("1"),
            engine_path: lookup(ENGINE_PATH),
            working_dir: lookup(ENGINE_WORKING_DIR),
            app_port: lookup(APP_PORT),
            remote_url: lookup(REMOTE_URL),
            vars,
        }
    }

    /// Validate the config and resolve how the engine is reached
    pub fn mode(&self) -> Result<EngineMode, ConfigError> {
        if !self.enabled {
            return self
                .remote_url
                .clone()
                .map(|url| EngineMode::Remote { url })
                .ok_or(ConfigError::RemoteUrlRequired);
        }

        let (Some(engine_path), Some(working_dir), Some(app_port)) =
            (&self.engine_path, &self.working_dir, &self.app_port)
        else {
            let missing = [
                (ENGINE_PATH, self.engine_path.is_none()),
                (ENGINE_WORKING_DIR, self.working_dir.is_none()),
                (APP_PORT, self.app_port.is_none()),
            ]
            .into_iter()
            .filter_map(|(key, absent)| absent.then_some(key))
            .collect();
            return Err(ConfigError::MissingEngineSettings { missing });
        };

        let remote_url = self
            .remote_url
            .clone()
            .unwrap_or_else(|| default_remote_url(app_port));
        let working_dir = PathBuf::from(working_dir);

        let mut environment = self.vars.clone();
        set_var(
            &mut environment,
            NODE_MODULES_PATH,
            node_modules_path(&working_dir).to_string_lossy().into_owned(),
        );

        Ok(EngineMode::Local(LocalEngine {
            engine_path: PathBuf::from(engine_path),
            working_dir,
            remote_url,
            environment,
        }))
    }
}

/// Sign-in URL of a local engine serving on `app_port`
pub fn default_remote_url(app_port: &str) -> String {
    format!("http://localhost:{app_port}/signin")
}

/// Plugin module directory of an engine working directory
pub fn node_modules_path(working_dir: &Path) -> PathBuf {
    working_dir.join("plugins").join("node_modules")
}

/// Split a dotenv-style blob into variables. Later duplicates win but keep
/// the position of the first occurrence.
pub fn parse_env(raw: &str) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    for (key, value) in raw.lines().filter_map(parse_line) {
        set_var(&mut vars, &key, value);
    }
    vars
}

fn set_var(vars: &mut Vec<(String, String)>, key: &str, value: String) {
    match vars.iter_mut().find(|(k, _)| k == key) {
        Some(slot) => slot.1 = value,
        None => vars.push((key.to_string(), value)),
    }
}

fn parse_line(line: &str) -> Option<(String, String)> {
    let line = strip_export(line.trim_start());
    let key_len = line
        .find(|c: char| !is_key_char(c))
        .unwrap_or(line.len());
    if key_len == 0 {
        return None;
    }

    // `KEY=value`, `KEY = value` or `KEY: value`
    let (key, rest) = line.split_at(key_len);
    let value = match rest.trim_start().strip_prefix('=') {
        Some(value) => value,
        None => rest
            .strip_prefix(':')
            .filter(|value| value.starts_with(char::is_whitespace))?,
    };

    Some((key.to_string(), parse_value(value.trim())))
}

fn strip_export(line: &str) -> &str {
    line.strip_prefix("export")
        .filter(|rest| rest.starts_with(char::is_whitespace))
        .map(str::trim_start)
        .unwrap_or(line)
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

fn parse_value(value: &str) -> String {
    if let Some(quote) = value.chars().next().filter(|c| matches!(c, '"' | '\'' | '`')) {
        if let Some(inner) = quoted(&value[1..], quote) {
            return if quote == '"' {
                inner.replace("\\n", "\n").replace("\\r", "\r")
            } else {
                inner.to_string()
            };
        }
    }

    // Unquoted values end at the first `#`
    match value.find('#') {
        Some(comment) => value[..comment].trim_end().to_string(),
        None => value.to_string(),
    }
}

/// Body of a quoted value. The closing quote is the last one followed only
/// by whitespace or a comment; quotes inside the body must be escaped.
fn quoted(body: &str, quote: char) -> Option<&str> {
    let mut end = None;
    let mut prev = None;
    for (i, c) in body.char_indices() {
        if c == quote {
            let rest = body[i + 1..].trim_start();
            if rest.is_empty() || rest.starts_with('#') {
                end = Some(i);
            }
            if prev != Some('\\') {
                break;
            }
        }
        prev = Some(c);
    }
    end.map(|end| &body[..end])
}
