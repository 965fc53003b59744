//! Runtime configuration from the process environment, optionally preloaded
//! from a `.env` file. Variables already present in the process environment
//! take precedence over the file.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::client::openweather;
use crate::models::c8y::{ServiceUser, TenantId};

pub const DEFAULT_INITIAL_DELAY_SECS: u64 = 10;
pub const DEFAULT_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_CYCLE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct Config {
    /// Cumulocity base URL, e.g. `https://example.cumulocity.com`.
    pub c8y_base_url: String,
    /// Bootstrap user used to enumerate subscribed tenants.
    pub bootstrap: ServiceUser,
    pub openweather_base_url: String,
    pub initial_delay: Duration,
    /// Sync cadence.
    pub interval: Duration,
    /// Budget of one tenant's cycle; must stay below `interval`.
    pub cycle_timeout: Duration,
    /// Bound on every single HTTP request.
    pub request_timeout: Duration,
}

/// Variables read from a `.env` file layered under the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvSource {
    file: BTreeMap<String, String>,
}

impl EnvSource {
    pub fn process_only() -> Self {
        EnvSource::default()
    }

    pub fn with_file(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        let file = parse_env_file(&text).map_err(|e| format!("{}:{}", path.display(), e))?;
        Ok(EnvSource { file })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .or_else(|| self.file.get(key).cloned())
            .filter(|v| !v.trim().is_empty())
    }
}

impl Config {
    pub fn from_env(env: &EnvSource) -> Result<Self, String> {
        Self::from_lookup(|key| env.get(key))
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let required = |key: &str| get(key).ok_or_else(|| format!("Missing required environment variable {}", key));
        let secs = |key: &str, default: u64| -> Result<Duration, String> {
            match get(key) {
                Some(s) => s
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| format!("{} must be a whole number of seconds, got {:?}", key, s)),
                None => Ok(Duration::from_secs(default)),
            }
        };

        let c8y_base_url = required("C8Y_BASEURL")?;
        let bootstrap = ServiceUser {
            tenant: TenantId(required("C8Y_BOOTSTRAP_TENANT")?),
            name: required("C8Y_BOOTSTRAP_USER")?,
            password: required("C8Y_BOOTSTRAP_PASSWORD")?,
        };
        let openweather_base_url =
            get("OPENWEATHER_BASE_URL").unwrap_or_else(|| openweather::DEFAULT_BASE_URL.to_string());

        let cfg = Config {
            c8y_base_url,
            bootstrap,
            openweather_base_url,
            initial_delay: secs("SYNC_INITIAL_DELAY_SECS", DEFAULT_INITIAL_DELAY_SECS)?,
            interval: secs("SYNC_INTERVAL_SECS", DEFAULT_INTERVAL_SECS)?,
            cycle_timeout: secs("SYNC_CYCLE_TIMEOUT_SECS", DEFAULT_CYCLE_TIMEOUT_SECS)?,
            request_timeout: secs("HTTP_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), String> {
        if self.interval.is_zero() {
            return Err("SYNC_INTERVAL_SECS must be greater than zero".into());
        }
        if self.request_timeout.is_zero() {
            return Err("HTTP_REQUEST_TIMEOUT_SECS must be greater than zero".into());
        }
        // a cycle may use at most half a tick period
        if self.cycle_timeout.is_zero() || self.cycle_timeout > self.interval / 2 {
            return Err(format!(
                "SYNC_CYCLE_TIMEOUT_SECS ({}) must be between 1 and half of SYNC_INTERVAL_SECS ({})",
                self.cycle_timeout.as_secs(),
                self.interval.as_secs()
            ));
        }
        if self.request_timeout >= self.cycle_timeout {
            return Err(format!(
                "HTTP_REQUEST_TIMEOUT_SECS ({}) must be below SYNC_CYCLE_TIMEOUT_SECS ({})",
                self.request_timeout.as_secs(),
                self.cycle_timeout.as_secs()
            ));
        }
        Ok(())
    }
}

/// Parse `KEY=VALUE` lines; errors carry the 1-based line number.
fn parse_env_file(text: &str) -> Result<BTreeMap<String, String>, String> {
    let mut vars = BTreeMap::new();
    for (index, line) in text.lines().enumerate() {
        if let Some((key, value)) = parse_env_line(line).map_err(|e| format!("{}: {}", index + 1, e))? {
            vars.insert(key, value);
        }
    }
    Ok(vars)
}

fn parse_env_line(line: &str) -> Result<Option<(String, String)>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let assignment = trimmed.strip_prefix("export ").map(str::trim_start).unwrap_or(trimmed);
    let (key, raw) = assignment
        .split_once('=')
        .ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return Err(format!("invalid variable name {:?}", key));
    }
    Ok(Some((key.to_string(), unquote(raw.trim())?)))
}

fn unquote(raw: &str) -> Result<String, String> {
    if let Some(rest) = raw.strip_prefix('"') {
        return unquote_double(rest);
    }
    if let Some(rest) = raw.strip_prefix('\'') {
        let end = rest.find('\'').ok_or_else(|| "unterminated single-quoted value".to_string())?;
        expect_line_end(&rest[end + 1..])?;
        return Ok(rest[..end].to_string());
    }
    // unquoted: an inline comment ends the value
    let value = raw.split(" #").next().unwrap_or_default().trim_end();
    Ok(value.to_string())
}

/// Double-quoted values understand `\n`, `\r`, `\t`, `\\` and `\"`.
fn unquote_double(input: &str) -> Result<String, String> {
    let mut value = String::new();
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                let escaped = chars
                    .next()
                    .ok_or_else(|| "unterminated escape sequence in double-quoted value".to_string())?;
                value.push(match escaped {
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    other => other,
                });
            }
            '"' => {
                expect_line_end(chars.as_str())?;
                return Ok(value);
            }
            other => value.push(other),
        }
    }
    Err("unterminated double-quoted value".to_string())
}

fn expect_line_end(rest: &str) -> Result<(), String> {
    let rest = rest.trim();
    if rest.is_empty() || rest.starts_with('#') {
        Ok(())
    } else {
        Err("unexpected characters after closing quote".to_string())
    }
}
