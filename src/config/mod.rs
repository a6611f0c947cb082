// Module: Config
// Explicit run configuration handed to the executor at construction.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::executors::ReqwestDispatcher;
use crate::limits::ExecutionLimits;

static INTERPOLATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z0-9_.:-]+)\}").expect("valid interpolation regex")
});

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Everything a chain run needs besides the plan and the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub base_url: String,
    /// Sent on every call; request headers with the same name win.
    pub default_headers: BTreeMap<String, String>,
    /// Conditions under which conditional relations apply.
    pub active_conditions: BTreeSet<String>,
    pub limits: ExecutionLimits,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            default_headers: BTreeMap::new(),
            active_conditions: BTreeSet::new(),
            limits: ExecutionLimits::default(),
        }
    }
}

impl RunConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Reads the configuration from the process environment.
    ///
    /// - `CHAIN_BASE_URL`
    /// - `CHAIN_DEFAULT_HEADERS`: `Name: value` pairs separated by `;`
    /// - `CHAIN_CONDITIONS`: comma-separated condition names
    /// - plus every variable read by `ExecutionLimits::from_env`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self {
            limits: ExecutionLimits::from_lookup(&lookup),
            ..Default::default()
        };

        if let Some(url) = lookup("CHAIN_BASE_URL") {
            config.base_url = url;
        }

        if let Some(raw) = lookup("CHAIN_DEFAULT_HEADERS") {
            for pair in raw.split(';').filter(|p| !p.trim().is_empty()) {
                let (name, value) = parse_header(pair)?;
                config.default_headers.insert(name, interpolate_env(&value, &lookup)?);
            }
        }

        if let Some(raw) = lookup("CHAIN_CONDITIONS") {
            config.active_conditions.extend(
                raw.split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string),
            );
        }

        Ok(config)
    }

    /// Adds a header; `${ENV_NAME}` placeholders are resolved right away.
    pub fn with_header(mut self, name: impl Into<String>, value: &str) -> Result<Self> {
        let resolved = interpolate_env(value, &|key: &str| std::env::var(key).ok())?;
        self.default_headers.insert(name.into(), resolved);
        Ok(self)
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.active_conditions.insert(condition.into());
        self
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Real HTTP dispatcher configured from this run.
    pub fn dispatcher(&self) -> ReqwestDispatcher {
        ReqwestDispatcher::new(self.base_url.clone(), self.limits.request_timeout)
            .with_default_headers(self.default_headers.clone())
    }
}

/// Parses one `Name: value` header declaration.
pub fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("Invalid header '{}', expected 'Name: value'.", raw.trim()))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("Invalid header '{}', name is empty.", raw.trim()));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Replaces `${ENV_NAME}` with the value of the variable `NAME`.
pub fn interpolate_env<F>(input: &str, lookup: &F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = String::with_capacity(input.len());
    let mut last_index = 0;

    for capture in INTERPOLATION_RE.captures_iter(input) {
        let (Some(matched), Some(token)) = (capture.get(0), capture.get(1)) else {
            continue;
        };
        result.push_str(&input[last_index..matched.start()]);

        let token = token.as_str();
        let name = token
            .strip_prefix("ENV_")
            .ok_or_else(|| anyhow!("Unsupported placeholder '{}', use '${{ENV_NAME}}'.", token))?;
        let value = lookup(name).ok_or_else(|| anyhow!("Missing environment variable '{}'.", name))?;
        result.push_str(&value);

        last_index = matched.end();
    }

    result.push_str(&input[last_index..]);
    Ok(result)
}
