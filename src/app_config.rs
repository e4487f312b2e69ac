//! Config file loading for CLI defaults.
//!
//! The file is a flat list of `key = value` lines. Values from the file
//! override built-in defaults; command-line flags override both.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use casefile_core::{CollectorConfig, FolderPickupConfig};

use crate::cli::Args;

/// Values read from the config file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileConfig {
    pub output_dir: Option<PathBuf>,
    pub concurrency: Option<u64>,
    pub qps: Option<f64>,
    pub max_retries: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_cap_ms: Option<u64>,
    pub required: Option<Vec<String>>,
    pub link_only: Option<Vec<String>>,
    pub download_timeout_ms: Option<u64>,
    pub popup_timeout_ms: Option<u64>,
    pub response_timeout_ms: Option<u64>,
    pub navigation_timeout_ms: Option<u64>,
    pub settle_window_ms: Option<u64>,
    pub candidate_budget_secs: Option<u64>,
    pub pause_every: Option<u64>,
    pub pause_secs: Option<u64>,
    pub snapshots: Option<bool>,
    pub folder_pickup_dir: Option<PathBuf>,
    pub folder_pickup_extensions: Option<Vec<String>>,
    pub folder_pickup_timeout_secs: Option<u64>,
}

impl FileConfig {
    /// Writes every value present in the file onto `config`.
    pub fn apply(&self, config: &mut CollectorConfig) -> Result<()> {
        if let Some(dir) = &self.output_dir {
            config.output_dir.clone_from(dir);
        }
        if let Some(value) = self.concurrency {
            config.concurrency = usize::try_from(value).context("concurrency out of range")?;
        }
        if let Some(value) = self.qps {
            config.qps = value;
        }
        if let Some(value) = self.max_retries {
            config.max_retries = u32::try_from(value).context("max_retries out of range")?;
        }
        set_secs(&mut config.request_timeout, self.request_timeout_secs);
        set_secs(&mut config.connect_timeout, self.connect_timeout_secs);
        set_millis(&mut config.backoff_base, self.backoff_base_ms);
        set_millis(&mut config.backoff_cap, self.backoff_cap_ms);
        if let Some(codes) = &self.required {
            config.required_categories = codes.iter().cloned().collect();
        }
        if let Some(codes) = &self.link_only {
            config.link_only_categories = codes.iter().cloned().collect();
        }
        set_millis(&mut config.download_timeout, self.download_timeout_ms);
        set_millis(&mut config.popup_timeout, self.popup_timeout_ms);
        set_millis(&mut config.response_timeout, self.response_timeout_ms);
        set_millis(&mut config.navigation_timeout, self.navigation_timeout_ms);
        set_millis(&mut config.settle_window, self.settle_window_ms);
        set_secs(&mut config.candidate_budget, self.candidate_budget_secs);
        if let Some(value) = self.pause_every {
            config.pause_every = usize::try_from(value).context("pause_every out of range")?;
        }
        set_secs(&mut config.pause_duration, self.pause_secs);
        if let Some(value) = self.snapshots {
            config.snapshots = value;
        }
        if let Some(dir) = &self.folder_pickup_dir {
            config.folder_pickup = Some(pickup_config(
                dir.clone(),
                self.folder_pickup_extensions.clone(),
                self.folder_pickup_timeout_secs,
            ));
        }
        Ok(())
    }
}

/// Applies command-line overrides.
pub fn apply_args(args: &Args, config: &mut CollectorConfig) {
    if let Some(dir) = &args.output_dir {
        config.output_dir.clone_from(dir);
    }
    if let Some(value) = args.concurrency {
        config.concurrency = usize::from(value);
    }
    if let Some(value) = args.max_retries {
        config.max_retries = u32::from(value);
    }
    if let Some(value) = args.qps {
        config.qps = value;
    }
    set_secs(&mut config.request_timeout, args.timeout_secs);
    if !args.require.is_empty() {
        config.required_categories = normalize_codes(&args.require).collect();
    }
    if !args.link_only.is_empty() {
        config.link_only_categories = normalize_codes(&args.link_only).collect();
    }
    if args.snapshots {
        config.snapshots = true;
    }
    if let Some(dir) = &args.folder_pickup {
        let (extensions, timeout) = match &config.folder_pickup {
            Some(existing) => (Some(existing.extensions.clone()), Some(existing.timeout.as_secs())),
            None => (None, None),
        };
        config.folder_pickup = Some(pickup_config(dir.clone(), extensions, timeout));
    }
}

fn pickup_config(dir: PathBuf, extensions: Option<Vec<String>>, timeout_secs: Option<u64>) -> FolderPickupConfig {
    FolderPickupConfig {
        dir,
        extensions: extensions.unwrap_or_else(|| {
            casefile_core::config::DEFAULT_PICKUP_EXTENSIONS
                .iter()
                .map(ToString::to_string)
                .collect()
        }),
        timeout: Duration::from_secs(timeout_secs.unwrap_or(30)),
    }
}

fn set_secs(target: &mut Duration, value: Option<u64>) {
    if let Some(secs) = value {
        *target = Duration::from_secs(secs);
    }
}

fn set_millis(target: &mut Duration, value: Option<u64>) {
    if let Some(ms) = value {
        *target = Duration::from_millis(ms);
    }
}

fn normalize_codes(codes: &[String]) -> impl Iterator<Item = String> + '_ {
    codes
        .iter()
        .map(|code| code.trim().to_ascii_uppercase())
        .filter(|code| !code.is_empty())
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/casefile/config.toml`
/// 2. `$HOME/.config/casefile/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("casefile")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("casefile")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the config file: `explicit` must exist; the default path is
/// optional.
pub fn load_file_config(explicit: Option<&Path>) -> Result<Option<(PathBuf, FileConfig)>> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match resolve_default_config_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(None),
        },
    };
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    let config = parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))?;
    Ok(Some((path, config)))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let line_no = line_index + 1;

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };
        let key = raw_key.trim();
        let value = raw_value.trim();
        let invalid = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "output_dir" => {
                cfg.output_dir = Some(PathBuf::from(parse_string_literal(value).with_context(invalid)?));
            }
            "concurrency" => cfg.concurrency = Some(parse_integer_u64(value).with_context(invalid)?),
            "qps" => cfg.qps = Some(parse_float(value).with_context(invalid)?),
            "max_retries" => cfg.max_retries = Some(parse_integer_u64(value).with_context(invalid)?),
            "request_timeout_secs" => {
                cfg.request_timeout_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "connect_timeout_secs" => {
                cfg.connect_timeout_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "backoff_base_ms" => cfg.backoff_base_ms = Some(parse_integer_u64(value).with_context(invalid)?),
            "backoff_cap_ms" => cfg.backoff_cap_ms = Some(parse_integer_u64(value).with_context(invalid)?),
            "required" => cfg.required = Some(parse_code_list(value).with_context(invalid)?),
            "link_only" => cfg.link_only = Some(parse_code_list(value).with_context(invalid)?),
            "download_timeout_ms" => {
                cfg.download_timeout_ms = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "popup_timeout_ms" => cfg.popup_timeout_ms = Some(parse_integer_u64(value).with_context(invalid)?),
            "response_timeout_ms" => {
                cfg.response_timeout_ms = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "navigation_timeout_ms" => {
                cfg.navigation_timeout_ms = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "settle_window_ms" => cfg.settle_window_ms = Some(parse_integer_u64(value).with_context(invalid)?),
            "candidate_budget_secs" => {
                cfg.candidate_budget_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "pause_every" => cfg.pause_every = Some(parse_integer_u64(value).with_context(invalid)?),
            "pause_secs" => cfg.pause_secs = Some(parse_integer_u64(value).with_context(invalid)?),
            "snapshots" => cfg.snapshots = Some(parse_boolean(value).with_context(invalid)?),
            "folder_pickup_dir" => {
                cfg.folder_pickup_dir =
                    Some(PathBuf::from(parse_string_literal(value).with_context(invalid)?));
            }
            "folder_pickup_extensions" => {
                let list = parse_string_literal(value).with_context(invalid)?;
                cfg.folder_pickup_extensions = Some(
                    list.split(',')
                        .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
                        .filter(|ext| !ext.is_empty())
                        .collect(),
                );
            }
            "folder_pickup_timeout_secs" => {
                cfg.folder_pickup_timeout_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            unknown => bail!("Unknown configuration key: '{unknown}' on line {line_no}"),
        }
    }
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_code_list(raw_value: &str) -> Result<Vec<String>> {
    let list = parse_string_literal(raw_value)?;
    Ok(normalize_codes(&list.split(',').map(str::to_string).collect::<Vec<_>>()).collect())
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_float(raw_value: &str) -> Result<f64> {
    let value = raw_value.trim().parse::<f64>()?;
    if !value.is_finite() || value < 0.0 {
        bail!("Expected a non-negative number");
    }
    Ok(value)
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}
