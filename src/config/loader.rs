// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Load a configuration file and return the raw `RawConfigFile`.
///
/// This only performs TOML deserialization; use [`load_and_validate`] for
/// the semantic checks.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let contents = fs::read_to_string(path.as_ref())?;
    parse_str(&contents)
}

pub fn parse_str(contents: &str) -> Result<RawConfigFile> {
    Ok(toml::from_str(contents)?)
}

/// Load a configuration file and validate it:
///
/// - at least one job,
/// - no unknown or self dependencies,
/// - no dependency cycles,
/// - every duration, size and resource value well-formed.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let raw_config = load_from_path(&path)?;
    ConfigFile::try_from(raw_config)
}

/// Same as [`load_and_validate`] for TOML already in memory.
pub fn parse_and_validate(contents: &str) -> Result<ConfigFile> {
    ConfigFile::try_from(parse_str(contents)?)
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("Jobflow.toml")
}
