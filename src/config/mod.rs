// src/config/mod.rs

//! Configuration loading and validation.
//!
//! - `model.rs`: the TOML-backed data model and its validated form.
//! - `loader.rs`: reading a config file from disk.
//! - `validate.rs`: DAG checks and value resolution.
//! - `units.rs`: duration and size parsing.

pub mod loader;
pub mod model;
pub mod units;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path, parse_and_validate};
pub use model::{ConfigFile, JobConfig, LeaderSection, NodeTypeConfig, RawConfigFile, ScalerSection};
pub use units::{SizeValue, parse_bytes, parse_duration};
