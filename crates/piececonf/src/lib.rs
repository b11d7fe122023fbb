//! Persisted capacity configuration for piecework.
//!
//! A slicing run reads its target capacity and the optional extra-content
//! budget from a small TOML file. Loop mode rewrites the same file after each
//! run so the capacity it used survives restarts.
//!
//! # Example Config
//!
//! ```toml
//! # SliceSize, the size of each slice in bytes, default is 18G
//! SliceSize = 19327352832
//! # ExtraFilePath, directory holding pictures, videos and other filler files
//! ExtraFilePath = "/data/filler"
//! # ExtraFileSizeInOnePiece, bytes of filler carried by each piece, e.g. 500MiB
//! ExtraFileSizeInOnePiece = "500MiB"
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use piececonf::SliceConfig;
//! use std::path::Path;
//!
//! let mut config = SliceConfig::load(Path::new("piecework.toml")).unwrap();
//! config.validate().unwrap();
//! println!("capacity: {}", config.slice_size);
//!
//! config.bump_capacity(1);
//! config.save(Path::new("piecework.toml")).unwrap();
//! ```

pub mod loader;
pub mod size;

pub use loader::{apply_env_overrides, expand_path};
pub use size::parse_size;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// One gibibyte.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Absolute ceiling for a single piece, imposed by the storage network.
pub const PIECE_CEILING: u64 = 32 * GIB;

/// Default target capacity: 18 GiB.
pub const DEFAULT_SLICE_SIZE: i64 = 19_327_352_832;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write config file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("slice size has been set as {0}, it must be greater than 0")]
    InvalidCapacity(i64),

    #[error("extra file size in one piece is required when extra file path ({0}) is set")]
    MissingBudget(PathBuf),

    #[error("invalid size {value:?}: {reason}")]
    InvalidSize { value: String, reason: String },

    #[error("slice size {slice_size} + extra file slice size {reserved} exceeds 32 GiB")]
    ExceedsPieceCeiling { slice_size: i64, reserved: u64 },

    #[error("extra file slice size {reserved} leaves no room in slice size {slice_size}")]
    NoRoomForInput { slice_size: i64, reserved: u64 },
}

/// Capacity configuration persisted between runs.
///
/// Key names match the files written by earlier deployments, hence the
/// PascalCase renames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceConfig {
    /// Target capacity of each slice in bytes.
    #[serde(rename = "SliceSize", default = "default_slice_size")]
    pub slice_size: i64,

    /// Directory holding supplementary files mixed into each slice.
    #[serde(rename = "ExtraFilePath", default, skip_serializing_if = "Option::is_none")]
    pub extra_file_path: Option<PathBuf>,

    /// Human readable budget for supplementary files per slice.
    #[serde(
        rename = "ExtraFileSizeInOnePiece",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub extra_file_size_in_one_piece: Option<String>,
}

fn default_slice_size() -> i64 {
    DEFAULT_SLICE_SIZE
}

impl Default for SliceConfig {
    fn default() -> Self {
        Self {
            slice_size: DEFAULT_SLICE_SIZE,
            extra_file_path: None,
            extra_file_size_in_one_piece: None,
        }
    }
}

const HEADER: &str = "# piecework configuration\n# generated file, every key is documented above its value\n\n";

impl SliceConfig {
    /// Create a config with a specific capacity and no supplementary content.
    pub fn with_capacity(slice_size: i64) -> Self {
        Self {
            slice_size,
            ..Self::default()
        }
    }

    /// Load a config file. Missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&contents, path)
    }

    /// Load a config file, then apply `PIECEWORK_*` environment overrides.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        apply_env_overrides(&mut config);
        Ok(config)
    }

    fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut config: SliceConfig =
            toml::from_str(contents).map_err(|e: toml::de::Error| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        if let Some(extra) = config.extra_file_path.take() {
            let raw = extra.to_string_lossy();
            if !raw.is_empty() {
                config.extra_file_path = Some(expand_path(raw.trim_end_matches('/')));
            }
        }
        if config
            .extra_file_size_in_one_piece
            .as_deref()
            .is_some_and(|s| s.trim().is_empty())
        {
            config.extra_file_size_in_one_piece = None;
        }

        Ok(config)
    }

    /// Write the config back out, truncating any previous content.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_toml()).map_err(|e| ConfigError::FileWrite {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Serialize config to TOML with a comment above each key.
    pub fn to_toml(&self) -> String {
        let mut output = String::from(HEADER);

        output.push_str("# SliceSize, the size of each slice in bytes, default is 18G\n");
        output.push_str(&format!("SliceSize = {}\n", self.slice_size));

        output.push_str("# ExtraFilePath, directory holding pictures, videos and other filler files\n");
        match &self.extra_file_path {
            Some(path) => output.push_str(&format!("ExtraFilePath = {:?}\n", path.display().to_string())),
            None => output.push_str("ExtraFilePath = \"\"\n"),
        }

        output.push_str("# ExtraFileSizeInOnePiece, bytes of filler carried by each piece, e.g. 500MiB\n");
        output.push_str(&format!(
            "ExtraFileSizeInOnePiece = {:?}\n",
            self.extra_file_size_in_one_piece.as_deref().unwrap_or("")
        ));

        output
    }

    /// Bytes reserved per slice for supplementary content, 0 when unset.
    pub fn reserved_bytes(&self) -> Result<u64, ConfigError> {
        match (&self.extra_file_path, &self.extra_file_size_in_one_piece) {
            (None, _) => Ok(0),
            (Some(path), None) => Err(ConfigError::MissingBudget(path.clone())),
            (Some(_), Some(spec)) => parse_size(spec),
        }
    }

    /// Check every invariant a run depends on before any I/O starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slice_size <= 0 {
            return Err(ConfigError::InvalidCapacity(self.slice_size));
        }
        let reserved = self.reserved_bytes()?;
        if self.slice_size as u64 + reserved > PIECE_CEILING {
            return Err(ConfigError::ExceedsPieceCeiling {
                slice_size: self.slice_size,
                reserved,
            });
        }
        if reserved >= self.slice_size as u64 {
            return Err(ConfigError::NoRoomForInput {
                slice_size: self.slice_size,
                reserved,
            });
        }
        Ok(())
    }

    /// Adjust the capacity for the next run and return the new value.
    pub fn bump_capacity(&mut self, step: i64) -> i64 {
        self.slice_size = self.slice_size.saturating_add(step.max(0));
        self.slice_size
    }
}
