use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::MapperError;
use crate::query::cursor::DEFAULT_BATCH_SIZE;

pub const CONFIG_ENV: &str = "DOCMAPPER_CONFIG";
pub const BATCH_SIZE_ENV: &str = "DOCMAPPER_BATCH_SIZE";
pub const DEFAULT_CONFIG_FILE: &str = "docmapper.toml";

/// Runtime configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    /// Documents per transport call while iterating; `0` fetches everything at once.
    pub batch_size: Option<usize>,
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
    /// Rolled log files to keep.
    pub log_retention: u32,
    /// TOML file with `[[schema]]` definitions.
    pub schema_path: Option<PathBuf>,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            batch_size: Some(DEFAULT_BATCH_SIZE),
            log_dir: None,
            log_level: "info".to_string(),
            log_retention: 7,
            schema_path: None,
        }
    }
}

impl MapperConfig {
    /// # Errors
    /// Returns `Toml` on malformed input.
    pub fn from_toml_str(s: &str) -> Result<Self, MapperError> {
        Ok(toml::from_str(s)?)
    }

    /// Loads the first config file found, in order: `explicit`, `$DOCMAPPER_CONFIG`,
    /// `./docmapper.toml`; defaults when none exists. `DOCMAPPER_BATCH_SIZE` then
    /// overrides the batch size.
    ///
    /// # Errors
    /// Returns an error when `explicit` does not exist or a found file fails to parse.
    pub fn load(explicit: Option<&Path>) -> Result<Self, MapperError> {
        if let Some(p) = explicit
            && !p.exists()
        {
            return Err(MapperError::Config(format!("config file {} not found", p.display())));
        }
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(p) = explicit {
            candidates.push(p.to_path_buf());
        }
        if let Ok(p) = std::env::var(CONFIG_ENV) {
            candidates.push(PathBuf::from(p));
        }
        if let Ok(cur) = std::env::current_dir() {
            candidates.push(cur.join(DEFAULT_CONFIG_FILE));
        }
        let mut cfg = match candidates.iter().find(|p| p.is_file()) {
            Some(p) => {
                log::debug!("loading config from {}", p.display());
                Self::from_toml_str(&std::fs::read_to_string(p)?)?
            }
            None => Self::default(),
        };
        if let Ok(s) = std::env::var(BATCH_SIZE_ENV) {
            cfg.apply_batch_size(&s)?;
        }
        Ok(cfg)
    }

    fn apply_batch_size(&mut self, raw: &str) -> Result<(), MapperError> {
        let n: usize = raw
            .trim()
            .parse()
            .map_err(|_| MapperError::Config(format!("{BATCH_SIZE_ENV} must be a number, got '{raw}'")))?;
        self.batch_size = Some(n);
        Ok(())
    }

    /// Batch size as cursors use it: `None` means a single call.
    #[must_use]
    pub fn effective_batch_size(&self) -> Option<usize> {
        self.batch_size.filter(|n| *n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_batch_size_means_unbatched() {
        let mut cfg = MapperConfig::default();
        assert_eq!(cfg.effective_batch_size(), Some(100));
        cfg.apply_batch_size("0").unwrap();
        assert_eq!(cfg.effective_batch_size(), None);
        assert!(cfg.apply_batch_size("many").is_err());
    }
}
