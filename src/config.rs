//! Configuration for a rock swap directory.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cell::{CellHeader, HEADER_SIZE, SwapMeta};
use crate::dir_map::ABSOLUTE_ENTRY_LIMIT;
use crate::error::{RockError, RockResult};

/// Which disk I/O strategy a swap directory uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum IoModule {
    /// Syscalls on the calling thread, completion posted to the loop.
    #[default]
    Blocking,
    /// Requests queued to a disker that owns the file handle.
    IpcIo,
}

/// Configuration for one rock swap directory.
///
/// Parsing lives with the outer configuration layer; this type receives
/// the already-parsed values and validates them at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct RockConfig {
    /// Directory holding the db file and named after in the shared
    /// segment name.
    pub path: PathBuf,

    /// Maximum db size in MiB.
    #[serde(default = "RockConfig::default_max_size_mb")]
    pub max_size_mb: i64,

    /// Cell size in bytes; also the largest storable object.
    #[serde(default = "RockConfig::default_max_objsize")]
    pub max_objsize: i64,

    /// Disk I/O strategy.
    #[serde(default)]
    pub io_module: IoModule,
}

impl Default for RockConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/cache/rock"),
            max_size_mb: Self::default_max_size_mb(),
            max_objsize: Self::default_max_objsize(),
            io_module: IoModule::default(),
        }
    }
}

impl RockConfig {
    fn default_max_size_mb() -> i64 {
        100
    }

    fn default_max_objsize() -> i64 {
        8 * 1024
    }

    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cache directory path.
    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = path.as_ref().to_path_buf();
        self
    }

    /// Set the maximum db size in MiB.
    pub fn max_size_mb(mut self, mb: i64) -> Self {
        self.max_size_mb = mb;
        self
    }

    /// Set the cell size in bytes.
    pub fn max_objsize(mut self, bytes: i64) -> Self {
        self.max_objsize = bytes;
        self
    }

    /// Set the disk I/O strategy.
    pub fn io_module(mut self, module: IoModule) -> Self {
        self.io_module = module;
        self
    }

    /// Maximum db size in bytes.
    pub fn max_size_bytes(&self) -> i64 {
        self.max_size_mb << 20
    }

    /// Number of cells the configured sizes allow, before any existing
    /// segment is consulted.
    pub fn entry_limit_allowed(&self) -> u32 {
        if self.max_objsize <= 0 {
            return 0;
        }
        let usable = self.max_size_bytes() - HEADER_SIZE;
        if usable <= 0 {
            return 0;
        }
        (usable / self.max_objsize).min(ABSOLUTE_ENTRY_LIMIT as i64) as u32
    }

    /// Check the configured values, as the startup path must before any
    /// segment or file is touched.
    pub fn validate(&self) -> RockResult<()> {
        if self.max_size_mb <= 0 {
            return Err(RockError::ConfigInvalid(format!(
                "db size must be positive, got {} MiB",
                self.max_size_mb
            )));
        }
        if self.max_objsize <= 0 {
            return Err(RockError::ConfigInvalid(format!(
                "max-size must be positive, got {}",
                self.max_objsize
            )));
        }
        let overhead = (CellHeader::SIZE + SwapMeta::SIZE) as i64;
        if self.max_objsize <= overhead {
            return Err(RockError::ConfigInvalid(format!(
                "max-size {} leaves no room for cell framing ({overhead} bytes)",
                self.max_objsize
            )));
        }
        let limit = self.entry_limit_allowed();
        if limit == 0 {
            return Err(RockError::ConfigInvalid(format!(
                "db size {} MiB holds no cells of {} bytes",
                self.max_size_mb, self.max_objsize
            )));
        }
        // cell offsets must stay representable as i64
        if self
            .max_objsize
            .checked_mul(limit as i64)
            .and_then(|cells| cells.checked_add(HEADER_SIZE))
            .is_none()
        {
            return Err(RockError::ConfigInvalid(
                "db layout overflows 64-bit offsets".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = RockConfig::default();
        config.validate().expect("defaults should validate");
        assert_eq!(config.io_module, IoModule::Blocking);
    }

    #[test]
    fn builder_sets_fields() {
        let config = RockConfig::new()
            .path("/tmp/rock-test")
            .max_size_mb(2)
            .max_objsize(4096)
            .io_module(IoModule::IpcIo);

        assert_eq!(config.path, PathBuf::from("/tmp/rock-test"));
        assert_eq!(config.max_size_bytes(), 2 << 20);
        assert_eq!(config.io_module, IoModule::IpcIo);
        // 2 MiB minus the 16 KiB header, in 4 KiB cells
        assert_eq!(config.entry_limit_allowed(), (2048 - 16) / 4);
    }

    #[test]
    fn rejects_non_positive_sizes() {
        assert!(RockConfig::new().max_size_mb(-1).validate().is_err());
        assert!(RockConfig::new().max_objsize(0).validate().is_err());
    }

    #[test]
    fn rejects_cell_smaller_than_framing() {
        let config = RockConfig::new().max_objsize(64);
        assert!(matches!(
            config.validate(),
            Err(RockError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn limit_is_capped() {
        let config = RockConfig::new().max_size_mb(1 << 30).max_objsize(128);
        assert_eq!(config.entry_limit_allowed(), ABSOLUTE_ENTRY_LIMIT);
    }
}
