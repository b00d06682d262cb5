// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Writable `temp_threshold` parameter.
//!
//! The file holds the effective threshold as plain text. Operators write a
//! new integer into it and the main loop picks it up on the next poll.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use log::info;
use log::warn;
use msm_thermal::misc::write_to_file;
use msm_thermal::ThermalContext;
use msm_thermal::Tunables;

pub const DEFAULT_PARAM_DIR: &str = "/run/msm_thermal/parameters";
const TEMP_THRESHOLD: &str = "temp_threshold";

pub struct ParamFile {
    path: PathBuf,
    ctx: Arc<ThermalContext>,
    /// Last content rejected, so garbage is reported once.
    rejected: Option<String>,
}

impl ParamFile {
    /// Create `dir` if needed and publish the current threshold.
    pub fn create(dir: &Path, ctx: Arc<ThermalContext>) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        let path = dir.join(TEMP_THRESHOLD);
        write_to_file(&path, ctx.tunables.temp_threshold())?;
        Ok(Self {
            path,
            ctx,
            rejected: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tunables(&self) -> &Tunables {
        &self.ctx.tunables
    }

    /// Returns the new threshold if the file changed it.
    pub fn poll(&mut self) -> Option<i64> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read {:?}: {}", self.path, e);
                return None;
            }
        };
        let trimmed = content.trim();

        let threshold = match trimmed.parse::<i64>() {
            Ok(v) => v,
            Err(_) => {
                if self.rejected.as_deref() != Some(trimmed) {
                    warn!("Ignoring invalid {} {:?}", TEMP_THRESHOLD, trimmed);
                    self.rejected = Some(trimmed.to_string());
                }
                return None;
            }
        };
        self.rejected = None;

        let old = self.tunables().temp_threshold();
        if threshold == old {
            return None;
        }
        self.tunables().set_temp_threshold(threshold);
        info!("temp_threshold: {} -> {}", old, threshold);
        Some(threshold)
    }

    pub fn remove(self) -> Result<()> {
        fs::remove_file(&self.path).with_context(|| format!("Failed to remove {:?}", self.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param() -> (tempfile::TempDir, ParamFile, Arc<ThermalContext>) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(ThermalContext::default());
        let param = ParamFile::create(&dir.path().join("parameters"), ctx.clone()).unwrap();
        (dir, param, ctx)
    }

    #[test]
    fn test_publishes_current_value() {
        let (_dir, param, _) = param();
        assert_eq!(fs::read_to_string(param.path()).unwrap(), "38");
    }

    #[test]
    fn test_poll_updates_tunables() {
        let (_dir, mut param, ctx) = param();
        assert_eq!(param.poll(), None);

        fs::write(param.path(), "45\n").unwrap();
        assert_eq!(param.poll(), Some(45));
        assert_eq!(ctx.tunables.temp_threshold(), 45);

        // Unchanged content is not reported again.
        assert_eq!(param.poll(), None);
    }

    #[test]
    fn test_garbage_is_ignored() {
        let (_dir, mut param, ctx) = param();
        fs::write(param.path(), "hot").unwrap();
        assert_eq!(param.poll(), None);
        assert_eq!(param.poll(), None);
        assert_eq!(ctx.tunables.temp_threshold(), 38);

        fs::write(param.path(), "-3").unwrap();
        assert_eq!(param.poll(), Some(-3));
    }

    #[test]
    fn test_missing_file() {
        let (_dir, mut param, ctx) = param();
        fs::remove_file(param.path()).unwrap();
        assert_eq!(param.poll(), None);
        assert_eq!(ctx.tunables.temp_threshold(), 38);
        assert!(param.remove().is_err());
    }
}
