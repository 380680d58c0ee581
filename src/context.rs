//! The explicit conversion context threaded through every pass.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context as _;
use anyhow::Result;
use indicatif::MultiProgress;
use tempfile::TempDir;

use crate::project::Layout;
use crate::project::SymbolTransform;
use crate::symbols::StrategyRule;

/// Everything the user asked for, resolved and validated.
pub struct Config {
    pub cvs_path: PathBuf,
    pub layout: Layout,
    pub prune: bool,
    pub encodings: Vec<String>,
    pub fallback_encoding: Option<String>,
    pub symbol_rules: Vec<StrategyRule>,
    pub symbol_transforms: Vec<SymbolTransform>,
    pub dumpfile: Option<PathBuf>,
    pub svnrepos: Option<PathBuf>,
    pub bdb_txn_nosync: bool,
}

pub struct Context {
    pub config: Config,
    pub artifacts: Artifacts,
    pub progress: MultiProgress,
}

impl Context {
    pub fn new(config: Config, tmpdir: Option<PathBuf>, progress: MultiProgress) -> Result<Self> {
        Ok(Self { config, artifacts: Artifacts::new(tmpdir)?, progress })
    }
}

/// Hands out stable names for the intermediate files and owns their
/// lifetime: a generated temporary directory disappears with the
/// conversion, a user-supplied `--tmpdir` is left alone.
pub struct Artifacts {
    dir: PathBuf,
    _temp: Option<TempDir>,
}

impl Artifacts {
    pub fn new(tmpdir: Option<PathBuf>) -> Result<Self> {
        match tmpdir {
            Some(dir) => {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("could not create tmpdir {}", dir.display()))?;
                Ok(Self { dir, _temp: None })
            }
            None => {
                let temp = TempDir::new().context("could not create a temporary directory")?;
                Ok(Self { dir: temp.path().to_path_buf(), _temp: Some(temp) })
            }
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
