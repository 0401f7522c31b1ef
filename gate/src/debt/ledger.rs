//! Debt ledger store — one YAML document, read-modify-write under an flock
//!
//! Writers take an exclusive lock on a `<ledger>.lock` sidecar for the whole
//! read-modify-write, so concurrent gate runs over one ledger never lose an
//! update. The document is replaced through a temp file and rename.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use tracing::debug;

use super::{DebtConfig, DebtLedger};
use crate::error::{GateError, GateResult};

#[derive(Debug, Clone)]
pub struct DebtLedgerStore {
    path: PathBuf,
    config: DebtConfig,
}

impl DebtLedgerStore {
    pub fn new(config: DebtConfig) -> Self {
        Self {
            path: config.ledger_path.clone(),
            config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "alignment_debt".to_string());
        self.path.with_file_name(format!("{name}.{suffix}"))
    }

    /// Snapshot of the ledger; empty when the file does not exist yet
    pub async fn load(&self) -> GateResult<DebtLedger> {
        let path = self.path.clone();
        let lock_path = self.sibling("lock");
        run_blocking(move || {
            let lock = open_lock(&path, &lock_path)?;
            lock.lock_shared()?;
            let ledger = read(&path);
            lock.unlock()?;
            ledger
        })
        .await
    }

    /// Applies `f` under the exclusive lock and persists the result.
    /// Nothing is written when `f` fails.
    pub async fn update<T, F>(&self, f: F) -> GateResult<T>
    where
        F: FnOnce(&mut DebtLedger) -> GateResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        let lock_path = self.sibling("lock");
        let tmp_path = self.sibling("tmp");
        let config = self.config.clone();
        run_blocking(move || {
            let lock = open_lock(&path, &lock_path)?;
            lock.lock_exclusive()?;
            let result = read(&path).and_then(|mut ledger| {
                let out = f(&mut ledger)?;
                ledger.summary = Some(ledger.summary(&config, Utc::now()));
                write(&path, &tmp_path, &ledger)?;
                debug!(
                    path = %path.display(),
                    entries = ledger.entries.len(),
                    "Debt ledger written"
                );
                Ok(out)
            });
            lock.unlock()?;
            result
        })
        .await
    }
}

async fn run_blocking<T, F>(f: F) -> GateResult<T>
where
    F: FnOnce() -> GateResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| GateError::store(format!("debt ledger task failed: {e}")))?
}

fn open_lock(path: &Path, lock_path: &Path) -> GateResult<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)?)
}

fn read(path: &Path) -> GateResult<DebtLedger> {
    match std::fs::read_to_string(path) {
        Ok(text) if text.trim().is_empty() => Ok(DebtLedger::default()),
        Ok(text) => Ok(serde_yaml::from_str(&text)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DebtLedger::default()),
        Err(e) => Err(e.into()),
    }
}

fn write(path: &Path, tmp_path: &Path, ledger: &DebtLedger) -> GateResult<()> {
    std::fs::write(tmp_path, serde_yaml::to_string(ledger)?)?;
    std::fs::rename(tmp_path, path)?;
    Ok(())
}
