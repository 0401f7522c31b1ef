//! Regression Store — injected persistence for cases and their ledgers
//!
//! Both backends only ever append: a case header is written once and audit
//! entries are added after it. Nothing is rewritten in place.
//!
//! `create_unique` is where the at-most-one-live-case rule is enforced. The
//! in-memory store checks and inserts under one write lock; the JSON-lines
//! store holds an exclusive `flock` on a per-fingerprint lock file while it
//! scans and writes, so separate processes sharing a ledger directory
//! serialize too.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{GateError, GateResult};
use crate::trajectory::Fingerprint;

use super::case::{CaseRecord, RegressionCase};
use super::state::AuditEntry;

/// Subdirectory of the ledger holding per-fingerprint lock files
pub const LOCK_DIR: &str = ".locks";

/// Persistence capability for the lifecycle manager
#[async_trait]
pub trait RegressionStore: Send + Sync {
    /// Persist a new case with its initial audit entries. Fails if the id
    /// already exists.
    async fn create(&self, case: &RegressionCase) -> GateResult<()>;

    /// Persist a new case unless an ACTIVE or MONITORING case already covers
    /// its fingerprint. Check and write are atomic for every writer sharing
    /// the store; a writer that finds the check held by another fails with
    /// `DuplicateRegression` without waiting.
    async fn create_unique(&self, case: &RegressionCase) -> GateResult<()>;

    /// Append one audit entry to an existing case
    async fn append(&self, case_id: &str, entry: &AuditEntry) -> GateResult<()>;

    async fn load(&self, case_id: &str) -> GateResult<Option<RegressionCase>>;

    /// Every case, oldest first
    async fn list(&self) -> GateResult<Vec<RegressionCase>>;
}

fn duplicate(fingerprint: &Fingerprint, existing_case: Option<&str>) -> GateError {
    GateError::DuplicateRegression {
        fingerprint: fingerprint.key(),
        existing_case: existing_case.map(str::to_string),
    }
}

/// Id of the live case covering `fingerprint`, if any
fn find_live<'a>(
    cases: impl IntoIterator<Item = &'a RegressionCase>,
    fingerprint: &Fingerprint,
) -> GateResult<Option<&'a str>> {
    for case in cases {
        if case.fingerprint() == fingerprint && case.state()?.is_live() {
            return Ok(Some(case.id()));
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Store for tests and dry runs
#[derive(Debug, Default)]
pub struct InMemoryRegressionStore {
    cases: RwLock<BTreeMap<String, RegressionCase>>,
}

impl InMemoryRegressionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegressionStore for InMemoryRegressionStore {
    async fn create(&self, case: &RegressionCase) -> GateResult<()> {
        let mut cases = self.cases.write().await;
        if cases.contains_key(case.id()) {
            return Err(GateError::store(format!("case {} already exists", case.id())));
        }
        cases.insert(case.id().to_string(), case.clone());
        Ok(())
    }

    async fn create_unique(&self, case: &RegressionCase) -> GateResult<()> {
        let mut cases = self.cases.write().await;
        if let Some(existing) = find_live(cases.values(), case.fingerprint())? {
            return Err(duplicate(case.fingerprint(), Some(existing)));
        }
        if cases.contains_key(case.id()) {
            return Err(GateError::store(format!("case {} already exists", case.id())));
        }
        cases.insert(case.id().to_string(), case.clone());
        Ok(())
    }

    async fn append(&self, case_id: &str, entry: &AuditEntry) -> GateResult<()> {
        let mut cases = self.cases.write().await;
        let case = cases.get_mut(case_id).ok_or_else(|| GateError::CaseNotFound {
            case_id: case_id.to_string(),
        })?;
        case.audit_log.push(entry.clone());
        Ok(())
    }

    async fn load(&self, case_id: &str) -> GateResult<Option<RegressionCase>> {
        Ok(self.cases.read().await.get(case_id).cloned())
    }

    async fn list(&self) -> GateResult<Vec<RegressionCase>> {
        let mut all: Vec<_> = self.cases.read().await.values().cloned().collect();
        all.sort_by_key(|c| c.record.created_at);
        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// JSON-lines ledger
// ---------------------------------------------------------------------------

/// One line of a case ledger file
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum LedgerLine {
    Case(CaseRecord),
    Audit(AuditEntry),
}

/// Append-only ledger: `<dir>/<case_id>.jsonl`, header line then one line
/// per audit entry
#[derive(Debug, Clone)]
pub struct JsonlRegressionStore {
    dir: PathBuf,
}

impl JsonlRegressionStore {
    /// Open (creating the directory and its lock directory if needed)
    pub async fn open(dir: impl Into<PathBuf>) -> GateResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(dir.join(LOCK_DIR)).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn case_path(&self, case_id: &str) -> GateResult<PathBuf> {
        if case_id.is_empty()
            || case_id.contains(['/', '\\'])
            || case_id.starts_with('.')
        {
            return Err(GateError::store(format!("invalid case id '{case_id}'")));
        }
        Ok(self.dir.join(format!("{case_id}.jsonl")))
    }

    /// `<dir>/.locks/<category>__<trigger>.lock`, with anything outside
    /// `[A-Za-z0-9_-]` replaced so the key is a safe file name
    fn lock_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        let sanitize = |raw: &str| -> String {
            raw.chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
                .collect()
        };
        self.dir.join(LOCK_DIR).join(format!(
            "{}__{}.lock",
            sanitize(&fingerprint.category),
            sanitize(&fingerprint.trigger)
        ))
    }

    async fn read_ledger(path: &Path) -> GateResult<RegressionCase> {
        let text = tokio::fs::read_to_string(path).await?;
        let mut record = None;
        let mut audit_log = Vec::new();
        for (idx, line) in text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
            let parsed: LedgerLine = serde_json::from_str(line).map_err(|e| {
                GateError::store(format!("{}:{}: {e}", path.display(), idx + 1))
            })?;
            match (parsed, record.is_some()) {
                (LedgerLine::Case(header), false) => record = Some(header),
                (LedgerLine::Case(_), true) => {
                    return Err(GateError::store(format!(
                        "{}:{}: duplicate case header",
                        path.display(),
                        idx + 1
                    )))
                }
                (LedgerLine::Audit(entry), true) => audit_log.push(entry),
                (LedgerLine::Audit(_), false) => {
                    return Err(GateError::store(format!(
                        "{}: audit entry before case header",
                        path.display()
                    )))
                }
            }
        }
        let record = record
            .ok_or_else(|| GateError::store(format!("{}: missing case header", path.display())))?;
        Ok(RegressionCase { record, audit_log })
    }
}

fn encode_line(line: &LedgerLine) -> GateResult<String> {
    let mut json = serde_json::to_string(line)?;
    json.push('\n');
    Ok(json)
}

#[async_trait]
impl RegressionStore for JsonlRegressionStore {
    async fn create(&self, case: &RegressionCase) -> GateResult<()> {
        let path = self.case_path(case.id())?;
        let mut buf = encode_line(&LedgerLine::Case(case.record.clone()))?;
        for entry in &case.audit_log {
            buf.push_str(&encode_line(&LedgerLine::Audit(entry.clone()))?);
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    GateError::store(format!("case {} already exists", case.id()))
                }
                _ => GateError::Io(e),
            })?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        debug!(path = %path.display(), "Created case ledger");
        Ok(())
    }

    async fn create_unique(&self, case: &RegressionCase) -> GateResult<()> {
        let fingerprint = case.fingerprint();
        let lock_path = self.lock_path(fingerprint);
        let lock_file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .await?
            .into_std()
            .await;
        if let Err(e) = lock_file.try_lock_exclusive() {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                warn!(
                    fingerprint = %fingerprint,
                    lock = %lock_path.display(),
                    "Promotion lock held by another writer"
                );
                return Err(duplicate(fingerprint, None));
            }
            return Err(GateError::Io(e));
        }

        let result = match find_live(&self.list().await?, fingerprint)? {
            Some(existing) => Err(duplicate(fingerprint, Some(existing))),
            None => self.create(case).await,
        };
        // Closing the descriptor releases the flock
        drop(lock_file);
        result
    }

    async fn append(&self, case_id: &str, entry: &AuditEntry) -> GateResult<()> {
        let path = self.case_path(case_id)?;
        let line = encode_line(&LedgerLine::Audit(entry.clone()))?;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => GateError::CaseNotFound {
                    case_id: case_id.to_string(),
                },
                _ => GateError::Io(e),
            })?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!(path = %path.display(), sequence = entry.sequence, "Appended audit entry");
        Ok(())
    }

    async fn load(&self, case_id: &str) -> GateResult<Option<RegressionCase>> {
        let path = self.case_path(case_id)?;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        Self::read_ledger(&path).await.map(Some)
    }

    async fn list(&self) -> GateResult<Vec<RegressionCase>> {
        let mut cases = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                cases.push(Self::read_ledger(&path).await?);
            }
        }
        cases.sort_by(|a, b| {
            a.record
                .created_at
                .cmp(&b.record.created_at)
                .then_with(|| a.record.case_id.cmp(&b.record.case_id))
        });
        Ok(cases)
    }
}
