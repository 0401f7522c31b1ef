//! Lifecycle Manager — the only writer of regression case state
//!
//! Two lock tables:
//! - per fingerprint, taken with `try_lock` during promotion so a losing
//!   concurrent promoter fails with `DuplicateRegression` instead of waiting;
//! - per case id, awaited during transitions so writers to one ledger are
//!   serialized.
//!
//! Entries are dropped once the last holder releases them. Cross-process
//! exclusion for promotion lives in `RegressionStore::create_unique`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{GateError, GateResult};
use crate::grading::RiskVerdict;
use crate::replay::ReplayTrace;
use crate::trajectory::{Fingerprint, Incident};

use super::case::{CaseRecord, ExpectedBehavior, RegressionCase, RegressionCaseExport};
use super::decay::{DecayPolicy, DecayRecommendation, DECAY_ACTOR};
use super::state::{AuditEntry, LifecycleState, TransitionAction};
use super::store::RegressionStore;

type LockTable = Mutex<HashMap<String, Arc<Mutex<()>>>>;

/// Everything needed to turn an assessed incident into a regression case
#[derive(Debug, Clone)]
pub struct PromotionRequest<'a> {
    pub incident: &'a Incident,
    pub fingerprint: Fingerprint,
    pub verdict: &'a RiskVerdict,
    /// Replay under the baseline configuration
    pub baseline: &'a ReplayTrace,
    pub actor: &'a str,
}

/// Registry counts by state and failure category
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageSummary {
    pub total: usize,
    pub by_state: BTreeMap<LifecycleState, usize>,
    /// Live (ACTIVE or MONITORING) cases per failure category
    pub live_by_category: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
}

pub struct LifecycleManager {
    store: Arc<dyn RegressionStore>,
    promotion_locks: LockTable,
    case_locks: LockTable,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager").finish_non_exhaustive()
    }
}

async fn lock_for(table: &LockTable, key: &str) -> Arc<Mutex<()>> {
    table
        .lock()
        .await
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Remove the entry once only the table and the caller still hold it
async fn release(table: &LockTable, key: &str, lock: Arc<Mutex<()>>) {
    let mut locks = table.lock().await;
    let idle = locks
        .get(key)
        .is_some_and(|held| Arc::ptr_eq(held, &lock) && Arc::strong_count(&lock) == 2);
    if idle {
        locks.remove(key);
    }
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn RegressionStore>) -> Self {
        Self {
            store,
            promotion_locks: Mutex::new(HashMap::new()),
            case_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn RegressionStore> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get(&self, case_id: &str) -> GateResult<RegressionCase> {
        self.store
            .load(case_id)
            .await?
            .ok_or_else(|| GateError::CaseNotFound {
                case_id: case_id.to_string(),
            })
    }

    pub async fn list(&self) -> GateResult<Vec<RegressionCase>> {
        self.store.list().await
    }

    /// Any case, in any state, for this fingerprint (the regression flag)
    pub async fn has_case_for(&self, fingerprint: &Fingerprint) -> GateResult<bool> {
        Ok(self
            .store
            .list()
            .await?
            .iter()
            .any(|c| c.fingerprint() == fingerprint))
    }

    /// The ACTIVE or MONITORING case for this fingerprint, if any
    pub async fn live_case_for(
        &self,
        fingerprint: &Fingerprint,
    ) -> GateResult<Option<RegressionCase>> {
        for case in self.store.list().await? {
            if case.fingerprint() == fingerprint && case.state()?.is_live() {
                return Ok(Some(case));
            }
        }
        Ok(None)
    }

    pub async fn export(&self, case_id: &str) -> GateResult<RegressionCaseExport> {
        self.get(case_id).await?.export()
    }

    pub async fn export_all(&self) -> GateResult<Vec<RegressionCaseExport>> {
        self.list().await?.iter().map(RegressionCase::export).collect()
    }

    pub async fn coverage(&self) -> GateResult<CoverageSummary> {
        let mut summary = CoverageSummary::default();
        for state in LifecycleState::ALL {
            summary.by_state.insert(state, 0);
        }
        for case in self.list().await? {
            let state = case.state()?;
            let category = case.fingerprint().category.clone();
            summary.total += 1;
            *summary.by_state.entry(state).or_default() += 1;
            if state.is_live() {
                *summary.live_by_category.entry(category.clone()).or_default() += 1;
            }
            *summary.by_category.entry(category).or_default() += 1;
        }
        Ok(summary)
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Create an ACTIVE regression case.
    ///
    /// Fails with `DuplicateRegression` when a live case already covers the
    /// fingerprint, or when another promotion of the same fingerprint is in
    /// flight. A cancelled promotion writes nothing.
    pub async fn promote(
        &self,
        request: PromotionRequest<'_>,
        cancel: &CancellationToken,
    ) -> GateResult<RegressionCase> {
        let key = request.fingerprint.key();
        let lock = lock_for(&self.promotion_locks, &key).await;
        let result = match lock.try_lock() {
            Ok(_guard) => self.promote_locked(&request, cancel).await,
            Err(_) => {
                warn!(fingerprint = %key, "Concurrent promotion rejected");
                Err(GateError::DuplicateRegression {
                    fingerprint: key.clone(),
                    existing_case: None,
                })
            }
        };
        release(&self.promotion_locks, &key, lock).await;
        result
    }

    async fn promote_locked(
        &self,
        request: &PromotionRequest<'_>,
        cancel: &CancellationToken,
    ) -> GateResult<RegressionCase> {
        let uuid = Uuid::new_v4().simple().to_string();
        let case_id = format!("REG-{}-{}", request.incident.id(), &uuid[..8]);
        let reason = format!(
            "{} verdict {} ({})",
            request.incident.id(),
            request.verdict.verdict,
            request.verdict.primary_reason()
        );
        let case = RegressionCase {
            record: CaseRecord {
                case_id: case_id.clone(),
                source_incident: request.incident.id().to_string(),
                incident_version: request.incident.version(),
                severity: request.incident.severity(),
                fingerprint: request.fingerprint.clone(),
                expected: ExpectedBehavior::derive(request.baseline, request.verdict),
                created_at: Utc::now(),
            },
            audit_log: vec![AuditEntry::promotion(&case_id, request.actor, &reason)?],
        };

        if cancel.is_cancelled() {
            return Err(GateError::cancelled(format!("promotion of {}", request.incident.id())));
        }
        // Live-case check and write happen together inside the store
        self.store.create_unique(&case).await?;

        info!(
            case_id = %case_id,
            incident_id = request.incident.id(),
            fingerprint = %request.fingerprint,
            verdict = %request.verdict.verdict,
            max_safe_turn = case.record.expected.max_safe_turn,
            "Regression case promoted"
        );
        Ok(case)
    }

    /// Advance a case one step along ACTIVE → MONITORING → DEPRECATED → RETIRED
    pub async fn transition(
        &self,
        case_id: &str,
        to: LifecycleState,
        actor: &str,
        reason: &str,
    ) -> GateResult<RegressionCase> {
        self.append_transition(case_id, to, TransitionAction::Advance, actor, reason)
            .await
    }

    /// ACTIVE → RETIRED, recording the skipped states
    pub async fn emergency_retire(
        &self,
        case_id: &str,
        actor: &str,
        reason: &str,
    ) -> GateResult<RegressionCase> {
        self.append_transition(
            case_id,
            LifecycleState::Retired,
            TransitionAction::EmergencyRetire,
            actor,
            reason,
        )
        .await
    }

    async fn append_transition(
        &self,
        case_id: &str,
        to: LifecycleState,
        action: TransitionAction,
        actor: &str,
        reason: &str,
    ) -> GateResult<RegressionCase> {
        let lock = lock_for(&self.case_locks, case_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.append_transition_locked(case_id, to, action, actor, reason)
                .await
        };
        release(&self.case_locks, case_id, lock).await;
        result
    }

    async fn append_transition_locked(
        &self,
        case_id: &str,
        to: LifecycleState,
        action: TransitionAction,
        actor: &str,
        reason: &str,
    ) -> GateResult<RegressionCase> {
        let mut case = self.get(case_id).await?;
        let from = case.state()?;
        let entry = AuditEntry::transition(
            case_id,
            case.audit_log.len() as u32 + 1,
            from,
            to,
            action,
            actor,
            reason,
        )?;
        self.store.append(case_id, &entry).await?;

        info!(
            case_id,
            from = %from,
            to = %to,
            action = %action,
            actor = %entry.actor,
            skipped = ?entry.skipped,
            "Regression case transitioned"
        );
        case.audit_log.push(entry);
        Ok(case)
    }

    /// Evaluate the decay policy over every case. With `apply`, each
    /// recommendation is performed as an audited transition.
    pub async fn apply_decay(
        &self,
        policy: &DecayPolicy,
        now: DateTime<Utc>,
        apply: bool,
    ) -> GateResult<Vec<DecayRecommendation>> {
        policy.validate()?;
        let mut recommendations = Vec::new();
        for case in self.list().await? {
            if let Some(rec) = policy.recommend(&case, now)? {
                recommendations.push(rec);
            }
        }
        if apply {
            for rec in &recommendations {
                self.transition(&rec.case_id, rec.to, DECAY_ACTOR, &rec.reason(policy))
                    .await?;
            }
        }
        info!(
            recommendations = recommendations.len(),
            applied = apply,
            "Decay policy evaluated"
        );
        Ok(recommendations)
    }
}
