#![forbid(unsafe_code)]
#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;
use tally_engines::render::{ArtifactRenderer, CanonicalJsonRenderer};
use tally_kernel_contracts::audit::AuditAction;
use tally_kernel_contracts::batch::{BatchId, BatchRecord};
use tally_kernel_contracts::evaluation::{
    DomainKey, DomainScore, EvaluationId, EvaluationRecord, SubjectId,
};
use tally_kernel_contracts::security::{ActorId, Role, SecurityContext, TenantId};
use tally_kernel_contracts::MonotonicTimeNs;
use tally_os::{
    BatchRecomputeRuntime, EmissionConfig, IntegrityVerifier, RecomputeOutcome,
    ReportEmissionRuntime, ReportReadApi,
};
use tally_storage::artifact::{ArtifactStore, InMemoryArtifactStore};
use tally_storage::repo::AuditLogRepo;
use tally_storage::StoreHandle;

pub fn manager(tenant: &str) -> SecurityContext {
    SecurityContext::v1(
        ActorId::new("mgr_1").unwrap(),
        Role::Manager,
        TenantId::new(tenant).unwrap(),
    )
    .unwrap()
}

pub fn bid(id: &str) -> BatchId {
    BatchId::new(id).unwrap()
}

pub fn eid(id: &str) -> EvaluationId {
    EvaluationId::new(id).unwrap()
}

pub fn scores(reading: i64) -> Vec<DomainScore> {
    vec![
        DomainScore::v1(DomainKey::new("reading").unwrap(), Decimal::new(reading, 0)).unwrap(),
        DomainScore::v1(DomainKey::new("math").unwrap(), Decimal::new(100 - reading, 0)).unwrap(),
    ]
}

pub struct Harness {
    pub store: StoreHandle,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub recompute: BatchRecomputeRuntime,
    pub read: ReportReadApi,
    clock: AtomicU64,
}

impl Harness {
    pub fn in_memory() -> (Self, Arc<InMemoryArtifactStore>) {
        let mem = Arc::new(InMemoryArtifactStore::new());
        let h = Self::with(mem.clone(), EmissionConfig::mvp_v1());
        (h, mem)
    }

    pub fn with(artifacts: Arc<dyn ArtifactStore>, config: EmissionConfig) -> Self {
        Self::with_renderer(artifacts, Arc::new(CanonicalJsonRenderer), config)
    }

    pub fn with_renderer(
        artifacts: Arc<dyn ArtifactStore>,
        renderer: Arc<dyn ArtifactRenderer>,
        config: EmissionConfig,
    ) -> Self {
        let store = StoreHandle::new_in_memory();
        let emission =
            ReportEmissionRuntime::new(store.clone(), artifacts.clone(), renderer, config)
                .unwrap();
        let verifier = IntegrityVerifier::new(store.clone(), artifacts.clone());
        Self {
            read: ReportReadApi::new(store.clone(), verifier),
            recompute: BatchRecomputeRuntime::new(emission),
            store,
            artifacts,
            clock: AtomicU64::new(100),
        }
    }

    pub fn now(&self) -> MonotonicTimeNs {
        MonotonicTimeNs(self.clock.fetch_add(1, Ordering::SeqCst))
    }

    pub fn emission(&self) -> &ReportEmissionRuntime {
        self.recompute.emission()
    }

    /// Releases `batch` with evaluations `{batch}_e1..={batch}_e{n}`.
    pub fn release(&self, ctx: &SecurityContext, batch: &str, n: usize) -> Vec<EvaluationId> {
        let tenant = ctx.tenant_id.clone();
        let ids: Vec<EvaluationId> = (1..=n).map(|i| eid(&format!("{batch}_e{i}"))).collect();
        let rows = ids
            .iter()
            .map(|id| {
                EvaluationRecord::started_v1(
                    id.clone(),
                    bid(batch),
                    tenant.clone(),
                    SubjectId::new(format!("subj_{id}")).unwrap(),
                    MonotonicTimeNs(2),
                )
                .unwrap()
            })
            .collect();
        self.store
            .transaction(Some(ctx), |txn| {
                txn.release_batch(
                    BatchRecord::released_v1(bid(batch), tenant.clone(), MonotonicTimeNs(1))
                        .unwrap(),
                    rows,
                )
            })
            .unwrap();
        ids
    }

    pub fn complete(
        &self,
        ctx: &SecurityContext,
        evaluation_id: &EvaluationId,
        reading: i64,
    ) -> RecomputeOutcome {
        let at = self.now();
        self.store
            .transaction(Some(ctx), |txn| {
                txn.complete_evaluation(evaluation_id, scores(reading), at)
            })
            .unwrap();
        self.recompute
            .recompute_for_evaluation(Some(ctx), evaluation_id, self.now())
            .unwrap()
    }

    pub fn inactivate(&self, ctx: &SecurityContext, evaluation_id: &EvaluationId) -> RecomputeOutcome {
        let at = self.now();
        self.store
            .transaction(Some(ctx), |txn| {
                txn.inactivate_evaluation(evaluation_id, "subject withdrew", at)
            })
            .unwrap();
        self.recompute
            .recompute_for_evaluation(Some(ctx), evaluation_id, self.now())
            .unwrap()
    }

    pub fn reset_evaluation(
        &self,
        ctx: &SecurityContext,
        evaluation_id: &EvaluationId,
    ) -> RecomputeOutcome {
        let at = self.now();
        self.store
            .transaction(Some(ctx), |txn| txn.reset_evaluation(evaluation_id, at))
            .unwrap();
        self.recompute
            .recompute_for_evaluation(Some(ctx), evaluation_id, self.now())
            .unwrap()
    }

    pub fn audit_actions(&self, ctx: &SecurityContext, batch: &str) -> Vec<AuditAction> {
        self.store.read(Some(ctx), |txn| {
            txn.audit_rows_for_batch(&bid(batch))
                .into_iter()
                .map(|e| e.action)
                .collect()
        })
    }
}
