//! Master to fork replication.

use crate::config::DirectionConfig;
use crate::engine::{DirectionEngine, EngineContext};
use crate::error::SyncResult;
use crate::events::CycleReport;
use crate::fork::{DocumentMeta, ForkAdapter, ForkDocument, WriteOutcome};
use crate::master::MasterAdapter;
use async_trait::async_trait;
use replidb_protocol::{ChangeRow, Conflict, Direction, DocumentState, PullRequest, Resolution};
use tracing::{debug, trace};

/// What happened to one incoming document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The master state was written to the fork.
    Written,
    /// The conflict handler decided the fork state.
    Resolved,
    /// Master still holds the state the pending local write was based on.
    KeptLocal,
    /// The fork already held this exact state.
    Unchanged,
    /// The fork holds a newer state than the incoming one.
    Stale,
    /// The pull filter rejected the document.
    Filtered,
}

/// Counts for one applied batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchSummary {
    /// Documents written.
    pub written: usize,
    /// Conflicts resolved.
    pub resolved: usize,
    /// Documents left alone.
    pub skipped: usize,
}

/// Applies master change batches to the fork.
pub struct PullEngine<M, F> {
    ctx: EngineContext<M, F>,
    config: DirectionConfig,
}

impl<M: MasterAdapter, F: ForkAdapter> PullEngine<M, F> {
    /// Creates a pull engine.
    pub fn new(ctx: EngineContext<M, F>, config: DirectionConfig) -> Self {
        Self { ctx, config }
    }

    /// Applies rows strictly in order. Does not touch the checkpoint.
    pub async fn apply_batch(&self, rows: &[ChangeRow]) -> SyncResult<BatchSummary> {
        let mut summary = BatchSummary::default();
        for row in rows {
            let outcome = self.apply_row(&row.document).await?;
            trace!(key = %row.document.key, ?outcome, "pulled document");
            match outcome {
                ApplyOutcome::Written => summary.written += 1,
                ApplyOutcome::Resolved => {
                    summary.written += 1;
                    summary.resolved += 1;
                }
                ApplyOutcome::KeptLocal
                | ApplyOutcome::Unchanged
                | ApplyOutcome::Stale
                | ApplyOutcome::Filtered => summary.skipped += 1,
            }
            if matches!(outcome, ApplyOutcome::Written | ApplyOutcome::Resolved) {
                self.ctx.events.emit_received(&row.document);
            }
        }
        Ok(summary)
    }

    /// Applies one incoming master state, retrying on fork revision conflicts.
    ///
    /// A redelivered row older than the confirmed fork state is ignored, so a
    /// stale batch cannot revive a tombstone.
    pub async fn apply_row(&self, incoming: &DocumentState) -> SyncResult<ApplyOutcome> {
        if !self.config.admits(incoming) {
            return Ok(ApplyOutcome::Filtered);
        }

        let identity = &self.ctx.identity;
        loop {
            let current = self.ctx.fork.read_document(identity, &incoming.key).await?;
            let expected = current.as_ref().map(|doc| doc.state.revision.clone());

            let (target, outcome) = match &current {
                Some(doc) if doc.meta.needs_push => {
                    let assumed = doc.meta.assumed_master_state.as_ref();
                    if assumed.is_some_and(|a| a.content_eq(incoming)) {
                        return Ok(ApplyOutcome::KeptLocal);
                    }
                    (self.resolve(doc, incoming), ApplyOutcome::Resolved)
                }
                Some(doc)
                    if doc.state == *incoming
                        && doc.meta.assumed_master_state.as_ref() == Some(incoming) =>
                {
                    return Ok(ApplyOutcome::Unchanged);
                }
                Some(doc) if incoming.revision.height() < doc.state.revision.height() => {
                    trace!(
                        key = %incoming.key,
                        incoming = incoming.revision.height(),
                        held = doc.state.revision.height(),
                        "ignoring stale master state"
                    );
                    return Ok(ApplyOutcome::Stale);
                }
                _ => (ForkDocument::confirmed(incoming.clone()), ApplyOutcome::Written),
            };

            match self
                .ctx
                .fork
                .write_document(identity, target, expected.as_ref())
                .await?
            {
                WriteOutcome::Written => return Ok(outcome),
                WriteOutcome::RevisionConflict { .. } => {
                    debug!(key = %incoming.key, "fork changed during pull, retrying document");
                }
            }
        }
    }

    fn resolve(&self, local: &ForkDocument, incoming: &DocumentState) -> ForkDocument {
        let conflict = Conflict::new(
            local.state.clone(),
            local.meta.assumed_master_state.clone(),
            incoming.clone(),
        );
        match self.ctx.resolver.resolve(&conflict) {
            Resolution::Equal => ForkDocument::confirmed(incoming.clone()),
            Resolution::Resolved(out) if out.content_eq(incoming) => {
                ForkDocument::confirmed(incoming.clone())
            }
            Resolution::Resolved(out) => ForkDocument::new(
                local.state.rebased_onto(&out),
                DocumentMeta::pending(Some(incoming.clone())),
            ),
        }
    }
}

#[async_trait]
impl<M: MasterAdapter, F: ForkAdapter> DirectionEngine for PullEngine<M, F> {
    fn direction(&self) -> Direction {
        Direction::Pull
    }

    async fn run_cycle(&self) -> SyncResult<CycleReport> {
        let identity = &self.ctx.identity;
        let checkpoint = self.ctx.checkpoints.load(identity, Direction::Pull)?;
        let request = PullRequest::new(checkpoint, self.config.batch_size);

        let response = self.ctx.master.changed_documents_since(&request).await?;
        response.validate(&request)?;

        let summary = self.apply_batch(&response.documents).await?;

        if let Some(last) = response.last_checkpoint() {
            self.ctx.checkpoints.save(identity, Direction::Pull, last)?;
        }

        let drained = !response.has_more && response.len() < self.config.batch_size as usize;
        debug!(
            identity = %identity,
            batch = response.len(),
            written = summary.written,
            resolved = summary.resolved,
            drained,
            "pull cycle complete"
        );

        Ok(CycleReport {
            documents: summary.written,
            conflicts: summary.resolved,
            drained,
        })
    }
}
