//! Fork to master replication.

use crate::config::DirectionConfig;
use crate::engine::{DirectionEngine, EngineContext};
use crate::error::SyncResult;
use crate::events::CycleReport;
use crate::fork::{DocumentMeta, ForkAdapter, ForkDocument, WriteOutcome};
use crate::master::MasterAdapter;
use async_trait::async_trait;
use replidb_protocol::{
    Conflict, Direction, DocumentState, PushOutcome, PushRequest, PushRow, Resolution,
};
use tracing::{debug, trace};

/// What became of a row master rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    /// The application rewrote the document meanwhile.
    Skipped,
    /// The fork now holds the master state.
    Confirmed,
    /// The resolved state was written back as a new pending write.
    Requeued,
}

/// Sends unconfirmed fork writes to master.
pub struct PushEngine<M, F> {
    ctx: EngineContext<M, F>,
    config: DirectionConfig,
}

impl<M: MasterAdapter, F: ForkAdapter> PushEngine<M, F> {
    /// Creates a push engine.
    pub fn new(ctx: EngineContext<M, F>, config: DirectionConfig) -> Self {
        Self { ctx, config }
    }

    /// Returns true if a filter-passing document still waits after the push
    /// checkpoint.
    pub async fn has_pending(&self) -> SyncResult<bool> {
        let mut checkpoint = self
            .ctx
            .checkpoints
            .load(&self.ctx.identity, Direction::Push)?;
        loop {
            let changes = self
                .ctx
                .fork
                .changes_since(&self.ctx.identity, checkpoint.as_ref(), self.config.batch_size)
                .await?;
            if changes
                .iter()
                .any(|change| self.config.admits(&change.document.state))
            {
                return Ok(true);
            }
            match changes.last() {
                Some(last) if changes.len() >= self.config.batch_size as usize => {
                    checkpoint = Some(last.checkpoint.clone());
                }
                _ => return Ok(false),
            }
        }
    }

    /// Records master's acceptance of `sent`.
    ///
    /// If the application wrote again after the batch was read, the document
    /// stays pending on top of the confirmed state.
    async fn confirm(&self, sent: &DocumentState) -> SyncResult<()> {
        let identity = &self.ctx.identity;
        loop {
            let Some(current) = self.ctx.fork.read_document(identity, &sent.key).await? else {
                return Ok(());
            };
            let still_pending = current.state.revision != sent.revision;
            let expected = current.state.revision.clone();
            let target = ForkDocument::new(
                current.state,
                DocumentMeta {
                    needs_push: still_pending,
                    assumed_master_state: Some(sent.clone()),
                },
            );

            match self
                .ctx
                .fork
                .write_document(identity, target, Some(&expected))
                .await?
            {
                WriteOutcome::Written => return Ok(()),
                WriteOutcome::RevisionConflict { .. } => {
                    debug!(key = %sent.key, "fork changed during confirm, retrying");
                }
            }
        }
    }

    /// Resolves a rejected row against the real master state.
    ///
    /// A document the application rewrote in the meantime is skipped; that
    /// write stays pending and is resolved when its own push is rejected.
    async fn resolve_rejected(&self, row: &PushRow, real: &DocumentState) -> SyncResult<Rejection> {
        let identity = &self.ctx.identity;
        let sent = &row.new_document_state;
        let Some(current) = self.ctx.fork.read_document(identity, &sent.key).await? else {
            return Ok(Rejection::Skipped);
        };
        if current.state.revision != sent.revision {
            return Ok(Rejection::Skipped);
        }

        let conflict = Conflict::new(
            sent.clone(),
            row.assumed_master_state.clone(),
            real.clone(),
        );
        let (target, rejection) = match self.ctx.resolver.resolve(&conflict) {
            Resolution::Equal => (ForkDocument::confirmed(real.clone()), Rejection::Confirmed),
            Resolution::Resolved(out) if out.content_eq(real) => {
                (ForkDocument::confirmed(real.clone()), Rejection::Confirmed)
            }
            Resolution::Resolved(out) => (
                ForkDocument::new(
                    current.state.rebased_onto(&out),
                    DocumentMeta::pending(Some(real.clone())),
                ),
                Rejection::Requeued,
            ),
        };

        let written = self
            .ctx
            .fork
            .write_document(identity, target, Some(&current.state.revision))
            .await?;
        Ok(if written.is_written() {
            rejection
        } else {
            Rejection::Skipped
        })
    }
}

#[async_trait]
impl<M: MasterAdapter, F: ForkAdapter> DirectionEngine for PushEngine<M, F> {
    fn direction(&self) -> Direction {
        Direction::Push
    }

    async fn run_cycle(&self) -> SyncResult<CycleReport> {
        let identity = &self.ctx.identity;
        let checkpoint = self.ctx.checkpoints.load(identity, Direction::Push)?;
        let changes = self
            .ctx
            .fork
            .changes_since(identity, checkpoint.as_ref(), self.config.batch_size)
            .await?;

        let Some(last_checkpoint) = changes.last().map(|change| change.checkpoint.clone()) else {
            return Ok(CycleReport {
                drained: true,
                ..CycleReport::default()
            });
        };
        let mut drained = changes.len() < self.config.batch_size as usize;

        let rows: Vec<PushRow> = changes
            .into_iter()
            .filter(|change| self.config.admits(&change.document.state))
            .map(|change| {
                PushRow::new(
                    change.document.state,
                    change.document.meta.assumed_master_state,
                )
            })
            .collect();

        let mut accepted = 0;
        let mut conflicts = 0;
        if !rows.is_empty() {
            let request = PushRequest::new(rows);
            let response = self.ctx.master.send_write_batch(&request).await?;
            response.validate(&request)?;

            for (row, outcome) in request.rows.iter().zip(&response.outcomes) {
                match outcome {
                    PushOutcome::Accepted { .. } => {
                        self.confirm(&row.new_document_state).await?;
                        self.ctx.events.emit_sent(&row.new_document_state);
                        accepted += 1;
                    }
                    PushOutcome::Conflict {
                        current_master_state,
                    } => {
                        let rejection = self.resolve_rejected(row, current_master_state).await?;
                        trace!(key = %row.new_document_state.key, ?rejection, "push rejected");
                        if rejection == Rejection::Requeued {
                            drained = false;
                        }
                        conflicts += 1;
                    }
                }
            }
        }

        self.ctx
            .checkpoints
            .save(identity, Direction::Push, &last_checkpoint)?;

        debug!(
            identity = %identity,
            accepted,
            conflicts,
            drained,
            "push cycle complete"
        );

        Ok(CycleReport {
            documents: accepted,
            conflicts,
            drained,
        })
    }
}
