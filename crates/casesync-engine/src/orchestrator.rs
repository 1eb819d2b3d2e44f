//! Runs one sync: discovery, filtering, then one transaction per questionnaire.

use std::sync::Arc;

use casesync_db::{CancelToken, Database, TableTransaction};
use serde::Serialize;
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

use crate::config::{FailurePolicy, SyncConfig};
use crate::directory::QuestionnaireDirectory;
use crate::error::{ConfigError, SyncError, SyncResult};
use crate::filter;
use crate::merge::MergeCopier;
use crate::observability::{questionnaire_span, sync_run_span};
use crate::provision::ensure_unedited;
use crate::questionnaire::{SyncMode, TableRefs};

/// What happened to one questionnaire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    /// The target was created, then merged into.
    Provisioned { rows: u64 },
    Merged { rows: u64 },
    /// Edit runs leave questionnaires without an edit table alone.
    SkippedMissingTarget,
    /// The transaction was rolled back.
    Failed { reason: String },
}

impl MergeOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QuestionnaireOutcome {
    pub questionnaire: String,
    #[serde(flatten)]
    pub outcome: MergeOutcome,
}

/// Per-questionnaire results of one run, in processing order.
#[derive(Clone, Debug, Serialize)]
pub struct SyncReport {
    pub run_id: String,
    pub mode: SyncMode,
    pub prefix: String,
    pub outcomes: Vec<QuestionnaireOutcome>,
    /// The run stopped early because its token was cancelled.
    pub cancelled: bool,
}

impl SyncReport {
    fn new(run_id: String, mode: SyncMode, prefix: &str) -> Self {
        Self {
            run_id,
            mode,
            prefix: prefix.to_string(),
            outcomes: Vec::new(),
            cancelled: false,
        }
    }

    fn count(&self, pred: impl Fn(&MergeOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|item| pred(&item.outcome)).count()
    }

    pub fn provisioned(&self) -> usize {
        self.count(|outcome| matches!(outcome, MergeOutcome::Provisioned { .. }))
    }

    pub fn merged(&self) -> usize {
        self.count(|outcome| matches!(outcome, MergeOutcome::Merged { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|outcome| matches!(outcome, MergeOutcome::SkippedMissingTarget))
    }

    pub fn failed(&self) -> usize {
        self.count(MergeOutcome::is_failed)
    }

    pub fn has_failures(&self) -> bool {
        self.cancelled || self.failed() > 0
    }

    pub fn outcome(&self, questionnaire: &str) -> Option<&MergeOutcome> {
        self.outcomes
            .iter()
            .find(|item| item.questionnaire == questionnaire)
            .map(|item| &item.outcome)
    }
}

/// Work that is done apart from its commit. `tx` is `None` when there is
/// nothing to commit.
struct Staged {
    tx: Option<Box<dyn TableTransaction>>,
    outcome: MergeOutcome,
}

pub struct Orchestrator {
    config: SyncConfig,
    directory: Arc<dyn QuestionnaireDirectory>,
    database: Arc<dyn Database>,
    copier: MergeCopier,
}

impl Orchestrator {
    pub fn new(
        config: SyncConfig,
        directory: Arc<dyn QuestionnaireDirectory>,
        database: Arc<dyn Database>,
    ) -> SyncResult<Self> {
        let copier = MergeCopier::new(&config.columns).map_err(|err| ConfigError::Invalid {
            key: "merge columns".to_string(),
            value: format!("{:?}", config.columns),
            reason: err.to_string(),
        })?;
        Ok(Self {
            config,
            directory,
            database,
            copier,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Syncs every questionnaire whose name starts with `prefix`.
    ///
    /// Only a failed discovery fails the whole run; per-questionnaire errors
    /// land in the report. Cancelling `cancel` rolls back the questionnaire
    /// in flight and stops the run.
    pub async fn run(
        &self,
        prefix: &str,
        mode: SyncMode,
        cancel: &CancelToken,
    ) -> SyncResult<SyncReport> {
        let run_id = Uuid::new_v4().to_string();
        let span = sync_run_span(&run_id, mode, prefix);
        self.run_inner(run_id, prefix, mode, cancel)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: String,
        prefix: &str,
        mode: SyncMode,
        cancel: &CancelToken,
    ) -> SyncResult<SyncReport> {
        let server_park = self.config.blaise.server_park.as_str();
        info!(server_park, backend = self.database.backend().as_str(), "starting sync run");

        let all = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            listed = self.directory.list_questionnaires(server_park) => listed?,
        };
        let discovered = all.len();
        let selected = filter::select(all, prefix, mode);
        info!(discovered, selected = selected.len(), "selected questionnaires");

        let mut report = SyncReport::new(run_id, mode, prefix);
        for questionnaire in selected {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let name = questionnaire.name;
            let outcome = match self
                .sync_questionnaire(&name, mode, cancel)
                .instrument(questionnaire_span(&name))
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(questionnaire = %name, error = %err, "questionnaire sync failed");
                    if matches!(err, SyncError::Cancelled) {
                        report.cancelled = true;
                    }
                    MergeOutcome::Failed {
                        reason: err.to_string(),
                    }
                }
            };
            let failed = outcome.is_failed();
            report.outcomes.push(QuestionnaireOutcome {
                questionnaire: name,
                outcome,
            });
            if report.cancelled {
                break;
            }
            if failed && self.config.failure_policy == FailurePolicy::Abort {
                warn!("stopping run after first failure");
                break;
            }
        }

        info!(
            provisioned = report.provisioned(),
            merged = report.merged(),
            skipped = report.skipped(),
            failed = report.failed(),
            cancelled = report.cancelled,
            "finished sync run"
        );
        Ok(report)
    }

    async fn sync_questionnaire(
        &self,
        name: &str,
        mode: SyncMode,
        cancel: &CancelToken,
    ) -> SyncResult<MergeOutcome> {
        let tables = mode
            .tables(name)
            .map_err(|err| SyncError::from_db(name, "derive tables", err))?;
        // Dropping the unfinished work drops its transaction, which rolls back.
        let staged = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            staged = self.stage(name, mode, &tables, cancel) => staged?,
        };
        let Some(tx) = staged.tx else {
            return Ok(staged.outcome);
        };
        // The commit is not raced against cancellation: once sent it either
        // lands or fails, and the outcome reports which.
        tx.commit()
            .await
            .map_err(|err| SyncError::from_db(name, "commit", err))?;
        Ok(staged.outcome)
    }

    /// Does a questionnaire's work up to, not including, the commit.
    async fn stage(
        &self,
        name: &str,
        mode: SyncMode,
        tables: &TableRefs,
        cancel: &CancelToken,
    ) -> SyncResult<Staged> {
        let mut tx = self
            .database
            .begin(Some(cancel))
            .await
            .map_err(|err| SyncError::from_db(name, "begin", err))?;

        let outcome = match mode {
            SyncMode::Unedited => {
                let provisioned = ensure_unedited(tx.as_mut(), &tables.target, &tables.source)
                    .await
                    .map_err(|err| SyncError::from_db(name, "provision", err))?;
                let rows = self.merge(name, tx.as_mut(), tables).await?;
                if provisioned.created {
                    MergeOutcome::Provisioned { rows }
                } else {
                    MergeOutcome::Merged { rows }
                }
            }
            SyncMode::Edit => {
                let exists = tx
                    .table_exists(&tables.target)
                    .await
                    .map_err(|err| SyncError::from_db(name, "table exists", err))?;
                if !exists {
                    error!(questionnaire = name, "Edit questionnaire missing for: '{name}'");
                    tx.rollback()
                        .await
                        .map_err(|err| SyncError::from_db(name, "rollback", err))?;
                    return Ok(Staged {
                        tx: None,
                        outcome: MergeOutcome::SkippedMissingTarget,
                    });
                }
                MergeOutcome::Merged {
                    rows: self.merge(name, tx.as_mut(), tables).await?,
                }
            }
        };
        Ok(Staged {
            tx: Some(tx),
            outcome,
        })
    }

    async fn merge(
        &self,
        name: &str,
        tx: &mut dyn TableTransaction,
        tables: &TableRefs,
    ) -> SyncResult<u64> {
        self.copier
            .merge(tx, &tables.target, &tables.source)
            .await
            .map_err(|err| SyncError::from_db(name, "merge", err))
    }
}
