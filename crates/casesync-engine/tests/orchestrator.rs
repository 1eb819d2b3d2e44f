mod common;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use casesync_db::{Backend, CancelToken, Database, DbError, DbResult, Ident, TableTransaction};
use casesync_engine::{
    FailurePolicy, MergeOutcome, Orchestrator, SyncError, SyncMode, TriggerRequest, trigger,
};

use common::{StaticDirectory, config};

type Log = Arc<Mutex<Vec<String>>>;

/// Where a transaction sits waiting, if anywhere.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Stall {
    Never,
    Merge,
    Commit,
}

/// In-memory gateway that records every call it receives.
struct RecordingDatabase {
    tables: Arc<Mutex<HashSet<String>>>,
    log: Log,
    stall: Stall,
}

impl RecordingDatabase {
    fn new(tables: &[&str]) -> Arc<Self> {
        Self::build(tables, Stall::Never)
    }

    fn stalling(tables: &[&str], stall: Stall) -> Arc<Self> {
        Self::build(tables, stall)
    }

    fn build(tables: &[&str], stall: Stall) -> Arc<Self> {
        Arc::new(Self {
            tables: Arc::new(Mutex::new(tables.iter().map(|t| t.to_string()).collect())),
            log: Log::default(),
            stall,
        })
    }

    fn calls(&self) -> Vec<String> {
        self.log.lock().expect("log").clone()
    }
}

#[async_trait]
impl Database for RecordingDatabase {
    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    async fn begin(&self, _cancel: Option<&CancelToken>) -> DbResult<Box<dyn TableTransaction>> {
        self.log.lock().expect("log").push("begin".to_string());
        Ok(Box::new(RecordingTransaction {
            tables: Arc::clone(&self.tables),
            log: Arc::clone(&self.log),
            stall: self.stall,
            finished: false,
        }))
    }
}

struct RecordingTransaction {
    tables: Arc<Mutex<HashSet<String>>>,
    log: Log,
    stall: Stall,
    finished: bool,
}

impl RecordingTransaction {
    fn record(&self, call: String) {
        self.log.lock().expect("log").push(call);
    }
}

#[async_trait]
impl TableTransaction for RecordingTransaction {
    async fn table_exists(&mut self, table: &Ident) -> DbResult<bool> {
        self.record(format!("exists {table}"));
        Ok(self.tables.lock().expect("tables").contains(table.as_str()))
    }

    async fn columns(&mut self, table: &Ident) -> DbResult<Vec<Ident>> {
        self.record(format!("columns {table}"));
        if !self.tables.lock().expect("tables").contains(table.as_str()) {
            return Ok(Vec::new());
        }
        ["Serial_Number", "QEdit_edited", "QEdit_LastUpdated", "DataStream"]
            .into_iter()
            .map(Ident::new)
            .collect()
    }

    async fn clone_table_schema(&mut self, target: &Ident, source: &Ident) -> DbResult<()> {
        self.record(format!("clone {target} from {source}"));
        self.tables
            .lock()
            .expect("tables")
            .insert(target.to_string());
        Ok(())
    }

    async fn execute(&mut self, statement: &str) -> DbResult<u64> {
        self.record("execute".to_string());
        if self.stall == Stall::Merge {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if statement.contains("LMS") {
            return Err(DbError::statement("execute", "disk I/O error"));
        }
        Ok(3)
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        let mut this = self;
        if this.stall == Stall::Commit {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        this.finished = true;
        this.record("commit".to_string());
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DbResult<()> {
        let mut this = self;
        this.finished = true;
        this.record("rollback".to_string());
        Ok(())
    }
}

impl Drop for RecordingTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.record("dropped".to_string());
        }
    }
}

fn orchestrator(
    names: &[&str],
    database: Arc<RecordingDatabase>,
    policy: FailurePolicy,
) -> Orchestrator {
    Orchestrator::new(config(policy), StaticDirectory::new(names), database).expect("orchestrator")
}

#[tokio::test]
async fn unedited_run_provisions_then_merges_in_one_transaction() {
    let database = RecordingDatabase::new(&["FRS2504A_Form"]);
    let orchestrator = orchestrator(&["FRS2504A"], Arc::clone(&database), FailurePolicy::Isolate);

    let report = orchestrator
        .run("FRS", SyncMode::Unedited, &CancelToken::new())
        .await
        .expect("run");

    assert_eq!(
        report.outcome("FRS2504A"),
        Some(&MergeOutcome::Provisioned { rows: 3 })
    );
    assert_eq!(
        database.calls(),
        [
            "begin",
            "exists FRS2504A_UNEDITED_Form",
            "clone FRS2504A_UNEDITED_Form from FRS2504A_Form",
            "columns FRS2504A_Form",
            "execute",
            "commit",
        ]
    );
}

#[tokio::test]
async fn missing_edit_table_touches_nothing() {
    let database = RecordingDatabase::new(&["FRS2504A_Form"]);
    let orchestrator = orchestrator(&["FRS2504A"], Arc::clone(&database), FailurePolicy::Isolate);

    let report = orchestrator
        .run("FRS", SyncMode::Edit, &CancelToken::new())
        .await
        .expect("run");

    assert_eq!(
        report.outcome("FRS2504A"),
        Some(&MergeOutcome::SkippedMissingTarget)
    );
    assert_eq!(
        database.calls(),
        ["begin", "exists FRS2504A_EDIT_Form", "rollback"]
    );
}

#[tokio::test]
async fn failed_merge_rolls_back_and_run_continues() {
    let database = RecordingDatabase::new(&[
        "LMS2101A_Form",
        "LMS2101A_UNEDITED_Form",
        "FRS2504A_Form",
        "FRS2504A_UNEDITED_Form",
    ]);
    let orchestrator = orchestrator(
        &["LMS2101A", "FRS2504A"],
        Arc::clone(&database),
        FailurePolicy::Isolate,
    );

    let report = orchestrator
        .run("", SyncMode::Unedited, &CancelToken::new())
        .await
        .expect("run");

    let Some(MergeOutcome::Failed { reason }) = report.outcome("LMS2101A") else {
        panic!("expected failure, got {:?}", report.outcome("LMS2101A"));
    };
    assert_eq!(
        reason,
        "merge failed for 'LMS2101A': statement failed during execute: disk I/O error"
    );
    assert_eq!(report.outcome("FRS2504A"), Some(&MergeOutcome::Merged { rows: 3 }));
    let calls = database.calls();
    assert_eq!(calls.iter().filter(|call| *call == "dropped").count(), 1);
    assert_eq!(calls.iter().filter(|call| *call == "commit").count(), 1);
}

#[tokio::test]
async fn abort_policy_leaves_remaining_questionnaires_alone() {
    let database = RecordingDatabase::new(&["LMS2101A_Form", "LMS2101A_UNEDITED_Form"]);
    let orchestrator = orchestrator(
        &["LMS2101A", "LMS2102A"],
        Arc::clone(&database),
        FailurePolicy::Abort,
    );

    let report = orchestrator
        .run("LMS", SyncMode::Unedited, &CancelToken::new())
        .await
        .expect("run");

    assert_eq!(report.outcomes.len(), 1);
    assert!(!database.calls().iter().any(|call| call.contains("LMS2102A")));
}

#[tokio::test]
async fn directory_failure_fails_the_run() {
    let database = RecordingDatabase::new(&[]);
    let orchestrator = Orchestrator::new(
        config(FailurePolicy::Isolate),
        StaticDirectory::failing(),
        Arc::clone(&database) as Arc<dyn Database>,
    )
    .expect("orchestrator");

    let err = orchestrator
        .run("FRS", SyncMode::Unedited, &CancelToken::new())
        .await
        .expect_err("directory down");
    assert!(matches!(err, SyncError::Directory(_)));
    assert_eq!(err.status_code(), 500);
    assert_eq!(
        err.to_string(),
        "Error getting questionnaires for server park 'gusty': connection refused"
    );
    assert!(database.calls().is_empty());
}

#[tokio::test]
async fn crafted_questionnaire_names_fail_without_database_access() {
    let database = RecordingDatabase::new(&[]);
    let orchestrator = orchestrator(
        &["FRS\"; DROP TABLE x; --"],
        Arc::clone(&database),
        FailurePolicy::Isolate,
    );

    let report = orchestrator
        .run("FRS", SyncMode::Unedited, &CancelToken::new())
        .await
        .expect("run");

    assert_eq!(report.failed(), 1);
    assert!(database.calls().is_empty());
}

#[tokio::test]
async fn cancellation_rolls_back_the_questionnaire_in_flight() {
    let database =
        RecordingDatabase::stalling(&["FRS2504A_Form", "FRS2504A_UNEDITED_Form"], Stall::Merge);
    let orchestrator = orchestrator(
        &["FRS2504A", "FRS2505A"],
        Arc::clone(&database),
        FailurePolicy::Isolate,
    );
    let cancel = CancelToken::new();
    let _deadline = cancel.cancel_after(Duration::from_millis(50));

    let report = orchestrator
        .run("FRS", SyncMode::Unedited, &cancel)
        .await
        .expect("run");

    assert!(report.cancelled);
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(
        report.outcome("FRS2504A"),
        Some(&MergeOutcome::Failed {
            reason: "sync cancelled".to_string()
        })
    );
    let calls = database.calls();
    assert_eq!(calls.last().map(String::as_str), Some("dropped"));
    assert!(!calls.iter().any(|call| call == "commit"));

    let response = trigger(
        &orchestrator,
        &TriggerRequest::survey_type("FRS"),
        SyncMode::Unedited,
        &cancel,
    )
    .await;
    assert_eq!(response.status, 500);
}

#[tokio::test]
async fn cancellation_during_commit_reports_the_committed_work() {
    let database = RecordingDatabase::stalling(
        &["FRS2504A_Form", "FRS2504A_UNEDITED_Form", "FRS2505A_Form"],
        Stall::Commit,
    );
    let orchestrator = orchestrator(
        &["FRS2504A", "FRS2505A"],
        Arc::clone(&database),
        FailurePolicy::Isolate,
    );
    let cancel = CancelToken::new();
    let _deadline = cancel.cancel_after(Duration::from_millis(50));

    let report = orchestrator
        .run("FRS", SyncMode::Unedited, &cancel)
        .await
        .expect("run");

    assert!(report.cancelled);
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcome("FRS2504A"), Some(&MergeOutcome::Merged { rows: 3 }));
    let calls = database.calls();
    assert_eq!(calls.last().map(String::as_str), Some("commit"));
    assert!(!calls.iter().any(|call| call == "dropped"));
}
