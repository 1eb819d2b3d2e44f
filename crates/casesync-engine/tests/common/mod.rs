#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use casesync_engine::config::BlaiseConfig;
use casesync_engine::{
    DatabaseConfig, DirectoryError, FailurePolicy, MergeColumns, Questionnaire,
    QuestionnaireDirectory, SyncConfig,
};

/// Directory returning a fixed list, or a fixed failure.
pub struct StaticDirectory {
    names: Vec<String>,
    fail: bool,
    pub calls: Mutex<Vec<String>>,
}

impl StaticDirectory {
    pub fn new(names: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            names: names.iter().map(|name| name.to_string()).collect(),
            fail: false,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            names: Vec::new(),
            fail: true,
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl QuestionnaireDirectory for StaticDirectory {
    async fn list_questionnaires(
        &self,
        server_park: &str,
    ) -> Result<Vec<Questionnaire>, DirectoryError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(server_park.to_string());
        if self.fail {
            return Err(DirectoryError::new(server_park, "connection refused"));
        }
        Ok(self
            .names
            .iter()
            .enumerate()
            .map(|(idx, name)| Questionnaire::new(name.clone(), idx.to_string()))
            .collect())
    }
}

pub fn config(policy: FailurePolicy) -> SyncConfig {
    SyncConfig {
        blaise: BlaiseConfig {
            api_url: "http://localhost:5000".to_string(),
            server_park: "gusty".to_string(),
        },
        database: DatabaseConfig::Sqlite {
            path: PathBuf::from("unused.db"),
            pool_size: 1,
        },
        failure_policy: policy,
        run_timeout: None,
        columns: MergeColumns::default(),
    }
}
