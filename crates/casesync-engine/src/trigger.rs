//! Request validation and the `(message, status)` answer of a triggered run.

use casesync_db::CancelToken;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::orchestrator::{Orchestrator, SyncReport};
use crate::questionnaire::SyncMode;

const SELECTOR_FIELD: &str = "survey_type or questionnaire_name";

/// Body of a trigger call. One of the two fields must be set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRequest {
    #[serde(default)]
    pub survey_type: Option<String>,
    #[serde(default)]
    pub questionnaire_name: Option<String>,
}

impl TriggerRequest {
    pub fn survey_type(survey_type: impl Into<String>) -> Self {
        Self {
            survey_type: Some(survey_type.into()),
            questionnaire_name: None,
        }
    }

    /// The prefix to sync. A survey type wins over a questionnaire name.
    pub fn selector(&self) -> SyncResult<&str> {
        [&self.survey_type, &self.questionnaire_name]
            .into_iter()
            .flatten()
            .map(|value| value.trim())
            .find(|value| !value.is_empty())
            .ok_or_else(|| SyncError::Request {
                fields: vec![SELECTOR_FIELD.to_string()],
            })
    }
}

#[derive(Clone, Debug)]
pub struct TriggerResponse {
    pub message: String,
    pub status: u16,
    /// Present whenever the run got past discovery.
    pub report: Option<SyncReport>,
}

impl TriggerResponse {
    pub fn success(mode: SyncMode, report: SyncReport) -> Self {
        Self {
            message: format!("Successfully copied cases to {mode}"),
            status: 200,
            report: Some(report),
        }
    }

    pub fn from_error(mode: SyncMode, err: &SyncError, report: Option<SyncReport>) -> Self {
        Self {
            message: format!("Error copying cases to {mode}: {err}"),
            status: err.status_code(),
            report,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

/// Validates `request`, runs the sync and maps the result to a response.
pub async fn trigger(
    orchestrator: &Orchestrator,
    request: &TriggerRequest,
    mode: SyncMode,
    cancel: &CancelToken,
) -> TriggerResponse {
    let response = match request.selector() {
        Err(err) => TriggerResponse::from_error(mode, &err, None),
        Ok(prefix) => match orchestrator.run(prefix, mode, cancel).await {
            Err(err) => TriggerResponse::from_error(mode, &err, None),
            Ok(report) if report.cancelled => {
                TriggerResponse::from_error(mode, &SyncError::Cancelled, Some(report))
            }
            Ok(report) if report.failed() > 0 => {
                let failed = report.failed();
                let total = report.outcomes.len();
                TriggerResponse {
                    message: format!(
                        "Error copying cases to {mode}: {failed} of {total} questionnaires failed"
                    ),
                    status: 500,
                    report: Some(report),
                }
            }
            Ok(report) => TriggerResponse::success(mode, report),
        },
    };

    if response.is_success() {
        tracing::info!(mode = mode.as_str(), "{}", response.message);
    } else {
        tracing::error!(mode = mode.as_str(), status = response.status, "{}", response.message);
    }
    response
}
