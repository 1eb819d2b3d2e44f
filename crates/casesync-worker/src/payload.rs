use casesync_engine::TriggerResponse;
use casesync_engine::orchestrator::QuestionnaireOutcome;
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthResponse {
    pub ok: bool,
}

#[derive(Serialize)]
pub struct CopyCasesResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub outcomes: Vec<QuestionnaireOutcome>,
}

impl From<TriggerResponse> for CopyCasesResponse {
    fn from(response: TriggerResponse) -> Self {
        let (run_id, outcomes) = match response.report {
            Some(report) => (Some(report.run_id), report.outcomes),
            None => (None, Vec::new()),
        };
        Self {
            message: response.message,
            run_id,
            outcomes,
        }
    }
}
