use axum::Json;
use axum::extract::State;

use crate::JimmState;
use crate::http::HttpError;

#[derive(Debug, serde::Serialize)]
pub(crate) struct Status {
    start_time: String,
    version: &'static str,
    sessions: usize,
}

/// Liveness endpoint.
pub(crate) async fn get_status(State(state): State<JimmState>) -> Result<Json<Status>, HttpError> {
    let sessions = state
        .sessions
        .get_session_count()
        .await
        .map_err(|e| HttpError::internal("session registry is gone").with_source(format!("{e:#}")))?;

    Ok(Json(Status {
        start_time: state
            .start_time
            .format(&time::format_description::well_known::Rfc3339)
            .map_err(|e| HttpError::internal("unformattable start time").with_source(e))?,
        version: env!("CARGO_PKG_VERSION"),
        sessions,
    }))
}
