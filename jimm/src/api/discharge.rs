//! Third-party caveat discharger.
//!
//! Backends present caveats of the form `is-<relation> <user> <object>`;
//! the verdict comes from the authorization engine and is bound into a
//! discharge macaroon with a declared fact and a bounded lifetime.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::JimmState;
use crate::bakery::{Macaroon, ThirdPartyCondition};
use crate::http::HttpError;

pub fn make_router<S>(state: JimmState) -> Router<S> {
    Router::new().route("/discharge", post(post_discharge)).with_state(state)
}

#[derive(Debug, Deserialize)]
pub(crate) struct DischargeRequest {
    /// Base64url-encoded caveat identifier.
    #[serde(default)]
    caveat64: Option<String>,
    /// Plain caveat identifier; `caveat64` wins when both are present.
    #[serde(default)]
    caveat: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct DischargeResponse {
    macaroon: Macaroon,
}

pub(crate) async fn post_discharge(
    State(state): State<JimmState>,
    Json(request): Json<DischargeRequest>,
) -> Result<Json<DischargeResponse>, HttpError> {
    let caveat_id = match (&request.caveat64, &request.caveat) {
        (Some(encoded), _) => {
            let decoded = URL_SAFE_NO_PAD
                .decode(encoded)
                .map_err(|_| HttpError::bad_request("caveat not recognized"))?;
            String::from_utf8(decoded).map_err(|_| HttpError::bad_request("caveat not recognized"))?
        }
        (None, Some(caveat)) => caveat.clone(),
        (None, None) => return Err(HttpError::bad_request("caveat not recognized")),
    };

    let condition: ThirdPartyCondition = caveat_id
        .parse()
        .map_err(|_| HttpError::bad_request("caveat not recognized"))?;

    let allowed = state
        .authorizer
        .check(&condition.user, condition.relation, &condition.object)
        .await
        .map_err(HttpError::from)?;

    if !allowed {
        info!(%condition, "Discharge refused");
        return Err(HttpError::forbidden("permission denied"));
    }

    info!(%condition, "Discharge granted");

    let macaroon = state.bakery.discharge(&caveat_id, &condition);

    Ok(Json(DischargeResponse { macaroon }))
}
