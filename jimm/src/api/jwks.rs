use axum::Json;
use axum::extract::State;
use axum::response::{IntoResponse as _, Response};
use time::OffsetDateTime;

use crate::JimmState;
use crate::http::HttpError;

/// Serves the public key set backends verify minted tokens against.
///
/// 404 while no key has been published yet; 500 for the pathological
/// key-without-expiry state the rotator will clean up on its next tick.
pub(crate) async fn get_jwks(State(state): State<JimmState>) -> Result<Response, HttpError> {
    let jwks_state = state.secrets.jwks_state().await.map_err(HttpError::from)?;

    let Some(set) = jwks_state.set else {
        return Err(HttpError::not_found("no published key set"));
    };

    let Some(expiry) = jwks_state.expiry else {
        return Err(HttpError::internal("published key set has no expiry"));
    };

    let now = OffsetDateTime::now_utc();
    let served = set.to_jwk_set(now);

    if served.keys.is_empty() {
        return Err(HttpError::not_found("no published key set"));
    }

    let max_age = (expiry - now).whole_seconds().max(0);

    let headers = [
        (
            axum::http::header::CACHE_CONTROL,
            format!("must-revalidate, max-age={max_age}, immutable"),
        ),
        (axum::http::header::EXPIRES, http_date(expiry)?),
    ];

    Ok((headers, Json(served)).into_response())
}

/// Pass-through to the configured OIDC issuer's discovery document.
pub(crate) async fn get_openid_configuration(
    State(state): State<JimmState>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let conf = state.conf_handle.get_conf();

    let oidc = conf
        .oidc
        .as_ref()
        .ok_or_else(|| HttpError::not_found("OIDC is not configured"))?;

    let url = format!(
        "{}/.well-known/openid-configuration",
        oidc.issuer.as_str().trim_end_matches('/'),
    );

    let document = reqwest::get(&url)
        .await
        .map_err(|e| HttpError::bad_gateway("issuer unreachable").with_source(e))?
        .error_for_status()
        .map_err(|e| HttpError::bad_gateway("issuer answered with an error").with_source(e))?
        .json::<serde_json::Value>()
        .await
        .map_err(|e| HttpError::bad_gateway("issuer answered malformed JSON").with_source(e))?;

    Ok(Json(document))
}

/// IMF-fixdate as required for the `Expires` header.
fn http_date(datetime: OffsetDateTime) -> Result<String, HttpError> {
    let format = time::macros::format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );

    datetime
        .to_offset(time::UtcOffset::UTC)
        .format(&format)
        .map_err(|e| HttpError::internal("unformattable expiry").with_source(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_header_is_imf_fixdate() {
        let datetime = time::macros::datetime!(2026-08-01 12:30:45 UTC);
        assert_eq!(http_date(datetime).expect("format"), "Sat, 01 Aug 2026 12:30:45 GMT");
    }
}
