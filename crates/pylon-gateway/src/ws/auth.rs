use axum::http::{header, HeaderMap};
use pylon_core::{PylonConfig, PylonError, Result};

/// Verify the sender pre-shared token against server config.
///
/// The token is taken from `Authorization: Bearer …` or, for callers that
/// cannot set headers, a `?token=` query parameter. Failure aborts the
/// handshake outright — no session is ever created.
pub fn verify_sender(
    headers: &HeaderMap,
    token_param: Option<&str>,
    config: &PylonConfig,
) -> Result<()> {
    let Some(expected) = config.gateway.backend_auth_token.as_deref() else {
        return Err(PylonError::AuthFailed(
            "sender role is not configured".to_string(),
        ));
    };

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or(token_param);

    match presented {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(PylonError::AuthFailed("invalid sender token".to_string())),
        None => Err(PylonError::AuthFailed("missing sender token".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_token(token: Option<&str>) -> PylonConfig {
        let mut config = PylonConfig::default();
        config.gateway.backend_auth_token = token.map(String::from);
        config
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        headers
    }

    #[test]
    fn bearer_header_accepted() {
        let config = config_with_token(Some("tok"));
        assert!(verify_sender(&bearer("tok"), None, &config).is_ok());
    }

    #[test]
    fn query_token_accepted_as_fallback() {
        let config = config_with_token(Some("tok"));
        assert!(verify_sender(&HeaderMap::new(), Some("tok"), &config).is_ok());
    }

    #[test]
    fn wrong_or_missing_token_rejected() {
        let config = config_with_token(Some("tok"));
        assert!(verify_sender(&bearer("nope"), None, &config).is_err());
        assert!(verify_sender(&HeaderMap::new(), None, &config).is_err());
    }

    #[test]
    fn unconfigured_token_rejects_everything() {
        let config = config_with_token(None);
        assert!(verify_sender(&bearer("anything"), None, &config).is_err());
    }
}
