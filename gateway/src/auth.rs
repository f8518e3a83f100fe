//! Bearer-token checks for the public surface (`accessTokens` allow-list)
//! and the admin surface (`adminToken`).

use axum::http::HeaderMap;

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Whether the request satisfies client auth: if `require_auth` is false,
/// or no tokens are configured, every request passes. Otherwise the
/// `Authorization: Bearer <t>` header must carry a `t` in the allow-list.
#[must_use]
pub fn client_authorized(headers: &HeaderMap, require_auth: bool, access_tokens: &[String]) -> bool {
    if !require_auth || access_tokens.is_empty() {
        return true;
    }
    bearer_token(headers).is_some_and(|token| access_tokens.iter().any(|t| t == token))
}

/// Whether the request satisfies admin auth: if no admin token is
/// configured, the admin surface is open; otherwise the bearer token must
/// match exactly.
#[must_use]
pub fn admin_authorized(headers: &HeaderMap, admin_token: Option<&str>) -> bool {
    match admin_token {
        None => true,
        Some(expected) => bearer_token(headers) == Some(expected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn client_auth_passes_when_not_required() {
        assert!(client_authorized(&HeaderMap::new(), false, &["secret".to_string()]));
    }

    #[test]
    fn client_auth_passes_when_no_tokens_configured() {
        assert!(client_authorized(&HeaderMap::new(), true, &[]));
    }

    #[test]
    fn client_auth_rejects_missing_or_wrong_token() {
        let tokens = vec!["secret".to_string()];
        assert!(!client_authorized(&HeaderMap::new(), true, &tokens));
        assert!(!client_authorized(&headers_with_bearer("wrong"), true, &tokens));
    }

    #[test]
    fn client_auth_accepts_matching_token() {
        let tokens = vec!["secret".to_string()];
        assert!(client_authorized(&headers_with_bearer("secret"), true, &tokens));
    }

    #[test]
    fn admin_auth_open_when_unconfigured() {
        assert!(admin_authorized(&HeaderMap::new(), None));
    }

    #[test]
    fn admin_auth_requires_exact_match() {
        assert!(admin_authorized(&headers_with_bearer("adm"), Some("adm")));
        assert!(!admin_authorized(&headers_with_bearer("adm"), Some("other")));
        assert!(!admin_authorized(&HeaderMap::new(), Some("adm")));
    }
}
