//! Caller identity.
//!
//! Authentication happens upstream; by the time a request reaches this
//! service the identity provider has placed a stable user id in a trusted
//! header. [`Caller`] extracts it and rejects requests without one.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, header};
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

use super::AppState;
use super::error::CallableError;

pub const MAX_UID_LEN: usize = 128;

/// Resolves the authenticated user id of a request, if any.
pub trait IdentityProvider: Send + Sync {
    fn identify(&self, headers: &HeaderMap) -> Option<String>;
}

/// Reads the user id from a header set by the fronting auth proxy.
pub struct HeaderIdentity {
    header: HeaderName,
}

impl HeaderIdentity {
    pub fn new(header: HeaderName) -> Self {
        Self { header }
    }
}

impl IdentityProvider for HeaderIdentity {
    fn identify(&self, headers: &HeaderMap) -> Option<String> {
        let uid = headers.get(&self.header)?.to_str().ok()?.trim();
        is_valid_uid(uid).then(|| uid.to_string())
    }
}

fn is_valid_uid(uid: &str) -> bool {
    !uid.is_empty() && uid.len() <= MAX_UID_LEN && !uid.chars().any(char::is_control)
}

/// The authenticated caller of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub uid: String,
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = CallableError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        state
            .identity
            .identify(&parts.headers)
            .map(|uid| Caller { uid })
            .ok_or(CallableError::Unauthenticated)
    }
}

/// Check an `Authorization: Bearer <token>` header against the admin token.
/// Without a configured token every admin request is refused.
pub fn check_admin(headers: &HeaderMap, admin_token: Option<&SecretString>) -> Result<(), CallableError> {
    let Some(expected) = admin_token else {
        return Err(CallableError::PermissionDenied(
            "Admin operations are disabled".to_string(),
        ));
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(CallableError::Unauthenticated)?;
    let matches: bool = presented
        .as_bytes()
        .ct_eq(expected.expose_secret().as_bytes())
        .into();
    if !matches {
        return Err(CallableError::PermissionDenied("Invalid admin token".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn header_identity_reads_trimmed_uid() {
        let identity = HeaderIdentity::new(HeaderName::from_static("x-lumi-uid"));
        assert_eq!(
            identity.identify(&headers(&[("x-lumi-uid", " u1 ")])),
            Some("u1".to_string())
        );
        assert_eq!(identity.identify(&headers(&[("x-lumi-uid", "  ")])), None);
        assert_eq!(identity.identify(&headers(&[("x-other", "u1")])), None);
        assert_eq!(
            identity.identify(&headers(&[("x-lumi-uid", &"u".repeat(MAX_UID_LEN + 1))])),
            None
        );
    }

    #[test]
    fn admin_token_is_required_and_compared() {
        let token = SecretString::from("s3cret".to_string());
        assert!(check_admin(&headers(&[]), None).is_err());
        assert!(matches!(
            check_admin(&headers(&[]), Some(&token)),
            Err(CallableError::Unauthenticated)
        ));
        assert!(matches!(
            check_admin(&headers(&[("authorization", "Bearer nope")]), Some(&token)),
            Err(CallableError::PermissionDenied(_))
        ));
        assert!(check_admin(&headers(&[("authorization", "Bearer s3cret")]), Some(&token)).is_ok());
    }

    #[test]
    fn near_miss_admin_tokens_are_refused() {
        let token = SecretString::from("s3cret".to_string());
        for presented in ["Bearer s3creT", "Bearer s3cre", "Bearer s3cret!"] {
            assert!(
                matches!(
                    check_admin(&headers(&[("authorization", presented)]), Some(&token)),
                    Err(CallableError::PermissionDenied(_))
                ),
                "{presented:?} should be refused"
            );
        }
        assert!(matches!(
            check_admin(&headers(&[("authorization", "s3cret")]), Some(&token)),
            Err(CallableError::Unauthenticated)
        ));
    }
}
