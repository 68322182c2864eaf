use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{FromRef, FromRequest, Request},
};
use bug_agent_core::{AppError, config::Config};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::events::Event;

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum SignatureError {
    #[error("No signature")]
    Missing,
    #[error("Invalid signature")]
    Mismatch,
}

/// Checks an `X-Hub-Signature-256` header value (`sha256=<hex>`) against the raw body.
pub fn verify_signature(
    secret: &[u8],
    signature: Option<&str>,
    body: &[u8],
) -> Result<(), SignatureError> {
    let signature = signature.ok_or(SignatureError::Missing)?;
    let digest = signature.strip_prefix("sha256=").ok_or(SignatureError::Mismatch)?;
    let digest = hex::decode(digest).map_err(|_| SignatureError::Mismatch)?;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(body);
    mac.verify_slice(&digest).map_err(|_| SignatureError::Mismatch)
}

/// Computes the `X-Hub-Signature-256` header value for `body`.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify and extract GitHub Event Payload.
#[derive(Debug, Clone)]
#[must_use]
pub struct GitHubEvent {
    pub event: Event,
}

impl<S> FromRequest<S> for GitHubEvent
where
    Arc<Config>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let config = <Arc<Config>>::from_ref(state);
        let signature = req
            .headers()
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let event = req
            .headers()
            .get("X-GitHub-Event")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|_| AppError::bad_request("Error reading body"))?;

        verify_signature(config.github.webhook_secret.as_bytes(), signature.as_deref(), &body)
            .map_err(|e| AppError::unauthorized(e.to_string()))?;
        let event = event.ok_or_else(|| AppError::bad_request("No event type"))?;
        let payload: serde_json::Value =
            serde_json::from_slice(&body).map_err(|_| AppError::bad_request("Invalid JSON"))?;
        let event =
            Event::parse(&event, &payload).map_err(|e| AppError::bad_request(e.to_string()))?;
        if config.github.app.is_some() && event.installation_id.is_none() {
            return Err(AppError::bad_request("No installation ID"));
        }
        Ok(GitHubEvent { event })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"It's a Secret to Everybody";
    const BODY: &[u8] = b"Hello, World!";

    #[test]
    fn accepts_github_reference_signature() {
        // Example from GitHub's webhook validation documentation.
        let signature = "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17";
        assert_eq!(sign(SECRET, BODY), signature);
        assert_eq!(verify_signature(SECRET, Some(signature), BODY), Ok(()));
    }

    #[test]
    fn rejects_bad_signatures() {
        let signature = sign(SECRET, BODY);
        let cases: &[(Option<&str>, SignatureError)] = &[
            (None, SignatureError::Missing),
            (Some(""), SignatureError::Mismatch),
            (Some(signature.trim_start_matches("sha256=")), SignatureError::Mismatch),
            (Some("sha256=not-hex"), SignatureError::Mismatch),
            (Some("sha256=00"), SignatureError::Mismatch),
        ];
        for &(header, expected) in cases {
            assert_eq!(verify_signature(SECRET, header, BODY), Err(expected), "{header:?}");
        }
        assert_eq!(
            verify_signature(b"wrong secret", Some(&signature), BODY),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn any_body_mutation_is_rejected() {
        let body = br#"{"action":"opened","number":1}"#;
        let signature = sign(SECRET, body);
        for i in 0..body.len() {
            let mut mutated = body.to_vec();
            mutated[i] ^= 0x01;
            assert_eq!(
                verify_signature(SECRET, Some(&signature), &mutated),
                Err(SignatureError::Mismatch),
                "byte {i}"
            );
        }
    }
}
