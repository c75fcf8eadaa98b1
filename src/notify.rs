//! Update notifications to the downstream consumer.
//!
//! Successful builds and profile regenerations are announced with a signed
//! JSON POST. A rejected or unreachable endpoint downgrades the build to a
//! warning but never rolls back the artifact.

use std::time::Duration;

use serde::Serialize;
use tracing::info;
use url::Url;

use crate::signature;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(4);
const SIGNATURE_HEADER: &str = "X-Torigoya-Factory-Signature";

/// Errors raised while sending a notification.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// The configured target URL does not parse.
    #[error("invalid notification URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The request could not be sent.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The message body could not be serialized.
    #[error("failed to serialize notification: {0}")]
    Json(#[from] serde_json::Error),
    /// The signing key was unusable.
    #[error("invalid notification secret")]
    Signature(#[from] hmac::digest::InvalidLength),
    /// The endpoint answered non-200; carries the response body.
    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// Signed JSON POST client with a bounded timeout.
#[derive(Debug, Clone)]
pub struct Notifier {
    client: reqwest::Client,
    target_url: Url,
    secret: String,
}

impl Notifier {
    pub fn new(target_url: &str, secret: &str) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            target_url: Url::parse(target_url)?,
            secret: secret.to_owned(),
        })
    }

    /// POST `message` as JSON, signed under the configured secret.
    pub async fn post_update<T: Serialize>(&self, message: &T) -> Result<(), NotifyError> {
        info!("sending a notification to {}", self.target_url);

        let payload = serde_json::to_vec(message)?;
        let digest = signature::sign(&self.secret, &payload)?;

        let response = self
            .client
            .post(self.target_url.clone())
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, digest)
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status != reqwest::StatusCode::OK {
            return Err(NotifyError::Rejected(body));
        }

        info!("notification has been sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_url() {
        assert!(matches!(
            Notifier::new("not a url", "s"),
            Err(NotifyError::InvalidUrl(_))
        ));
    }

    #[test]
    fn accepts_http_url() {
        assert!(Notifier::new("http://localhost:9999/notify", "s").is_ok());
    }
}
