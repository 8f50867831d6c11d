use crate::{
    config::{FailPolicy, RecaptchaSettings},
    secrets::{SecretRepository, RECAPTCHA_SECRET_NAME},
};
use async_once_cell::OnceCell;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Client for the reCAPTCHA v3 `siteverify` endpoint.
///
/// The secret key is fetched from the secret repository on first use. If that fails, the next
/// request tries again.
pub struct RecaptchaVerifier<SecretRepositoryT: SecretRepository> {
    settings: RecaptchaSettings,
    secrets_repository: SecretRepositoryT,
    recaptcha_secret: OnceCell<RecaptchaSecret>,
    client: Client,
}

impl<SecretRepositoryT: SecretRepository> RecaptchaVerifier<SecretRepositoryT> {
    pub fn new(
        settings: RecaptchaSettings,
        secrets_repository: SecretRepositoryT,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(settings.timeout).build()?;
        Ok(Self {
            settings,
            secrets_repository,
            recaptcha_secret: Default::default(),
            client,
        })
    }

    pub fn fail_policy(&self) -> FailPolicy {
        self.settings.fail_policy
    }

    pub async fn verify_token(
        &self,
        token: &str,
        client_ip: Option<&str>,
        expected_hostname: Option<&str>,
    ) -> Result<(), RecaptchaError> {
        let payload = self.build_payload(token, client_ip).await?;
        let response = self.send_token(payload).await?;
        self.process_response(response, expected_hostname).await
    }

    async fn build_payload<'a>(
        &'a self,
        token: &'a str,
        client_ip: Option<&'a str>,
    ) -> Result<RecaptchaVerifyPayload<'a>, RecaptchaError> {
        let recaptcha_secret = match self
            .recaptcha_secret
            .get_or_try_init(self.secrets_repository.get_secret(RECAPTCHA_SECRET_NAME))
            .await
        {
            Ok(recaptcha_secret) => recaptcha_secret,
            Err(error) => {
                return Err(RecaptchaError::Unavailable(format!(
                    "could not retrieve {RECAPTCHA_SECRET_NAME}: {error}"
                )));
            }
        };

        Ok(RecaptchaVerifyPayload {
            secret: &recaptcha_secret.secret_key,
            response: token,
            remoteip: client_ip,
        })
    }

    async fn send_token<'a>(
        &self,
        payload: RecaptchaVerifyPayload<'a>,
    ) -> Result<Response, RecaptchaError> {
        match self
            .client
            .post(self.settings.verify_url.as_str())
            .form(&payload)
            .send()
            .await
        {
            Ok(response) => Ok(response),
            Err(error) if error.is_timeout() => Err(RecaptchaError::Unavailable(format!(
                "no answer within {:?}",
                self.settings.timeout
            ))),
            Err(error) => Err(RecaptchaError::Unavailable(format!(
                "could not connect: {error}"
            ))),
        }
    }

    async fn process_response(
        &self,
        response: Response,
        expected_hostname: Option<&str>,
    ) -> Result<(), RecaptchaError> {
        let status = response.status();
        if !status.is_success() {
            return Err(RecaptchaError::Unavailable(format!(
                "verification endpoint answered {status}"
            )));
        }
        let response_body: RecaptchaResponse = match response.json().await {
            Ok(body) => body,
            Err(error) => {
                return Err(RecaptchaError::Unavailable(format!(
                    "unreadable verification response: {error}"
                )));
            }
        };

        if !response_body.success {
            return Err(RecaptchaError::TokenInvalid(response_body.error_codes));
        }
        if response_body.action.as_deref() != Some(self.settings.expected_action.as_str()) {
            return Err(RecaptchaError::ActionMismatch {
                expected: self.settings.expected_action.clone(),
                actual: response_body.action,
            });
        }
        match response_body.score {
            Some(score) if score >= self.settings.score_threshold => {}
            score => {
                return Err(RecaptchaError::ScoreTooLow {
                    score,
                    threshold: self.settings.score_threshold,
                })
            }
        }

        // Subdomains and proxies make this unreliable, so it is only reported.
        if let (Some(reported), Some(expected)) = (
            response_body.hostname.as_deref(),
            expected_hostname.map(strip_port),
        ) {
            if reported != expected {
                warn!("reCAPTCHA hostname mismatch: expected {expected}, got {reported}");
            }
        }
        Ok(())
    }
}

fn strip_port(host: &str) -> &str {
    host.rsplit_once(':')
        .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
        .map(|(host, _)| host)
        .unwrap_or(host)
}

#[derive(Deserialize)]
struct RecaptchaSecret {
    #[serde(rename = "RECAPTCHA_SECRET_KEY")]
    secret_key: String,
}

#[derive(Serialize)]
struct RecaptchaVerifyPayload<'a> {
    secret: &'a str,
    response: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    remoteip: Option<&'a str>,
}

#[derive(Deserialize)]
struct RecaptchaResponse {
    success: bool,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

#[derive(Debug, PartialEq)]
pub enum RecaptchaError {
    /// The service could not be asked or gave no usable answer.
    Unavailable(String),
    TokenInvalid(Vec<String>),
    ActionMismatch {
        expected: String,
        actual: Option<String>,
    },
    ScoreTooLow {
        score: Option<f64>,
        threshold: f64,
    },
}

impl std::fmt::Display for RecaptchaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecaptchaError::Unavailable(cause) => {
                write!(f, "reCAPTCHA verification unavailable: {cause}")
            }
            RecaptchaError::TokenInvalid(errors) => {
                write!(f, "reCAPTCHA token invalid: {errors:?}")
            }
            RecaptchaError::ActionMismatch { expected, actual } => write!(
                f,
                "reCAPTCHA action mismatch: expected {expected}, got {}",
                actual.as_deref().unwrap_or("none")
            ),
            RecaptchaError::ScoreTooLow { score, threshold } => match score {
                Some(score) => write!(f, "reCAPTCHA score too low: {score} (threshold {threshold})"),
                None => write!(f, "reCAPTCHA score missing (threshold {threshold})"),
            },
        }
    }
}

impl std::error::Error for RecaptchaError {}

#[cfg(test)]
mod tests {
    use super::{strip_port, RecaptchaError, RecaptchaVerifier};
    use crate::{
        config::RecaptchaSettings,
        secrets::{
            test_support::{FakeSecretRepository, FAKE_RECAPTCHA_SECRET},
            SecretRepository,
        },
    };
    use googletest::prelude::*;
    use test_support::fake_recaptcha::FakeRecaptcha;

    async fn verifier(verify_url: String) -> RecaptchaVerifier<FakeSecretRepository> {
        RecaptchaVerifier::new(
            RecaptchaSettings {
                verify_url,
                ..Default::default()
            },
            FakeSecretRepository::open().await,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn accepts_token_with_sufficient_score() -> Result<()> {
        let fake_recaptcha = FakeRecaptcha::new(FAKE_RECAPTCHA_SECRET).with_score(0.9);
        let subject = verifier(fake_recaptcha.start().await).await;

        let result = subject
            .verify_token("token", Some("203.0.113.7"), Some("example.com"))
            .await;

        verify_that!(result, ok(eq(())))
    }

    #[tokio::test]
    async fn forwards_secret_token_and_client_ip() -> Result<()> {
        let fake_recaptcha = FakeRecaptcha::new(FAKE_RECAPTCHA_SECRET);
        let subject = verifier(fake_recaptcha.start().await).await;

        subject
            .verify_token("a token", Some("203.0.113.7"), None)
            .await
            .unwrap();

        verify_that!(
            fake_recaptcha.last_request(),
            some(eq(("a token".to_string(), Some("203.0.113.7".to_string()))))
        )
    }

    #[tokio::test]
    async fn reports_wrong_secret_as_invalid_token() -> Result<()> {
        let fake_recaptcha = FakeRecaptcha::new("a different secret");
        let subject = verifier(fake_recaptcha.start().await).await;

        let result = subject.verify_token("token", None, None).await;

        verify_that!(result, err(matches_pattern!(RecaptchaError::TokenInvalid(anything()))))
    }

    #[tokio::test]
    async fn reports_missing_score_as_too_low() -> Result<()> {
        let fake_recaptcha = FakeRecaptcha::new(FAKE_RECAPTCHA_SECRET).without_score();
        let subject = verifier(fake_recaptcha.start().await).await;

        let result = subject.verify_token("token", None, None).await;

        verify_that!(
            result,
            err(eq(RecaptchaError::ScoreTooLow {
                score: None,
                threshold: 0.5
            }))
        )
    }

    #[tokio::test]
    async fn reports_unparseable_response_as_unavailable() -> Result<()> {
        let fake_recaptcha = FakeRecaptcha::new(FAKE_RECAPTCHA_SECRET).return_invalid_response();
        let subject = verifier(fake_recaptcha.start().await).await;

        let result = subject.verify_token("token", None, None).await;

        verify_that!(result, err(matches_pattern!(RecaptchaError::Unavailable(anything()))))
    }

    #[tokio::test]
    async fn ignores_hostname_mismatch() -> Result<()> {
        let fake_recaptcha =
            FakeRecaptcha::new(FAKE_RECAPTCHA_SECRET).with_hostname("elsewhere.example");
        let subject = verifier(fake_recaptcha.start().await).await;

        let result = subject
            .verify_token("token", None, Some("example.com:443"))
            .await;

        verify_that!(result, ok(eq(())))
    }

    #[tokio::test]
    async fn reports_missing_secret_as_unavailable() -> Result<()> {
        let fake_recaptcha = FakeRecaptcha::new(FAKE_RECAPTCHA_SECRET);
        let verify_url = fake_recaptcha.start().await;
        let mut secrets = FakeSecretRepository::open().await;
        secrets.remove_secret(crate::secrets::RECAPTCHA_SECRET_NAME);
        let subject = RecaptchaVerifier::new(
            RecaptchaSettings {
                verify_url,
                ..Default::default()
            },
            secrets,
        )
        .unwrap();

        let result = subject.verify_token("token", None, None).await;

        verify_that!(result, err(matches_pattern!(RecaptchaError::Unavailable(anything()))))
    }

    #[test]
    fn strips_port_from_host_header() -> Result<()> {
        verify_that!(strip_port("example.com:8443"), eq("example.com"))?;
        verify_that!(strip_port("example.com"), eq("example.com"))
    }
}
