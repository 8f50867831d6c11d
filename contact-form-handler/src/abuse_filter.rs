use crate::{
    config::{AbuseFilterConfig, FailPolicy},
    recaptcha::{RecaptchaError, RecaptchaVerifier},
    secrets::SecretRepository,
    validation::ContactFormMessage,
};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbuseVerdict {
    Allow,
    Reject(RejectReason),
}

/// Why a submission was taken for a bot. Never shown to the submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Honeypot,
    MissingTimestamp,
    TooFast,
    Stale,
    MissingToken,
    TokenInvalid,
    ActionMismatch,
    ScoreTooLow,
    VerificationUnavailable,
}

impl RejectReason {
    pub fn tag(self) -> &'static str {
        match self {
            RejectReason::Honeypot => "honeypot",
            RejectReason::MissingTimestamp => "missing_timestamp",
            RejectReason::TooFast => "too_fast",
            RejectReason::Stale => "stale",
            RejectReason::MissingToken => "missing_token",
            RejectReason::TokenInvalid => "token_invalid",
            RejectReason::ActionMismatch => "action_mismatch",
            RejectReason::ScoreTooLow => "score_too_low",
            RejectReason::VerificationUnavailable => "verification_unavailable",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Honeypot, timing window and (optionally) risk-score checks, run in that order. The first
/// failing check decides the verdict.
pub struct AbuseFilter<SecretRepositoryT: SecretRepository> {
    min_elapsed_seconds: f64,
    max_elapsed_seconds: f64,
    recaptcha_verifier: Option<RecaptchaVerifier<SecretRepositoryT>>,
}

impl<SecretRepositoryT: SecretRepository> AbuseFilter<SecretRepositoryT> {
    pub fn new(
        config: &AbuseFilterConfig,
        secrets_repository: SecretRepositoryT,
    ) -> Result<Self, reqwest::Error> {
        let recaptcha_verifier = config
            .recaptcha
            .clone()
            .map(|settings| RecaptchaVerifier::new(settings, secrets_repository))
            .transpose()?;
        Ok(Self {
            min_elapsed_seconds: config.min_elapsed_seconds,
            max_elapsed_seconds: config.max_elapsed_seconds,
            recaptcha_verifier,
        })
    }

    pub async fn evaluate(
        &self,
        message: &ContactFormMessage,
        client_ip: Option<&str>,
        host: Option<&str>,
    ) -> AbuseVerdict {
        self.evaluate_at(message, client_ip, host, SystemTime::now())
            .await
    }

    pub async fn evaluate_at(
        &self,
        message: &ContactFormMessage,
        client_ip: Option<&str>,
        host: Option<&str>,
        now: SystemTime,
    ) -> AbuseVerdict {
        let checks = async {
            Self::check_honeypot(message)?;
            self.check_timing(message, now)?;
            self.check_risk_score(message, client_ip, host).await
        };
        match checks.await {
            Ok(()) => AbuseVerdict::Allow,
            Err(reason) => AbuseVerdict::Reject(reason),
        }
    }

    fn check_honeypot(message: &ContactFormMessage) -> Result<(), RejectReason> {
        match message.honeypot.as_deref() {
            Some(value) if !value.is_empty() => Err(RejectReason::Honeypot),
            _ => Ok(()),
        }
    }

    fn check_timing(
        &self,
        message: &ContactFormMessage,
        now: SystemTime,
    ) -> Result<(), RejectReason> {
        let Some(form_millis) = message.form_timestamp.as_ref().and_then(|t| t.millis()) else {
            return Err(RejectReason::MissingTimestamp);
        };
        let now_millis = now
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis() as i64)
            .unwrap_or_default();
        let elapsed_seconds = now_millis.saturating_sub(form_millis) as f64 / 1000.0;
        if elapsed_seconds < self.min_elapsed_seconds {
            Err(RejectReason::TooFast)
        } else if elapsed_seconds > self.max_elapsed_seconds {
            Err(RejectReason::Stale)
        } else {
            Ok(())
        }
    }

    async fn check_risk_score(
        &self,
        message: &ContactFormMessage,
        client_ip: Option<&str>,
        host: Option<&str>,
    ) -> Result<(), RejectReason> {
        let Some(verifier) = self.recaptcha_verifier.as_ref() else {
            return Ok(());
        };
        let token = match message.recaptcha_token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => token,
            _ => return Err(RejectReason::MissingToken),
        };
        let Err(error) = verifier.verify_token(token, client_ip, host).await else {
            return Ok(());
        };
        warn!("{error}");
        match error {
            RecaptchaError::Unavailable(_) if verifier.fail_policy() == FailPolicy::Open => {
                warn!("Letting request pass without verification.");
                Ok(())
            }
            RecaptchaError::Unavailable(_) => Err(RejectReason::VerificationUnavailable),
            RecaptchaError::TokenInvalid(_) => Err(RejectReason::TokenInvalid),
            RecaptchaError::ActionMismatch { .. } => Err(RejectReason::ActionMismatch),
            RecaptchaError::ScoreTooLow { .. } => Err(RejectReason::ScoreTooLow),
        }
    }
}
