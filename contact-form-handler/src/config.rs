use crate::messages::Language;
use lettre::message::Mailbox;
use serde_json::{json, Value};
use std::{fmt::Display, str::FromStr, time::Duration};

pub const RECAPTCHA_VERIFY_URL: &str = "https://www.google.com/recaptcha/api/siteverify";
const DEFAULT_SUBJECT_PREFIX: &str = "New message from the contact form";
const DEFAULT_EXPECTED_ACTION: &str = "chat_submit";
const DEFAULT_TIMEOUT_SECONDS: u64 = 10;

/// Everything the handler needs to know about its deployment, read once at start-up.
///
/// Secrets (the risk-verification key and SMTP credentials) are not part of this struct; they are
/// fetched through a [`crate::secrets::SecretRepository`].
#[derive(Clone, Debug)]
pub struct Config {
    pub sender: Mailbox,
    pub recipient: Mailbox,
    pub subject_prefix: String,
    pub transport: MailTransport,
    pub abuse_filter: AbuseFilterConfig,
    pub message_length: MessageLengthLimits,
    pub default_language: Language,
    pub debug_mode: bool,
    pub diagnostic_mode: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum MailTransport {
    Smtp(SmtpRelaySettings),
    Sendmail {
        command: Option<String>,
        timeout: Duration,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct SmtpRelaySettings {
    pub host: String,
    pub port: u16,
    pub encryption: SmtpEncryption,
    pub timeout: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmtpEncryption {
    /// TLS from the first byte, usually port 465.
    Ssl,
    StartTls,
    None,
}

impl SmtpEncryption {
    fn default_port(self) -> u16 {
        match self {
            SmtpEncryption::Ssl => 465,
            SmtpEncryption::StartTls => 587,
            SmtpEncryption::None => 25,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SmtpEncryption::Ssl => "ssl",
            SmtpEncryption::StartTls => "starttls",
            SmtpEncryption::None => "none",
        }
    }
}

impl FromStr for SmtpEncryption {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ssl" | "tls" | "smtps" => Ok(SmtpEncryption::Ssl),
            "starttls" => Ok(SmtpEncryption::StartTls),
            "none" | "plain" => Ok(SmtpEncryption::None),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AbuseFilterConfig {
    pub min_elapsed_seconds: f64,
    pub max_elapsed_seconds: f64,
    pub recaptcha: Option<RecaptchaSettings>,
}

impl Default for AbuseFilterConfig {
    fn default() -> Self {
        Self {
            min_elapsed_seconds: 2.0,
            max_elapsed_seconds: 3600.0,
            recaptcha: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecaptchaSettings {
    pub verify_url: String,
    pub expected_action: String,
    pub score_threshold: f64,
    pub timeout: Duration,
    pub fail_policy: FailPolicy,
}

impl Default for RecaptchaSettings {
    fn default() -> Self {
        Self {
            verify_url: RECAPTCHA_VERIFY_URL.into(),
            expected_action: DEFAULT_EXPECTED_ACTION.into(),
            score_threshold: 0.5,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
            fail_policy: FailPolicy::Closed,
        }
    }
}

/// What to do when the verification service cannot give an answer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailPolicy {
    #[default]
    Closed,
    Open,
}

/// Inclusive bounds on the message length, counted in characters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageLengthLimits {
    pub min_chars: usize,
    pub max_chars: usize,
}

impl Default for MessageLengthLimits {
    fn default() -> Self {
        Self {
            min_chars: 5,
            max_chars: 2000,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Lookup(lookup);

        let transport = match env
            .optional("MAIL_TRANSPORT")
            .unwrap_or_else(|| "smtp".into())
            .to_ascii_lowercase()
            .as_str()
        {
            "smtp" => {
                let encryption = env.parsed("SMTP_ENCRYPTION", SmtpEncryption::Ssl)?;
                MailTransport::Smtp(SmtpRelaySettings {
                    host: env.required("SMTP_HOST")?,
                    port: env.parsed("SMTP_PORT", encryption.default_port())?,
                    encryption,
                    timeout: env.seconds("MAIL_TIMEOUT_SECONDS")?,
                })
            }
            "sendmail" => MailTransport::Sendmail {
                command: env.optional("SENDMAIL_COMMAND"),
                timeout: env.seconds("MAIL_TIMEOUT_SECONDS")?,
            },
            other => {
                return Err(ConfigError::Invalid {
                    key: "MAIL_TRANSPORT",
                    value: other.into(),
                })
            }
        };

        let defaults = AbuseFilterConfig::default();
        let min_elapsed_seconds = env.parsed("FORM_MIN_SECONDS", defaults.min_elapsed_seconds)?;
        let max_elapsed_seconds = env.parsed("FORM_MAX_SECONDS", defaults.max_elapsed_seconds)?;
        if !(0.0..=max_elapsed_seconds).contains(&min_elapsed_seconds) {
            return Err(ConfigError::Invalid {
                key: "FORM_MIN_SECONDS",
                value: min_elapsed_seconds.to_string(),
            });
        }

        let recaptcha = if env.flag("RECAPTCHA_ENABLED", false)? {
            let defaults = RecaptchaSettings::default();
            let score_threshold =
                env.parsed("RECAPTCHA_SCORE_THRESHOLD", defaults.score_threshold)?;
            if !(0.0..=1.0).contains(&score_threshold) {
                return Err(ConfigError::Invalid {
                    key: "RECAPTCHA_SCORE_THRESHOLD",
                    value: score_threshold.to_string(),
                });
            }
            Some(RecaptchaSettings {
                verify_url: env
                    .optional("RECAPTCHA_VERIFY_URL")
                    .unwrap_or(defaults.verify_url),
                expected_action: env
                    .optional("RECAPTCHA_EXPECTED_ACTION")
                    .unwrap_or(defaults.expected_action),
                score_threshold,
                timeout: env.seconds("RECAPTCHA_TIMEOUT_SECONDS")?,
                fail_policy: if env.flag("RECAPTCHA_FAIL_OPEN", false)? {
                    FailPolicy::Open
                } else {
                    FailPolicy::Closed
                },
            })
        } else {
            None
        };

        let length_defaults = MessageLengthLimits::default();
        let message_length = MessageLengthLimits {
            min_chars: env.parsed("MESSAGE_MIN_CHARS", length_defaults.min_chars)?,
            max_chars: env.parsed("MESSAGE_MAX_CHARS", length_defaults.max_chars)?,
        };
        if message_length.min_chars > message_length.max_chars {
            return Err(ConfigError::Invalid {
                key: "MESSAGE_MIN_CHARS",
                value: message_length.min_chars.to_string(),
            });
        }

        Ok(Self {
            sender: env.mailbox("MAIL_FROM")?,
            recipient: env.mailbox("MAIL_TO")?,
            subject_prefix: env
                .optional("MAIL_SUBJECT_PREFIX")
                .unwrap_or_else(|| DEFAULT_SUBJECT_PREFIX.into()),
            transport,
            abuse_filter: AbuseFilterConfig {
                min_elapsed_seconds,
                max_elapsed_seconds,
                recaptcha,
            },
            message_length,
            default_language: env.parsed("DEFAULT_LANGUAGE", Language::default())?,
            debug_mode: env.flag("DEBUG_MODE", false)?,
            diagnostic_mode: env.flag("DIAGNOSTIC_MODE", false)?,
        })
    }

    /// Non-secret view of the configuration, returned by the diagnostic endpoint.
    pub fn summary(&self) -> Value {
        let transport = match &self.transport {
            MailTransport::Smtp(settings) => json!({
                "mode": "smtp",
                "host": settings.host,
                "port": settings.port,
                "encryption": settings.encryption.as_str(),
            }),
            MailTransport::Sendmail { command, .. } => json!({
                "mode": "sendmail",
                "command": command,
            }),
        };
        json!({
            "transport": transport,
            "to_email": self.recipient.email.to_string(),
            "from_email": self.sender.email.to_string(),
            "form_window_seconds": [
                self.abuse_filter.min_elapsed_seconds,
                self.abuse_filter.max_elapsed_seconds,
            ],
            "message_length": [self.message_length.min_chars, self.message_length.max_chars],
            "recaptcha_enabled": self.abuse_filter.recaptcha.is_some(),
        })
    }
}

struct Lookup<F>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.optional(key).ok_or(ConfigError::Missing(key))
    }

    fn parsed<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.optional(key) {
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value }),
            None => Ok(default),
        }
    }

    fn seconds(&self, key: &'static str) -> Result<Duration, ConfigError> {
        let seconds = self.parsed(key, DEFAULT_TIMEOUT_SECONDS)?;
        if seconds == 0 {
            return Err(ConfigError::Invalid {
                key,
                value: "0".into(),
            });
        }
        Ok(Duration::from_secs(seconds))
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.optional(key) {
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid { key, value }),
            },
            None => Ok(default),
        }
    }

    fn mailbox(&self, key: &'static str) -> Result<Mailbox, ConfigError> {
        let value = self.required(key)?;
        value
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value })
    }
}

#[derive(Debug, PartialEq)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid { key: &'static str, value: String },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "Missing configuration value {key}"),
            ConfigError::Invalid { key, value } => {
                write!(f, "Invalid configuration value {key}={value}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
