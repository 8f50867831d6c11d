mod abuse_filter;
mod config;
mod mailer;
mod messages;
mod notification;
mod payload;
mod recaptcha;
mod response;
mod secrets;
mod validation;

use abuse_filter::{AbuseFilter, AbuseVerdict};
use anyhow::Context;
use config::Config;
use lambda_http::{
    http::{
        header::{CONTENT_TYPE, HOST},
        Method, StatusCode,
    },
    run, service_fn, Body, Error, Request, RequestExt, Response,
};
use mailer::{build_mailer, Mailer};
use messages::{Language, UserMessage};
use notification::NotificationDispatcher;
use payload::parse_submission;
use response::{ApiResponse, ContactFormError};
use secrets::{AwsSecretsManagerSecretRepository, SecretRepository};
use tracing::{info, warn};
use validation::ContactFormMessage;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .without_time()
        .init();

    let config = Config::from_env()?;
    if config.diagnostic_mode {
        warn!("Diagnostic mode is enabled: GET ?test=1 returns a configuration summary");
    }
    let secrets_repository = AwsSecretsManagerSecretRepository::open().await;
    let mailer = build_mailer(&config.transport, secrets_repository.clone());
    let handler = ContactFormMessageHandler::new(config, secrets_repository, mailer)?;
    run(service_fn(|event| handler.handle(event))).await
}

struct ContactFormMessageHandler<SecretRepositoryT: SecretRepository> {
    config: Config,
    abuse_filter: AbuseFilter<SecretRepositoryT>,
    dispatcher: NotificationDispatcher,
}

impl<SecretRepositoryT: SecretRepository> ContactFormMessageHandler<SecretRepositoryT> {
    fn new(
        config: Config,
        secrets_repository: SecretRepositoryT,
        mailer: Box<dyn Mailer>,
    ) -> anyhow::Result<Self> {
        let abuse_filter = AbuseFilter::new(&config.abuse_filter, secrets_repository)
            .context("Unable to build reCAPTCHA client")?;
        let dispatcher = NotificationDispatcher::new(&config, mailer);
        Ok(Self {
            config,
            abuse_filter,
            dispatcher,
        })
    }

    async fn handle(&self, event: Request) -> Result<Response<Body>, Error> {
        if let Some(response) = self.diagnostic_response(&event) {
            return Ok(response);
        }
        if event.method() != Method::POST {
            return Ok(self.error_response(
                ContactFormError::MethodNotAllowed {
                    method: event.method().to_string(),
                    content_type: header_value(&event, CONTENT_TYPE.as_str()).map(Into::into),
                },
                self.config.default_language,
            ));
        }

        let message = match parse_submission(&event).await {
            Ok(message) => message,
            Err(error) => {
                return Ok(self.error_response(
                    ContactFormError::UnexpectedFault(anyhow::Error::new(error)),
                    self.config.default_language,
                ));
            }
        };
        let language = message.language().unwrap_or(self.config.default_language);

        match self
            .process_message(&message, client_ip(&event), header_value(&event, HOST.as_str()))
            .await
        {
            Ok(()) => {
                info!("Contact form message processed");
                Ok(ApiResponse::success(UserMessage::Sent, language).into_response(StatusCode::OK))
            }
            Err(error) => Ok(self.error_response(error, language)),
        }
    }

    async fn process_message(
        &self,
        message: &ContactFormMessage,
        client_ip: Option<&str>,
        host: Option<&str>,
    ) -> Result<(), ContactFormError> {
        if let AbuseVerdict::Reject(reason) =
            self.abuse_filter.evaluate(message, client_ip, host).await
        {
            return Err(ContactFormError::AbuseRejected(reason));
        }
        let validated_message = message.validate(&self.config.message_length)?;
        self.dispatcher.dispatch(&validated_message).await?;
        Ok(())
    }

    fn diagnostic_response(&self, event: &Request) -> Option<Response<Body>> {
        if !self.config.diagnostic_mode || event.method() != Method::GET {
            return None;
        }
        event
            .query_string_parameters_ref()
            .and_then(|parameters| parameters.first("test"))
            .filter(|value| *value == "1")?;
        info!("Serving configuration summary to diagnostic request");
        Some(
            ApiResponse::success(UserMessage::DiagnosticMode, self.config.default_language)
                .with_debug(self.config.summary())
                .into_response(StatusCode::OK),
        )
    }

    fn error_response(&self, error: ContactFormError, language: Language) -> Response<Body> {
        error.log();
        error.into_response(language, self.config.debug_mode)
    }
}

fn header_value<'a>(event: &'a Request, name: &str) -> Option<&'a str> {
    event
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// The originating client as reported by the first proxy in `X-Forwarded-For`.
fn client_ip(event: &Request) -> Option<&str> {
    header_value(event, X_FORWARDED_FOR)
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
