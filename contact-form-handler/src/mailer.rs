use crate::{
    config::{MailTransport, SmtpEncryption, SmtpRelaySettings},
    secrets::{SecretRepository, SMTP_CREDENTIALS_NAME},
};
use async_once_cell::OnceCell;
use async_trait::async_trait;
use lettre::{
    transport::smtp::authentication::{Credentials, Mechanism},
    AsyncSendmailTransport, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::timeout;
use tracing::info;

/// Capability to deliver a fully built message.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: Message) -> Result<(), MailerError>;
}

/// Builds the transport selected by the configuration.
pub fn build_mailer<SecretRepositoryT>(
    transport: &MailTransport,
    secrets_repository: SecretRepositoryT,
) -> Box<dyn Mailer>
where
    SecretRepositoryT: SecretRepository + Send + Sync + 'static,
{
    match transport {
        MailTransport::Smtp(settings) => Box::new(SmtpRelayMailer::new(
            settings.clone(),
            secrets_repository,
        )),
        MailTransport::Sendmail { command, timeout } => {
            Box::new(SendmailMailer::new(command.as_deref(), *timeout))
        }
    }
}

/// Sends through an SMTP relay. The connection pool is set up on first use; if that fails (for
/// example because the credentials could not be fetched), the next message tries again.
pub struct SmtpRelayMailer<SecretRepositoryT: SecretRepository> {
    settings: SmtpRelaySettings,
    secrets_repository: SecretRepositoryT,
    transport: OnceCell<AsyncSmtpTransport<Tokio1Executor>>,
}

impl<SecretRepositoryT: SecretRepository> SmtpRelayMailer<SecretRepositoryT> {
    pub fn new(settings: SmtpRelaySettings, secrets_repository: SecretRepositoryT) -> Self {
        Self {
            settings,
            secrets_repository,
            transport: Default::default(),
        }
    }

    async fn initialise_transport(
        &self,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, lambda_http::Error> {
        let SmtpRelaySettings {
            host,
            port,
            encryption,
            timeout,
        } = &self.settings;
        info!(
            "initialise_transport: Connecting to {host}:{port} ({})",
            encryption.as_str()
        );
        let mut builder = match encryption {
            SmtpEncryption::Ssl => AsyncSmtpTransport::<Tokio1Executor>::relay(host)?,
            SmtpEncryption::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?,
            SmtpEncryption::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host),
        }
        .port(*port)
        .timeout(Some(*timeout));

        // Sending credentials over a non-TLS connection is risky, so we only set the credentials
        // when the connection is encrypted. If the environment is misconfigured so that the
        // credentials are not sent, the relay will reject the message.
        if *encryption != SmtpEncryption::None {
            let parsed_credentials: SmtpCredentials = self
                .secrets_repository
                .get_secret(SMTP_CREDENTIALS_NAME)
                .await?;
            builder = builder
                .authentication(vec![Mechanism::Plain, Mechanism::Login])
                .credentials(Credentials::new(
                    parsed_credentials.username,
                    parsed_credentials.password,
                ));
        }

        Ok(builder.build())
    }
}

#[async_trait]
impl<SecretRepositoryT> Mailer for SmtpRelayMailer<SecretRepositoryT>
where
    SecretRepositoryT: SecretRepository + Send + Sync,
{
    async fn send(&self, message: Message) -> Result<(), MailerError> {
        let transport = self
            .transport
            .get_or_try_init(self.initialise_transport())
            .await
            .map_err(|error| MailerError::Connection(error.to_string()))?;
        match timeout(self.settings.timeout, transport.send(message)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(error)) => Err(MailerError::Transport(error.to_string())),
            Err(_) => Err(MailerError::Timeout(self.settings.timeout)),
        }
    }
}

/// Hands messages to the local `sendmail` binary.
pub struct SendmailMailer {
    transport: AsyncSendmailTransport<Tokio1Executor>,
    timeout: Duration,
}

impl SendmailMailer {
    pub fn new(command: Option<&str>, timeout: Duration) -> Self {
        let transport = match command {
            Some(command) => AsyncSendmailTransport::<Tokio1Executor>::new_with_command(command),
            None => AsyncSendmailTransport::<Tokio1Executor>::new(),
        };
        Self { transport, timeout }
    }
}

#[async_trait]
impl Mailer for SendmailMailer {
    async fn send(&self, message: Message) -> Result<(), MailerError> {
        match timeout(self.timeout, self.transport.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(MailerError::Transport(error.to_string())),
            Err(_) => Err(MailerError::Timeout(self.timeout)),
        }
    }
}

#[derive(Deserialize)]
struct SmtpCredentials {
    #[serde(rename = "SMTP_USERNAME")]
    username: String,
    #[serde(rename = "SMTP_PASSWORD")]
    password: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MailerError {
    Connection(String),
    Transport(String),
    Timeout(Duration),
}

impl std::fmt::Display for MailerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MailerError::Connection(error) => write!(f, "Unable to connect to mail server: {error}"),
            MailerError::Transport(error) => write!(f, "Error sending message: {error}"),
            MailerError::Timeout(timeout) => {
                write!(f, "Mail server did not answer within {timeout:?}")
            }
        }
    }
}

impl std::error::Error for MailerError {}


#[cfg(test)]
mod tests {
    use super::{Mailer, MailerError, SendmailMailer, SmtpRelayMailer};
    use crate::{
        config::{SmtpEncryption, SmtpRelaySettings},
        secrets::{test_support::FakeSecretRepository, SecretRepository, SMTP_CREDENTIALS_NAME},
    };
    use googletest::prelude::*;
    use lettre::{message::header::ContentType, Message};
    use serial_test::serial;
    use std::{sync::OnceLock, time::Duration};
    use test_support::fake_smtp::{
        start_poisoned_smtp_server, FakeSmtpServer, ReceivedMail, POISONED_SMTP_PORT, SMTP_PORT,
    };
    use tokio::time::timeout;

    fn arbitrary_message() -> Message {
        Message::builder()
            .from("Web contact form <noreply@example.com>".parse().unwrap())
            .to("info@example.com".parse().unwrap())
            .subject("Relay test")
            .header(ContentType::TEXT_HTML)
            .body("<p>Relay test body</p>".to_string())
            .unwrap()
    }

    fn plain_relay(port: u16) -> SmtpRelaySettings {
        SmtpRelaySettings {
            host: "127.0.0.1".into(),
            port,
            encryption: SmtpEncryption::None,
            timeout: Duration::from_secs(2),
        }
    }

    #[googletest::test]
    #[tokio::test]
    #[serial]
    async fn delivers_message_through_relay() {
        fake_smtp().start();
        fake_smtp().flush().await;
        let subject =
            SmtpRelayMailer::new(plain_relay(SMTP_PORT), FakeSecretRepository::open().await);

        let result = subject.send(arbitrary_message()).await;

        expect_that!(result, ok(eq(())));
        expect_that!(
            timeout(Duration::from_secs(1), fake_smtp().next_mail()).await,
            ok(ok(matches_pattern!(ReceivedMail {
                recipients: elements_are![contains_substring("info@example.com")],
                content: all!(
                    contains_substring("Subject: Relay test"),
                    contains_substring("Relay test body")
                )
            })))
        );
    }

    #[tokio::test]
    #[serial]
    async fn reports_relay_refusing_message() -> Result<()> {
        start_poisoned_smtp_server();
        let subject = SmtpRelayMailer::new(
            plain_relay(POISONED_SMTP_PORT),
            FakeSecretRepository::open().await,
        );

        let result = subject.send(arbitrary_message()).await;

        verify_that!(result, err(matches_pattern!(MailerError::Transport(anything()))))
    }

    #[tokio::test]
    async fn reports_unreachable_relay() -> Result<()> {
        let subject = SmtpRelayMailer::new(plain_relay(9), FakeSecretRepository::open().await);

        let result = subject.send(arbitrary_message()).await;

        verify_that!(result, err(anything()))
    }

    #[tokio::test]
    async fn reports_missing_credentials_for_encrypted_relay() -> Result<()> {
        let mut secrets = FakeSecretRepository::open().await;
        secrets.remove_secret(SMTP_CREDENTIALS_NAME);
        let subject = SmtpRelayMailer::new(
            SmtpRelaySettings {
                encryption: SmtpEncryption::Ssl,
                ..plain_relay(465)
            },
            secrets,
        );

        let result = subject.send(arbitrary_message()).await;

        verify_that!(result, err(matches_pattern!(MailerError::Connection(anything()))))
    }

    #[tokio::test]
    async fn reports_missing_sendmail_binary() -> Result<()> {
        let subject = SendmailMailer::new(
            Some("/nonexistent/path/to/sendmail"),
            Duration::from_secs(2),
        );

        let result = subject.send(arbitrary_message()).await;

        verify_that!(result, err(matches_pattern!(MailerError::Transport(anything()))))
    }

    #[cfg(unix)]
    #[googletest::test]
    #[tokio::test]
    async fn delivers_message_through_sendmail_command() {
        use std::os::unix::fs::PermissionsExt;

        let directory = std::env::temp_dir();
        let output_path = directory.join(format!("sendmail-output-{}.eml", std::process::id()));
        let command_path = directory.join(format!("sendmail-{}.sh", std::process::id()));
        std::fs::write(
            &command_path,
            format!("#!/bin/sh\ncat > \"{}\"\n", output_path.display()),
        )
        .unwrap();
        std::fs::set_permissions(&command_path, std::fs::Permissions::from_mode(0o755)).unwrap();
        let subject = SendmailMailer::new(command_path.to_str(), Duration::from_secs(2));

        let result = subject.send(arbitrary_message()).await;

        expect_that!(result, ok(eq(())));
        expect_that!(
            std::fs::read_to_string(&output_path),
            ok(all!(
                contains_substring("Subject: Relay test"),
                contains_substring("Relay test body")
            ))
        );
        let _ = std::fs::remove_file(command_path);
        let _ = std::fs::remove_file(output_path);
    }

    fn fake_smtp() -> &'static FakeSmtpServer {
        static FAKE_SMTP: OnceLock<FakeSmtpServer> = OnceLock::new();
        FAKE_SMTP.get_or_init(FakeSmtpServer::new)
    }
}
