use crate::{
    config::Config,
    mailer::{Mailer, MailerError},
    messages::Language,
    validation::{decode_entities, ValidatedContactFormMessage},
};
use lettre::{
    message::{header::ContentType, Mailbox},
    Message,
};
use serde::Serialize;
use serde_json::Value;
use tinytemplate::{error::Error, format_unescaped, TinyTemplate};
use tracing::info;

const NOTIFICATION_TEMPLATE_NAME: &str = "notification-template";
const NOTIFICATION_TEMPLATE: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/assets/notification.html"
));

#[derive(Serialize)]
struct Context<'a> {
    heading: &'a str,
    labels: Labels,
    name: &'a str,
    email: &'a str,
    message: &'a str,
}

#[derive(Serialize)]
struct Labels {
    name: &'static str,
    email: &'static str,
    message: &'static str,
}

impl Labels {
    fn for_language(language: Language) -> Self {
        match language {
            Language::Slovak => Self {
                name: "Meno:",
                email: "E-mail:",
                message: "Správa:",
            },
            Language::English => Self {
                name: "Name:",
                email: "E-mail:",
                message: "Message:",
            },
        }
    }
}

/// Renders the notification for the site owner. Name and message must already be HTML-escaped;
/// they are inserted as they are. The email address is escaped by the template.
pub fn render_notification(
    heading: &str,
    message: &ValidatedContactFormMessage,
    language: Language,
) -> Result<String, Error> {
    let mut tt = TinyTemplate::new();
    tt.add_formatter("nl2br", nl2br);
    tt.add_template(NOTIFICATION_TEMPLATE_NAME, NOTIFICATION_TEMPLATE)?;
    let email = message.email.to_string();
    let context = Context {
        heading,
        labels: Labels::for_language(language),
        name: &message.name,
        email: &email,
        message: &message.message,
    };
    tt.render(NOTIFICATION_TEMPLATE_NAME, &context)
}

fn nl2br(value: &Value, output: &mut String) -> Result<(), Error> {
    let mut formatted = String::new();
    format_unescaped(value, &mut formatted)?;
    output.push_str(&formatted.replace("\r\n", "\n").replace('\n', "<br />\n"));
    Ok(())
}

/// Turns validated submissions into notification emails for the fixed recipient.
pub struct NotificationDispatcher {
    sender: Mailbox,
    recipient: Mailbox,
    subject_prefix: String,
    language: Language,
    mailer: Box<dyn Mailer>,
}

impl NotificationDispatcher {
    pub fn new(config: &Config, mailer: Box<dyn Mailer>) -> Self {
        Self {
            sender: config.sender.clone(),
            recipient: config.recipient.clone(),
            subject_prefix: config.subject_prefix.clone(),
            language: config.default_language,
            mailer,
        }
    }

    pub async fn dispatch(
        &self,
        message: &ValidatedContactFormMessage,
    ) -> Result<(), DispatchError> {
        let email = self.build_email(message)?;
        self.mailer.send(email).await.map_err(DispatchError::Send)?;
        info!("Sent notification for message from {}", message.email);
        Ok(())
    }

    fn build_email(&self, message: &ValidatedContactFormMessage) -> Result<Message, DispatchError> {
        let body = render_notification(&self.subject_prefix, message, self.language)
            .map_err(|error| DispatchError::Render(error.to_string()))?;
        Message::builder()
            .from(self.sender.clone())
            .reply_to(Mailbox::new(None, message.email.clone()))
            .to(self.recipient.clone())
            .subject(self.subject(message))
            .header(ContentType::TEXT_HTML)
            .body(body)
            .map_err(|error| DispatchError::Build(error.to_string()))
    }

    fn subject(&self, message: &ValidatedContactFormMessage) -> String {
        let name: String = decode_entities(&message.name)
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .collect();
        format!("{} - {name}", self.subject_prefix)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    Render(String),
    Build(String),
    Send(MailerError),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Render(error) => write!(f, "Error rendering notification: {error}"),
            DispatchError::Build(error) => write!(f, "Error building message: {error}"),
            DispatchError::Send(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for DispatchError {}
