use crate::{
    config::MessageLengthLimits,
    messages::{Language, UserMessage},
};
use lettre::Address;
use serde::Deserialize;

const ESCAPED_ENTITIES: [&str; 5] = ["amp;", "lt;", "gt;", "quot;", "#039;"];
const EMAIL_SPECIAL_CHARACTERS: &str = "!#$%&'*+-=?^_`{|}~@.[]";

/// A form submission as posted by the browser. Every field is optional on the wire; which ones are
/// actually required is decided by the abuse filter and [`ContactFormMessage::validate`].
#[derive(Deserialize, Debug, Default)]
pub struct ContactFormMessage {
    #[serde(alias = "fname")]
    pub name: Option<String>,
    pub email: Option<String>,
    pub message: Option<String>,
    #[serde(rename = "website")]
    pub honeypot: Option<String>,
    pub form_timestamp: Option<FormTimestamp>,
    #[serde(rename = "g-recaptcha-response")]
    pub recaptcha_token: Option<String>,
    pub language: Option<String>,
}

/// Milliseconds since the epoch at which the form was rendered. Form-encoded bodies carry it as
/// text, JSON bodies usually as a number.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum FormTimestamp {
    Millis(i64),
    Text(String),
}

impl FormTimestamp {
    pub fn millis(&self) -> Option<i64> {
        match self {
            FormTimestamp::Millis(millis) => Some(*millis),
            FormTimestamp::Text(text) => text.trim().parse().ok(),
        }
    }
}

impl ContactFormMessage {
    pub fn language(&self) -> Option<Language> {
        self.language.as_deref().and_then(|l| l.parse().ok())
    }

    pub fn validate(
        &self,
        limits: &MessageLengthLimits,
    ) -> Result<ValidatedContactFormMessage, ValidationError> {
        let name = sanitize_text(self.name.as_deref().unwrap_or_default());
        let email = sanitize_email(self.email.as_deref().unwrap_or_default());
        let raw_message = self.message.as_deref().unwrap_or_default().trim();
        let message = sanitize_text(raw_message);

        if name.is_empty() || email.is_empty() || message.is_empty() {
            return Err(ValidationError::MissingFields);
        }
        let Ok(email) = email.parse::<Address>() else {
            return Err(ValidationError::InvalidEmail(email));
        };
        let length = raw_message.chars().count();
        if length < limits.min_chars {
            return Err(ValidationError::MessageTooShort(length));
        }
        if length > limits.max_chars {
            return Err(ValidationError::MessageTooLong(length));
        }

        Ok(ValidatedContactFormMessage {
            name,
            email,
            message,
        })
    }
}

/// A submission whose name and message are trimmed and HTML-escaped and whose email address is
/// well formed.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedContactFormMessage {
    pub name: String,
    pub email: Address,
    pub message: String,
}

/// Trims the value and escapes HTML markup. Entities produced by an earlier pass are left alone,
/// so sanitizing twice gives the same result as sanitizing once.
pub fn sanitize_text(input: &str) -> String {
    let trimmed = input.trim();
    let mut output = String::with_capacity(trimmed.len());
    for (index, c) in trimmed.char_indices() {
        match c {
            '&' if starts_with_entity(&trimmed[index + 1..]) => output.push('&'),
            '&' => output.push_str("&amp;"),
            '<' => output.push_str("&lt;"),
            '>' => output.push_str("&gt;"),
            '"' => output.push_str("&quot;"),
            '\'' => output.push_str("&#039;"),
            c => output.push(c),
        }
    }
    output
}

/// Reverses [`sanitize_text`] for contexts that are not HTML, such as a mail subject.
pub fn decode_entities(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(index) = rest.find('&') {
        output.push_str(&rest[..index]);
        rest = &rest[index + 1..];
        let decoded = [
            ("amp;", '&'),
            ("lt;", '<'),
            ("gt;", '>'),
            ("quot;", '"'),
            ("#039;", '\''),
        ]
        .into_iter()
        .find(|(entity, _)| rest.starts_with(entity));
        match decoded {
            Some((entity, c)) => {
                output.push(c);
                rest = &rest[entity.len()..];
            }
            None => output.push('&'),
        }
    }
    output.push_str(rest);
    output
}

fn starts_with_entity(rest: &str) -> bool {
    ESCAPED_ENTITIES
        .iter()
        .any(|entity| rest.starts_with(entity))
}

/// Drops every character that cannot appear in an unquoted email address.
pub fn sanitize_email(input: &str) -> String {
    input
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || EMAIL_SPECIAL_CHARACTERS.contains(*c))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    MissingFields,
    InvalidEmail(String),
    MessageTooShort(usize),
    MessageTooLong(usize),
}

impl ValidationError {
    pub fn user_message(&self) -> UserMessage {
        match self {
            ValidationError::MissingFields => UserMessage::MissingFields,
            ValidationError::InvalidEmail(_) => UserMessage::InvalidEmail,
            ValidationError::MessageTooShort(_) => UserMessage::MessageTooShort,
            ValidationError::MessageTooLong(_) => UserMessage::MessageTooLong,
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::MissingFields => write!(f, "Missing fields in request"),
            ValidationError::InvalidEmail(email) => write!(f, "Invalid email address {email}"),
            ValidationError::MessageTooShort(length) => {
                write!(f, "Message too short ({length} characters)")
            }
            ValidationError::MessageTooLong(length) => {
                write!(f, "Message too long ({length} characters)")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    const MALICIOUS_CONTENT: &str = "<script>doEvil();</script>";

    fn message(name: &str, email: &str, body: &str) -> ContactFormMessage {
        ContactFormMessage {
            name: Some(name.into()),
            email: Some(email.into()),
            message: Some(body.into()),
            ..Default::default()
        }
    }

    #[test]
    fn escapes_markup_in_name_and_message() -> Result<()> {
        let validated = message(MALICIOUS_CONTENT, "jana@example.com", MALICIOUS_CONTENT)
            .validate(&MessageLengthLimits::default())
            .unwrap();

        verify_that!(
            validated,
            matches_pattern!(ValidatedContactFormMessage {
                name: eq("&lt;script&gt;doEvil();&lt;/script&gt;"),
                message: eq("&lt;script&gt;doEvil();&lt;/script&gt;")
            })
        )
    }

    #[test]
    fn escapes_quotes() -> Result<()> {
        verify_that!(
            sanitize_text(r#"Tom "O'Neil""#),
            eq("Tom &quot;O&#039;Neil&quot;")
        )
    }

    #[test]
    fn trims_whitespace() -> Result<()> {
        verify_that!(sanitize_text("  Jana \n"), eq("Jana"))
    }

    #[test]
    fn sanitizing_is_idempotent() -> Result<()> {
        for input in [
            MALICIOUS_CONTENT,
            "Fish & chips",
            "Already &amp; escaped &lt;b&gt;",
            " & ",
            "&&amp;;",
            "'\"<>&#039;",
            "Potrebujem termín",
        ] {
            let once = sanitize_text(input);
            verify_that!(sanitize_text(&once), eq(once.as_str()))?;
        }
        Ok(())
    }

    #[test]
    fn sanitized_text_has_no_raw_markup() -> Result<()> {
        let sanitized = sanitize_text("a < b && c > d");

        verify_that!(sanitized, eq("a &lt; b &amp;&amp; c &gt; d"))
    }

    #[test]
    fn decodes_what_sanitizing_escaped() -> Result<()> {
        verify_that!(
            decode_entities(&sanitize_text("Tom & \"Jerry\" <o'neil> &lt;")),
            eq("Tom & \"Jerry\" <o'neil> <")
        )
    }

    #[test]
    fn decodes_each_entity_once() -> Result<()> {
        verify_that!(decode_entities("&amp;lt; & &unknown;"), eq("&lt; & &unknown;"))
    }

    #[test]
    fn strips_invalid_characters_from_email() -> Result<()> {
        verify_that!(
            sanitize_email(" ja na(comment)@exa\u{e1}mple.com "),
            eq("janacomment@example.com")
        )
    }

    #[test]
    fn rejects_missing_fields() -> Result<()> {
        let result = ContactFormMessage {
            name: Some("Jana".into()),
            email: Some("jana@example.com".into()),
            message: None,
            ..Default::default()
        }
        .validate(&MessageLengthLimits::default());

        verify_that!(result, err(eq(ValidationError::MissingFields)))
    }

    #[test]
    fn rejects_whitespace_only_name() -> Result<()> {
        let result = message("   ", "jana@example.com", "Hello there")
            .validate(&MessageLengthLimits::default());

        verify_that!(result, err(eq(ValidationError::MissingFields)))
    }

    #[test]
    fn rejects_malformed_email() -> Result<()> {
        let result = message("Jana", "jana.example.com", "Hello there")
            .validate(&MessageLengthLimits::default());

        verify_that!(
            result,
            err(eq(ValidationError::InvalidEmail("jana.example.com".into())))
        )
    }

    #[test]
    fn parses_valid_email() -> Result<()> {
        let validated = message("Jana", " jana@example.com ", "Hello there")
            .validate(&MessageLengthLimits::default())
            .unwrap();

        verify_that!(validated.email.to_string(), eq("jana@example.com"))
    }

    #[test]
    fn rejects_message_below_minimum() -> Result<()> {
        let result =
            message("Jana", "jana@example.com", "abc").validate(&MessageLengthLimits::default());

        verify_that!(result, err(eq(ValidationError::MessageTooShort(3))))
    }

    #[test]
    fn rejects_message_above_maximum() -> Result<()> {
        let limits = MessageLengthLimits {
            min_chars: 5,
            max_chars: 10,
        };

        let result = message("Jana", "jana@example.com", "abcdefghijk").validate(&limits);

        verify_that!(result, err(eq(ValidationError::MessageTooLong(11))))
    }

    #[test]
    fn accepts_message_at_both_bounds() -> Result<()> {
        let limits = MessageLengthLimits {
            min_chars: 5,
            max_chars: 10,
        };

        verify_that!(
            message("Jana", "jana@example.com", "abcde").validate(&limits),
            ok(anything())
        )?;
        verify_that!(
            message("Jana", "jana@example.com", "abcdefghij").validate(&limits),
            ok(anything())
        )
    }

    #[test]
    fn counts_characters_rather_than_bytes() -> Result<()> {
        let limits = MessageLengthLimits {
            min_chars: 5,
            max_chars: 5,
        };

        verify_that!(
            message("Jana", "jana@example.com", "žšťčň").validate(&limits),
            ok(anything())
        )
    }

    #[test]
    fn reads_timestamp_from_text_or_number() -> Result<()> {
        verify_that!(FormTimestamp::Millis(1_700_000_000_000).millis(), some(eq(1_700_000_000_000)))?;
        verify_that!(
            FormTimestamp::Text(" 1700000000000 ".into()).millis(),
            some(eq(1_700_000_000_000))
        )?;
        verify_that!(FormTimestamp::Text("yesterday".into()).millis(), none())
    }

    #[test]
    fn accepts_fname_as_name() -> Result<()> {
        let message: ContactFormMessage =
            serde_json::from_str(r#"{"fname": "Jana", "form_timestamp": 17}"#).unwrap();

        verify_that!(message.name, some(eq("Jana")))?;
        verify_that!(message.form_timestamp, some(eq(FormTimestamp::Millis(17))))
    }
}
