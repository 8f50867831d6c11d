use std::str::FromStr;

/// Language of the messages returned to the person submitting the form.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Language {
    #[default]
    Slovak,
    English,
}

impl FromStr for Language {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sk" => Ok(Language::Slovak),
            "en" => Ok(Language::English),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserMessage {
    Sent,
    Rejected,
    MissingFields,
    InvalidEmail,
    MessageTooShort,
    MessageTooLong,
    SendFailed,
    UnexpectedError,
    MethodNotAllowed,
    DiagnosticMode,
}

impl UserMessage {
    pub fn text(self, language: Language) -> &'static str {
        match language {
            Language::Slovak => self.slovak(),
            Language::English => self.english(),
        }
    }

    fn slovak(self) -> &'static str {
        match self {
            UserMessage::Sent => "Ďakujeme! Vaša správa bola odoslaná.",
            UserMessage::Rejected => "Vašu správu sa nepodarilo prijať.",
            UserMessage::MissingFields => "Prosím vyplňte všetky povinné polia",
            UserMessage::InvalidEmail => "Neplatná emailová adresa",
            UserMessage::MessageTooShort => "Správa je príliš krátka",
            UserMessage::MessageTooLong => "Správa je príliš dlhá",
            UserMessage::SendFailed => "Chyba pri odosielaní emailu. Skúste to prosím znova.",
            UserMessage::UnexpectedError => "Neočakávaná chyba servera. Skúste to prosím znova.",
            UserMessage::MethodNotAllowed => "Metóda nie je povolená",
            UserMessage::DiagnosticMode => "Testovací režim - konfigurácia načítaná",
        }
    }

    fn english(self) -> &'static str {
        match self {
            UserMessage::Sent => "Thank you! Your message has been sent.",
            UserMessage::Rejected => "Your message could not be accepted.",
            UserMessage::MissingFields => "Please fill in all required fields",
            UserMessage::InvalidEmail => "Invalid email address",
            UserMessage::MessageTooShort => "Message is too short",
            UserMessage::MessageTooLong => "Message is too long",
            UserMessage::SendFailed => "Error sending email. Please try again later.",
            UserMessage::UnexpectedError => "Unexpected server error. Please try again later.",
            UserMessage::MethodNotAllowed => "Method not allowed",
            UserMessage::DiagnosticMode => "Test mode - configuration loaded",
        }
    }
}
