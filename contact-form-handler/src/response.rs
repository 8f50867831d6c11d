use crate::{
    abuse_filter::RejectReason,
    messages::{Language, UserMessage},
    notification::DispatchError,
    validation::ValidationError,
};
use lambda_http::{
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE},
        HeaderValue, StatusCode,
    },
    Body, Response,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::error;

const FALLBACK_BODY: &str = r#"{"success":false,"message":"Internal server error"}"#;

/// The JSON envelope every response carries.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<Value>,
}

impl ApiResponse {
    pub fn success(message: UserMessage, language: Language) -> Self {
        Self {
            success: true,
            message: message.text(language).into(),
            debug: None,
        }
    }

    pub fn with_debug(self, debug: Value) -> Self {
        Self {
            debug: Some(debug),
            ..self
        }
    }

    pub fn into_response(self, status: StatusCode) -> Response<Body> {
        let body = serde_json::to_string(&self).unwrap_or_else(|error| {
            error!("Unable to serialise response: {error}");
            FALLBACK_BODY.into()
        });
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=UTF-8"),
        );
        headers.insert(
            CACHE_CONTROL,
            HeaderValue::from_static("no-cache, must-revalidate"),
        );
        response
    }
}

#[derive(Debug)]
pub enum ContactFormError {
    MethodNotAllowed {
        method: String,
        content_type: Option<String>,
    },
    AbuseRejected(RejectReason),
    ValidationFailed(ValidationError),
    DispatchFailed(DispatchError),
    UnexpectedFault(anyhow::Error),
}

impl ContactFormError {
    pub fn log(&self) {
        match self {
            ContactFormError::MethodNotAllowed { method, .. } => {
                error!("Rejected request with method {method}");
            }
            ContactFormError::AbuseRejected(reason) => {
                error!("Rejected submission as abuse: {reason}");
            }
            ContactFormError::ValidationFailed(error) => {
                error!("Client error in contact form submission: {error}");
            }
            ContactFormError::DispatchFailed(error) => {
                error!("Internal error sending contact form email: {error}");
            }
            ContactFormError::UnexpectedFault(error) => {
                error!("Unexpected error handling contact form submission: {error:#}");
            }
        }
    }

    fn user_message(&self) -> UserMessage {
        match self {
            ContactFormError::MethodNotAllowed { .. } => UserMessage::MethodNotAllowed,
            ContactFormError::AbuseRejected(_) => UserMessage::Rejected,
            ContactFormError::ValidationFailed(error) => error.user_message(),
            ContactFormError::DispatchFailed(_) => UserMessage::SendFailed,
            ContactFormError::UnexpectedFault(_) => UserMessage::UnexpectedError,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ContactFormError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            _ => StatusCode::OK,
        }
    }

    /// Details for operators. Abuse rejections carry none so that bots learn nothing from them.
    fn debug(&self) -> Option<Value> {
        match self {
            ContactFormError::MethodNotAllowed {
                method,
                content_type,
            } => Some(json!({
                "request_method": method,
                "expected_method": "POST",
                "content_type": content_type,
            })),
            ContactFormError::AbuseRejected(_) => None,
            ContactFormError::ValidationFailed(error) => Some(json!({ "error": error.to_string() })),
            ContactFormError::DispatchFailed(error) => Some(json!({ "error": error.to_string() })),
            ContactFormError::UnexpectedFault(error) => {
                Some(json!({ "error": format!("{error:#}") }))
            }
        }
    }

    pub fn into_response(self, language: Language, debug_mode: bool) -> Response<Body> {
        let status = self.status();
        ApiResponse {
            success: false,
            message: self.user_message().text(language).into(),
            debug: if debug_mode { self.debug() } else { None },
        }
        .into_response(status)
    }
}

impl From<ValidationError> for ContactFormError {
    fn from(error: ValidationError) -> Self {
        ContactFormError::ValidationFailed(error)
    }
}

impl From<DispatchError> for ContactFormError {
    fn from(error: DispatchError) -> Self {
        ContactFormError::DispatchFailed(error)
    }
}

impl std::fmt::Display for ContactFormError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContactFormError::MethodNotAllowed { method, .. } => {
                write!(f, "Method not allowed: {method}")
            }
            ContactFormError::AbuseRejected(reason) => write!(f, "Rejected as abuse: {reason}"),
            ContactFormError::ValidationFailed(error) => write!(f, "Client error: {error}"),
            ContactFormError::DispatchFailed(error) => write!(f, "Internal error: {error}"),
            ContactFormError::UnexpectedFault(error) => write!(f, "Unexpected error: {error:#}"),
        }
    }
}

impl std::error::Error for ContactFormError {}
