use crate::validation::ContactFormMessage;
use bytes::Bytes;
use futures_util::stream;
use lambda_http::{http::header::CONTENT_TYPE, Request, RequestPayloadExt};
use multer::Multipart;
use serde_json::{Map, Value};
use std::convert::Infallible;

const MULTIPART_FORM_DATA: &str = "multipart/form-data";

/// Reads the submission from the request body. Browsers posting `FormData` send
/// `multipart/form-data`; `application/x-www-form-urlencoded` and JSON bodies are accepted as well.
pub async fn parse_submission(event: &Request) -> Result<ContactFormMessage, PayloadError> {
    let content_type = event
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let Some(content_type) = content_type else {
        return Err(PayloadError::UnsupportedContentType(None));
    };

    if is_multipart(content_type) {
        let boundary = multer::parse_boundary(content_type)
            .map_err(|error| PayloadError::Malformed(error.to_string()))?;
        return parse_multipart(Bytes::copy_from_slice(event.body().as_ref()), boundary).await;
    }

    match event.payload::<ContactFormMessage>() {
        Ok(Some(message)) => Ok(message),
        Ok(None) => Err(PayloadError::UnsupportedContentType(Some(
            content_type.into(),
        ))),
        Err(error) => Err(PayloadError::Malformed(error.to_string())),
    }
}

fn is_multipart(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case(MULTIPART_FORM_DATA))
}

/// Collects the text fields of a multipart body. When a field repeats, the last value wins.
async fn parse_multipart(
    body: Bytes,
    boundary: String,
) -> Result<ContactFormMessage, PayloadError> {
    let mut multipart = Multipart::new(
        stream::once(async move { Ok::<_, Infallible>(body) }),
        boundary,
    );
    let mut fields = Map::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| PayloadError::Malformed(error.to_string()))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        if field.file_name().is_some() {
            continue;
        }
        let value = field
            .text()
            .await
            .map_err(|error| PayloadError::Malformed(error.to_string()))?;
        fields.insert(name, Value::String(value));
    }
    serde_json::from_value(Value::Object(fields))
        .map_err(|error| PayloadError::Malformed(error.to_string()))
}

#[derive(Debug, PartialEq)]
pub enum PayloadError {
    UnsupportedContentType(Option<String>),
    Malformed(String),
}

impl std::fmt::Display for PayloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadError::UnsupportedContentType(Some(content_type)) => {
                write!(f, "Unsupported content type {content_type}")
            }
            PayloadError::UnsupportedContentType(None) => write!(f, "Missing content type"),
            PayloadError::Malformed(error) => write!(f, "Unable to parse request payload: {error}"),
        }
    }
}

impl std::error::Error for PayloadError {}
