use axum::{
    extract::{Form, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::{
    borrow::Cow,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{net::TcpListener, time::sleep};

const VERIFY_PATH: &str = "/siteverify";

/// Stand-in for the reCAPTCHA `siteverify` endpoint. Answers every request with the configured
/// verdict as long as the expected secret is sent.
#[derive(Clone)]
pub struct FakeRecaptcha {
    required_secret: Cow<'static, str>,
    score: Option<f64>,
    action: Cow<'static, str>,
    hostname: Cow<'static, str>,
    reject_token: bool,
    return_invalid_response: bool,
    delay: Option<Duration>,
    last_request: Arc<Mutex<Option<(String, Option<String>)>>>,
}

#[derive(Deserialize)]
struct VerifyRequestPayload {
    secret: String,
    response: String,
    remoteip: Option<String>,
}

impl FakeRecaptcha {
    pub fn new(required_secret: impl Into<Cow<'static, str>>) -> Self {
        Self {
            required_secret: required_secret.into(),
            score: Some(0.9),
            action: "chat_submit".into(),
            hostname: "example.com".into(),
            reject_token: false,
            return_invalid_response: false,
            delay: None,
            last_request: Default::default(),
        }
    }

    pub fn with_score(self, score: f64) -> Self {
        Self {
            score: Some(score),
            ..self
        }
    }

    pub fn without_score(self) -> Self {
        Self {
            score: None,
            ..self
        }
    }

    pub fn with_action(self, action: impl Into<Cow<'static, str>>) -> Self {
        Self {
            action: action.into(),
            ..self
        }
    }

    pub fn with_hostname(self, hostname: impl Into<Cow<'static, str>>) -> Self {
        Self {
            hostname: hostname.into(),
            ..self
        }
    }

    pub fn reject_token(self) -> Self {
        Self {
            reject_token: true,
            ..self
        }
    }

    pub fn return_invalid_response(self) -> Self {
        Self {
            return_invalid_response: true,
            ..self
        }
    }

    pub fn delay_response(self, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..self
        }
    }

    /// Starts serving on an ephemeral port and returns the verification URL.
    pub async fn start(&self) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let app = Router::new()
            .route(VERIFY_PATH, post(verify))
            .with_state(self.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{address}{VERIFY_PATH}")
    }

    /// The token and remote IP of the most recent verification request.
    pub fn last_request(&self) -> Option<(String, Option<String>)> {
        self.last_request.lock().unwrap().clone()
    }
}

async fn verify(
    State(state): State<FakeRecaptcha>,
    Form(payload): Form<VerifyRequestPayload>,
) -> Response {
    *state.last_request.lock().unwrap() = Some((payload.response.clone(), payload.remoteip));
    if let Some(delay) = state.delay {
        sleep(delay).await;
    }

    if state.return_invalid_response {
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            "Invalid response",
        )
            .into_response()
    } else if payload.secret != state.required_secret {
        Json(json!({
            "success": false,
            "error-codes": ["invalid-input-secret"],
        }))
        .into_response()
    } else if state.reject_token {
        Json(json!({
            "success": false,
            "error-codes": ["invalid-input-response"],
        }))
        .into_response()
    } else {
        Json(json!({
            "success": true,
            "score": state.score,
            "action": state.action,
            "hostname": state.hostname,
            "challenge_ts": "2024-01-01T00:00:00Z",
        }))
        .into_response()
    }
}
