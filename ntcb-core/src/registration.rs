//! Registration handshake, client side.
//!
//! A single `POST {authServer}/reg` carrying the full header, including the
//! real access key. Anything other than code 200 is fatal to the caller:
//! a component without a successful registration never joins the bus.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::header::ComponentHeader;

pub const REG_PATH: &str = "/reg";

/// Response codes carried in the JSON body of `/reg`.
pub mod codes {
    pub const SUCCESS: i32 = 200;
    pub const ACCESS_DENIED: i32 = 404;
    pub const EMPTY_BODY: i32 = 500;
    pub const NOT_JSON: i32 = 501;
    pub const NOT_A_HEADER: i32 = 502;
    pub const REGISTRY_UNAVAILABLE: i32 = 503;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub code: i32,
    pub message: String,
}

impl RegisterResponse {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn success() -> Self {
        Self::new(codes::SUCCESS, "register success")
    }

    pub fn access_denied() -> Self {
        Self::new(codes::ACCESS_DENIED, "register fail")
    }

    pub fn is_success(&self) -> bool {
        self.code == codes::SUCCESS
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("authority unreachable: {0}")]
    Network(#[source] reqwest::Error),
    #[error("registration timed out after {0:?}")]
    Timeout(Duration),
    #[error("access denied by authority: {0}")]
    AccessDenied(String),
    #[error("authority rejected the header as malformed ({code}): {message}")]
    MalformedPayload { code: i32, message: String },
    #[error("registration rejected ({code}): {message}")]
    Rejected { code: i32, message: String },
    #[error("unreadable authority response: {0}")]
    InvalidResponse(String),
}

/// Maps an authority reply onto the client-side outcome.
pub fn interpret(resp: RegisterResponse) -> Result<RegisterResponse, RegistrationError> {
    match resp.code {
        codes::SUCCESS => Ok(resp),
        codes::ACCESS_DENIED => Err(RegistrationError::AccessDenied(resp.message)),
        codes::EMPTY_BODY..=codes::NOT_A_HEADER => Err(RegistrationError::MalformedPayload {
            code: resp.code,
            message: resp.message,
        }),
        code => Err(RegistrationError::Rejected { code, message: resp.message }),
    }
}

fn reg_url(auth_server: &str) -> String {
    format!("{}{}", auth_server.trim_end_matches('/'), REG_PATH)
}

/// Sends `header` to the authority and waits (bounded by `timeout`) for the
/// verdict.
pub async fn register(
    auth_server: &str,
    header: &ComponentHeader,
    timeout: Duration,
) -> Result<RegisterResponse, RegistrationError> {
    let url = reg_url(auth_server);
    info!("registering {} (snowID {}) with {url}", header.component_id, header.snow_id);

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(RegistrationError::Network)?;

    let resp = client
        .post(&url)
        .json(header)
        .send()
        .await
        .map_err(|e| classify_transport(e, timeout))?;

    let body = resp
        .text()
        .await
        .map_err(|e| classify_transport(e, timeout))?;
    let parsed: RegisterResponse = serde_json::from_str(&body)
        .map_err(|e| RegistrationError::InvalidResponse(format!("{e}: {body}")))?;

    interpret(parsed)
}

fn classify_transport(e: reqwest::Error, timeout: Duration) -> RegistrationError {
    if e.is_timeout() {
        RegistrationError::Timeout(timeout)
    } else {
        RegistrationError::Network(e)
    }
}
