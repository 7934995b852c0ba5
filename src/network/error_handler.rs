use serde::Serialize;

use crate::error::OtaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    Unavailable,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::Unavailable => "UNAVAILABLE",
        }
    }

    fn status(&self) -> u16 {
        match self {
            ErrorCode::BadRequest => 400,
            ErrorCode::Unavailable => 503,
        }
    }
}

/// `{"error": <code>, "message": <text>}` plus the engine's numeric code
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(skip)]
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { error: code.as_str(), message: message.into(), code: None, status: code.status() }
    }

    pub fn from_ota(err: &OtaError) -> Self {
        Self {
            error: err.code(),
            message: err.to_string(),
            code: Some(err.numeric()),
            status: err.http_status(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!(r#"{{"error":"{}"}}"#, self.error))
    }

    #[cfg(feature = "espidf")]
    pub fn send<T>(self, req: esp_idf_svc::http::server::Request<T>) -> anyhow::Result<()>
    where
        T: esp_idf_svc::http::server::Connection,
    {
        use esp_idf_svc::io::Write;

        let json = self.to_json();
        // Guard against double send: try to write once; if it fails with already sent, just log
        match req.into_response(self.status, None, &[("Content-Type", "application/json")]) {
            Ok(mut response) => {
                let _ = response.write_all(json.as_bytes());
            }
            Err(e) => {
                log::warn!("ErrorResponse send skipped: response already committed? err={:?}", e);
            }
        }
        Ok(())
    }
}

/// Body of a successful upload
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub size: u32,
}
