// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Standard JSON envelope and failure responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};

use crate::crypto::CryptoError;

/// Application result code with its default message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultCode {
    code: u32,
    message: &'static str,
}

impl ResultCode {
    pub const OK: ResultCode = ResultCode {
        code: 2000,
        message: "ok",
    };
    pub const FAIL: ResultCode = ResultCode {
        code: 5000,
        message: "fail",
    };
    pub const BAD_REQUEST: ResultCode = ResultCode {
        code: 40000,
        message: "bad request",
    };

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn message(&self) -> &'static str {
        self.message
    }
}

/// `{ "code", "message", "payload" }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResult<T> {
    pub code: u32,
    pub message: String,
    pub payload: Option<T>,
}

impl<T> ApiResult<T> {
    pub fn ok(payload: T) -> Self {
        Self {
            code: ResultCode::OK.code,
            message: ResultCode::OK.message.to_string(),
            payload: Some(payload),
        }
    }

    /// Envelope with a code and no payload
    pub fn of(code: ResultCode) -> Self {
        Self {
            code: code.code,
            message: code.message.to_string(),
            payload: None,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResult<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// Writes the response for a request aborted by the cipher middleware
pub trait FailureWriter: Send + Sync {
    fn write_failure(&self, error: &CryptoError) -> Response;
}

/// Writes `ApiResult::of(..)` with HTTP 400 for client-caused errors and 500
/// otherwise. The error detail stays in the logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFailureWriter;

impl FailureWriter for JsonFailureWriter {
    fn write_failure(&self, error: &CryptoError) -> Response {
        let (status, code) = if error.is_client_error() {
            (StatusCode::BAD_REQUEST, ResultCode::BAD_REQUEST)
        } else {
            (StatusCode::INTERNAL_SERVER_ERROR, ResultCode::FAIL)
        };
        (status, Json(ApiResult::<()>::of(code))).into_response()
    }
}
