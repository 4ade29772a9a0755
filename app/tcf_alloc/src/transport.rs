/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use async_trait::async_trait;
use http::Method;
use http::StatusCode;
use serde_json::Value;
use tcf_targets::ServerId;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Cannot reach `{server}`: {message}")]
    Connection { server: ServerId, message: String },
    #[error("Request to `{0}` timed out")]
    Timeout(ServerId),
    #[error("`{server}` answered {status}: {message}")]
    Status {
        server: ServerId,
        status: StatusCode,
        message: String,
    },
    #[error("`{server}` has no `{path}`")]
    NotFound { server: ServerId, path: String },
}

impl TransportError {
    /// Whether trying again later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connection { .. } | TransportError::Timeout(_) => true,
            TransportError::Status { status, .. } => status.is_server_error(),
            TransportError::NotFound { .. } => false,
        }
    }
}

/// Requests against one server of the herd; session handling, cookies and
/// certificates are the implementation's business.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(
        &self,
        server: &ServerId,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, TransportError>;
}
