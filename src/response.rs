// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

use std::error::Error;

use serde::Serialize;

pub type Result = hyper::Response<hyper::Body>;

#[derive(Debug, Clone)]
pub struct Response {
    authentication: String,
    version: String,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            authentication: "bearer".to_string(),
            version: "1".to_string(),
        }
    }
}

impl Response {
    fn default_response_builder(&self) -> hyper::http::response::Builder {
        hyper::Response::builder()
            .header("authentication", &self.authentication)
            .header("api-version", &self.version)
    }

    fn create<T>(&self, code: hyper::StatusCode, value: &T) -> Result
    where
        T: ?Sized + Serialize + std::fmt::Debug,
    {
        match serde_json::to_string(value) {
            Ok(json) => {
                match self
                    .default_response_builder()
                    .header("Content-Type", "application/json")
                    .header("Content-Length", json.len())
                    .status(code)
                    .body(hyper::Body::from(json))
                {
                    Ok(resp) => resp,
                    Err(e) => {
                        tracing::error!("Error creating response: {}", e);
                        hyper::Response::builder()
                            .status(hyper::StatusCode::INTERNAL_SERVER_ERROR)
                            .body(hyper::Body::empty())
                            .unwrap()
                    }
                }
            }
            Err(e) => {
                tracing::error!("Error serializing response: {}", e);
                self.default_response_builder()
                    .status(hyper::StatusCode::INTERNAL_SERVER_ERROR)
                    .body(hyper::Body::empty())
                    .unwrap()
            }
        }
    }

    pub fn ok<T>(&self, value: &T) -> Result
    where
        T: ?Sized + Serialize + std::fmt::Debug,
    {
        self.create(hyper::StatusCode::OK, value)
    }

    pub fn created<T>(&self, value: &T) -> Result
    where
        T: ?Sized + Serialize + std::fmt::Debug,
    {
        self.create(hyper::StatusCode::CREATED, value)
    }

    pub fn empty(&self, code: hyper::StatusCode) -> Result {
        self.default_response_builder()
            .status(code)
            .body(hyper::Body::empty())
            .unwrap()
    }

    pub fn no_content(&self) -> Result {
        self.empty(hyper::StatusCode::NO_CONTENT)
    }

    pub fn unauthorized(&self) -> Result {
        self.empty(hyper::StatusCode::UNAUTHORIZED)
    }

    pub fn internal_server_error(&self, err: &dyn Error) -> Result {
        tracing::error!("Unexpected error: {}", err);
        self.empty(hyper::StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn not_found<'a>(&self, class: &'a str, id: &'a str) -> Result {
        #[derive(Serialize, Debug)]
        struct NotFound<'a> {
            class: &'a str,
            id: &'a str,
        }

        let value = NotFound { class, id };
        tracing::trace!("{:?}", value);
        self.create(hyper::StatusCode::NOT_FOUND, &value)
    }

    pub fn bad_request<T>(&self, value: &T) -> Result
    where
        T: ?Sized + Serialize + std::fmt::Debug,
    {
        self.create(hyper::StatusCode::BAD_REQUEST, &value)
    }

    /// Structured failure body: a status and a list of messages.
    pub fn failure(&self, code: hyper::StatusCode, messages: &[String]) -> Result {
        #[derive(Serialize, Debug)]
        struct Failure<'a> {
            status: u16,
            messages: &'a [String],
        }
        let value = Failure {
            status: code.as_u16(),
            messages,
        };
        self.create(code, &value)
    }

    pub fn conflict(&self, message: &str) -> Result {
        self.failure(hyper::StatusCode::CONFLICT, &[message.to_string()])
    }

    pub fn forbidden(&self, message: &str) -> Result {
        self.failure(hyper::StatusCode::FORBIDDEN, &[message.to_string()])
    }

    pub fn service_unavailable(&self, reason: &str) -> Result {
        tracing::error!("Service unavailable: {}", reason);
        self.failure(
            hyper::StatusCode::SERVICE_UNAVAILABLE,
            &[reason.to_string()],
        )
    }
}
