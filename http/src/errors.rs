// RestKit
// Copyright 2023 Julio Merino
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not
// use this file except in compliance with the License.  You may obtain a copy
// of the License at:
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.  See the
// License for the specific language governing permissions and limitations
// under the License.

//! Errors visible to callers of the REST layer and their RFC 7807 rendering.

use crate::codec::Negotiated;
use crate::media;
use axum::response::IntoResponse;
use bytes::Bytes;
use http::StatusCode;
use http::header::CONTENT_TYPE;
use log::error;
use restkit_core::crud::CrudError;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Formats the user-visible message of an error given its `title` and optional `detail`.
fn with_detail(title: &str, detail: &str) -> String {
    if detail.is_empty() { title.to_owned() } else { format!("{}: {}", title, detail) }
}

/// Frontend errors.  These are the errors that are visible to the user on failed requests.
///
/// Every variant carries a possibly-empty detail message that is attached to the problem document
/// sent to the caller.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum RestError {
    /// Indicates that an entity being created already exists.
    #[error("{}", with_detail("Entity already exists", .0))]
    EntityAlreadyExists(String),

    /// Indicates that a requested entity does not exist.
    #[error("{}", with_detail("Entity not found", .0))]
    EntityNotFound(String),

    /// Indicates an authorization problem.
    #[error("{}", with_detail("Forbidden", .0))]
    Forbidden(String),

    /// Catch-all error type for all unexpected errors.
    #[error("{}", with_detail("Internal server error", .0))]
    InternalServerError(String),

    /// Indicates that the request body could not be decoded into an entity.
    #[error("{}", with_detail("Invalid request body", .0))]
    InvalidRequestBody(String),

    /// Indicates that the identifier in the request path could not be parsed.
    #[error("{}", with_detail("Malformed ID in path", .0))]
    MalformedIdInPath(String),

    /// Indicates that the resource does not support the requested method.
    #[error("{}", with_detail("Method not allowed", .0))]
    MethodNotAllowed(String),

    /// Indicates that the response cannot be rendered in the requested media type.
    #[error("{}", with_detail("Not acceptable", .0))]
    NotAcceptable(String),

    /// Indicates that no handler is registered for the requested path.
    #[error("{}", with_detail("Path not found", .0))]
    PathNotFound(String),

    /// Indicates that the request body exceeds the configured size limit.
    #[error("{}", with_detail("Request entity too large", .0))]
    RequestEntityTooLarge(String),
}

impl RestError {
    /// Returns the stable code that identifies this error in problem documents.
    pub fn code(&self) -> &'static str {
        match self {
            RestError::EntityAlreadyExists(_) => "entity-already-exists",
            RestError::EntityNotFound(_) => "entity-not-found",
            RestError::Forbidden(_) => "forbidden",
            RestError::InternalServerError(_) => "internal-server-error",
            RestError::InvalidRequestBody(_) => "invalid-request-body",
            RestError::MalformedIdInPath(_) => "malformed-id-in-path",
            RestError::MethodNotAllowed(_) => "rest-method-not-allowed",
            RestError::NotAcceptable(_) => "not-acceptable",
            RestError::PathNotFound(_) => "path-not-found",
            RestError::RequestEntityTooLarge(_) => "request-entity-too-large",
        }
    }

    /// Returns the HTTP status code that corresponds to this error.
    pub fn status(&self) -> StatusCode {
        match self {
            RestError::EntityAlreadyExists(_) => StatusCode::CONFLICT,
            RestError::EntityNotFound(_) => StatusCode::NOT_FOUND,
            RestError::Forbidden(_) => StatusCode::FORBIDDEN,
            RestError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RestError::InvalidRequestBody(_) => StatusCode::BAD_REQUEST,
            RestError::MalformedIdInPath(_) => StatusCode::BAD_REQUEST,
            RestError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            RestError::NotAcceptable(_) => StatusCode::NOT_ACCEPTABLE,
            RestError::PathNotFound(_) => StatusCode::NOT_FOUND,
            RestError::RequestEntityTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Returns the short, human-readable summary of this kind of error.
    pub fn title(&self) -> &'static str {
        match self {
            RestError::EntityAlreadyExists(_) => "Entity already exists",
            RestError::EntityNotFound(_) => "Entity not found",
            RestError::Forbidden(_) => "Forbidden",
            RestError::InternalServerError(_) => "Internal server error",
            RestError::InvalidRequestBody(_) => "Invalid request body",
            RestError::MalformedIdInPath(_) => "Malformed ID in path",
            RestError::MethodNotAllowed(_) => "Method not allowed",
            RestError::NotAcceptable(_) => "Not acceptable",
            RestError::PathNotFound(_) => "Path not found",
            RestError::RequestEntityTooLarge(_) => "Request entity too large",
        }
    }

    /// Returns the detail message attached to this error, which may be empty.
    pub fn detail(&self) -> &str {
        match self {
            RestError::EntityAlreadyExists(d)
            | RestError::EntityNotFound(d)
            | RestError::Forbidden(d)
            | RestError::InternalServerError(d)
            | RestError::InvalidRequestBody(d)
            | RestError::MalformedIdInPath(d)
            | RestError::MethodNotAllowed(d)
            | RestError::NotAcceptable(d)
            | RestError::PathNotFound(d)
            | RestError::RequestEntityTooLarge(d) => d,
        }
    }

    /// Recreates an error from its stable `code` and a `detail` message.
    pub fn from_code(code: &str, detail: String) -> Option<Self> {
        let error = match code {
            "entity-already-exists" => RestError::EntityAlreadyExists(detail),
            "entity-not-found" => RestError::EntityNotFound(detail),
            "forbidden" => RestError::Forbidden(detail),
            "internal-server-error" => RestError::InternalServerError(detail),
            "invalid-request-body" => RestError::InvalidRequestBody(detail),
            "malformed-id-in-path" => RestError::MalformedIdInPath(detail),
            "rest-method-not-allowed" => RestError::MethodNotAllowed(detail),
            "not-acceptable" => RestError::NotAcceptable(detail),
            "path-not-found" => RestError::PathNotFound(detail),
            "request-entity-too-large" => RestError::RequestEntityTooLarge(detail),
            _ => return None,
        };
        Some(error)
    }

    /// Builds the problem document that describes this error for a request to `instance`.
    pub fn to_problem<S: Into<String>>(&self, instance: S) -> ProblemDetails {
        ProblemDetails {
            r#type: ProblemType::new(self.code()),
            title: self.title().to_owned(),
            status: self.status().as_u16(),
            detail: self.detail().to_owned(),
            instance: instance.into(),
        }
    }

    /// Renders this error as a response encoded with the `negotiated` codec.
    ///
    /// JSON-based responses use the `application/problem+json` media type.  If the negotiated
    /// codec cannot encode the problem document, this falls back to JSON.
    pub fn into_negotiated_response(
        self,
        negotiated: &Negotiated,
        instance: &str,
    ) -> axum::response::Response {
        let problem = self.to_problem(instance);
        let encoded = serde_json::to_value(&problem)
            .map_err(|e| e.to_string())
            .and_then(|value| negotiated.codec.marshal(&value).map_err(|e| e.to_string()));
        match encoded {
            Ok(body) => {
                let media_type = if negotiated.media_type == media::JSON {
                    media::PROBLEM_JSON
                } else {
                    negotiated.media_type.as_str()
                };
                problem_response(self.status(), media_type, body)
            }
            Err(e) => {
                error!("Cannot encode problem as {}: {}", negotiated.media_type, e);
                problem.into_response()
            }
        }
    }
}

impl From<CrudError> for RestError {
    fn from(e: CrudError) -> Self {
        match e {
            CrudError::AlreadyExists(d) => RestError::EntityAlreadyExists(d),
            CrudError::BackendError(d) => RestError::InternalServerError(d),
            CrudError::Forbidden(d) => RestError::Forbidden(d),
            CrudError::InvalidInput(d) => RestError::InvalidRequestBody(d),
            CrudError::NotFound(d) => RestError::EntityNotFound(d),
        }
    }
}

impl IntoResponse for RestError {
    fn into_response(self) -> axum::response::Response {
        self.to_problem("").into_response()
    }
}

/// Result type for this module.
pub type RestResult<T> = Result<T, RestError>;

/// Builds a response with the given `status`, `media_type` and already-encoded `body`.
fn problem_response(status: StatusCode, media_type: &str, body: Bytes) -> axum::response::Response {
    (status, [(CONTENT_TYPE, media_type.to_owned())], body).into_response()
}

/// Identifier of a problem type, rendered as a URI reference in problem documents.
///
/// The identifier is the error code.  When a base URL is present, the serialized form is
/// `<base_url>/<id>`; otherwise it is just `<id>`.  Parsing keeps the last path segment as the
/// identifier so that clients can recover the code regardless of the base URL used by the server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProblemType {
    /// Base URL under which problem types are documented, if any.
    pub base_url: Option<String>,

    /// Stable code of the problem type.
    pub id: String,
}

impl ProblemType {
    /// Creates a problem type without a base URL.
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self { base_url: None, id: id.into() }
    }

    /// Creates a problem type documented under `base_url`.
    pub fn with_base_url<B: Into<String>, S: Into<String>>(base_url: B, id: S) -> Self {
        Self { base_url: Some(base_url.into()), id: id.into() }
    }
}

impl fmt::Display for ProblemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.base_url.as_ref() {
            Some(base_url) => write!(f, "{}/{}", base_url.trim_end_matches('/'), self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

impl From<&str> for ProblemType {
    fn from(raw: &str) -> Self {
        match raw.rsplit_once('/') {
            Some((base_url, id)) => Self::with_base_url(base_url, id),
            None => Self::new(raw),
        }
    }
}

impl Serialize for ProblemType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Visitor to deserialize a `ProblemType` from a string.
struct ProblemTypeVisitor;

impl Visitor<'_> for ProblemTypeVisitor {
    type Value = ProblemType;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a problem type URI reference")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(ProblemType::from(v))
    }
}

impl<'de> Deserialize<'de> for ProblemType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(ProblemTypeVisitor)
    }
}

/// RFC 7807 problem document.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ProblemDetails {
    /// Identifier of the kind of problem.
    #[serde(rename = "type")]
    pub r#type: ProblemType,

    /// Short summary of the kind of problem.
    pub title: String,

    /// HTTP status code of the response that carried this document.
    pub status: u16,

    /// Explanation specific to this occurrence of the problem.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,

    /// Path of the request that caused the problem.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance: String,
}

impl ProblemDetails {
    /// Converts this document back to the error it describes, if the code is known.
    pub fn to_error(&self) -> Option<RestError> {
        RestError::from_code(&self.r#type.id, self.detail.clone())
    }
}

impl IntoResponse for ProblemDetails {
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        match serde_json::to_vec(&self) {
            Ok(body) => problem_response(status, media::PROBLEM_JSON, Bytes::from(body)),
            Err(e) => {
                error!("Cannot serialize problem document: {}", e);
                status.into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_test::{Token, assert_tokens};

    /// Every known error, for table-driven tests.
    fn all_errors() -> Vec<RestError> {
        vec![
            RestError::EntityAlreadyExists("a".to_owned()),
            RestError::EntityNotFound("b".to_owned()),
            RestError::Forbidden("c".to_owned()),
            RestError::InternalServerError("d".to_owned()),
            RestError::InvalidRequestBody("e".to_owned()),
            RestError::MalformedIdInPath("f".to_owned()),
            RestError::MethodNotAllowed("g".to_owned()),
            RestError::NotAcceptable("h".to_owned()),
            RestError::PathNotFound("i".to_owned()),
            RestError::RequestEntityTooLarge("j".to_owned()),
        ]
    }

    #[test]
    fn test_rest_error_codes_and_statuses() {
        let expected = [
            ("entity-already-exists", 409),
            ("entity-not-found", 404),
            ("forbidden", 403),
            ("internal-server-error", 500),
            ("invalid-request-body", 400),
            ("malformed-id-in-path", 400),
            ("rest-method-not-allowed", 405),
            ("not-acceptable", 406),
            ("path-not-found", 404),
            ("request-entity-too-large", 413),
        ];
        for (error, (code, status)) in all_errors().into_iter().zip(expected) {
            assert_eq!(code, error.code());
            assert_eq!(status, error.status().as_u16());
        }
    }

    #[test]
    fn test_rest_error_from_code_roundtrip() {
        for error in all_errors() {
            let detail = error.detail().to_owned();
            assert_eq!(Some(error.clone()), RestError::from_code(error.code(), detail));
        }
        assert_eq!(None, RestError::from_code("unknown", "x".to_owned()));
    }

    #[test]
    fn test_rest_error_display() {
        assert_eq!("Entity not found", RestError::EntityNotFound(String::new()).to_string());
        assert_eq!(
            "Entity not found: foo 3",
            RestError::EntityNotFound("foo 3".to_owned()).to_string()
        );
    }

    #[test]
    fn test_rest_error_from_crud_error() {
        assert_eq!(
            RestError::EntityAlreadyExists("x".to_owned()),
            RestError::from(CrudError::AlreadyExists("x".to_owned()))
        );
        assert_eq!(
            RestError::InternalServerError("x".to_owned()),
            RestError::from(CrudError::BackendError("x".to_owned()))
        );
        assert_eq!(
            RestError::Forbidden("x".to_owned()),
            RestError::from(CrudError::Forbidden("x".to_owned()))
        );
        assert_eq!(
            RestError::InvalidRequestBody("x".to_owned()),
            RestError::from(CrudError::InvalidInput("x".to_owned()))
        );
        assert_eq!(
            RestError::EntityNotFound("x".to_owned()),
            RestError::from(CrudError::NotFound("x".to_owned()))
        );
    }

    #[test]
    fn test_problem_type_ser_de() {
        assert_tokens(&ProblemType::new("entity-not-found"), &[Token::Str("entity-not-found")]);
        assert_tokens(
            &ProblemType::with_base_url("https://errors.example.com/problems", "forbidden"),
            &[Token::Str("https://errors.example.com/problems/forbidden")],
        );
    }

    #[test]
    fn test_problem_type_trailing_slash_in_base_url() {
        let problem_type = ProblemType::with_base_url("https://example.com/", "forbidden");
        assert_eq!("https://example.com/forbidden", problem_type.to_string());
        assert_eq!("forbidden", ProblemType::from(problem_type.to_string().as_str()).id);
    }

    #[test]
    fn test_problem_details_json() {
        let problem = RestError::EntityNotFound("foo 3".to_owned()).to_problem("/foos/3");
        let json = serde_json::to_value(&problem).unwrap();
        assert_eq!(
            serde_json::json!({
                "type": "entity-not-found",
                "title": "Entity not found",
                "status": 404,
                "detail": "foo 3",
                "instance": "/foos/3",
            }),
            json
        );

        let decoded: ProblemDetails = serde_json::from_value(json).unwrap();
        assert_eq!(problem, decoded);
        assert_eq!(Some(RestError::EntityNotFound("foo 3".to_owned())), decoded.to_error());
    }

    #[test]
    fn test_problem_details_omits_empty_fields() {
        let problem = RestError::PathNotFound(String::new()).to_problem("");
        let json = serde_json::to_value(&problem).unwrap();
        assert_eq!(
            serde_json::json!({"type": "path-not-found", "title": "Path not found", "status": 404}),
            json
        );
    }

    #[tokio::test]
    async fn test_rest_error_into_response() {
        let response = RestError::Forbidden("nope".to_owned()).into_response();
        assert_eq!(StatusCode::FORBIDDEN, response.status());
        assert_eq!(media::PROBLEM_JSON, response.headers().get(CONTENT_TYPE).unwrap());
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let problem: ProblemDetails = serde_json::from_slice(&body).unwrap();
        assert_eq!("forbidden", problem.r#type.id);
        assert_eq!("nope", problem.detail);
    }
}
