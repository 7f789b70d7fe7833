//! Per-request context handed to route handlers.
//!
//! A [`Context`] bundles the [`Request`] with the path [`Parameters`]
//! captured by the matched dynamic route.

use std::collections::HashMap;

use thiserror::Error;

use crate::Request;
use crate::stream::StreamError;

/// Path parameters extracted from the matched route
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Parameters {
    map: HashMap<String, String>,
}

impl Parameters {
    /// Create a new empty parameters map
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Insert a value into the parameters map
    pub fn insert(&mut self, key: String, value: String) {
        self.map.insert(key, value);
    }

    /// Get a value from the parameters map
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(|value| value.as_str())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Errors from [`Context::json`].
#[derive(Debug, Error)]
pub enum BodyError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("request body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// What a handler receives: the request plus its path parameters.
#[derive(Debug)]
pub struct Context {
    request: Request,
    params: Parameters,
}

impl Context {
    /// Create a new context with no path parameters
    pub fn new(request: Request) -> Self {
        Self::with_params(request, Parameters::new())
    }

    /// Create a context carrying the parameters captured by the router
    pub fn with_params(request: Request, params: Parameters) -> Self {
        Self { request, params }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    /// Reads the whole body and deserializes it as JSON.
    pub async fn json<T>(&self) -> Result<T, BodyError>
    where
        T: serde::de::DeserializeOwned,
    {
        let body = self.request.body().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Event, Parser};
    use crate::stream::Stream;
    use bytes::Bytes;
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Debug, Deserialize, PartialEq)]
    struct User {
        name: String,
    }

    fn request(stream: Arc<Stream>) -> Request {
        let mut parser = Parser::new(8192);
        parser.feed(b"POST /users HTTP/1.1\r\nContent-Length: 16\r\n\r\n");
        match parser.next_event().unwrap() {
            Some(Event::Headers(head)) => Request::new(head, stream),
            other => panic!("expected headers, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn json_body() {
        let stream = Arc::new(Stream::new());
        let ctx = Context::new(request(Arc::clone(&stream)));
        stream.put(Bytes::from_static(br#"{"name":"ada"}"#));
        stream.end();
        let user: User = ctx.json().await.unwrap();
        assert_eq!(user, User { name: "ada".into() });
    }

    #[tokio::test]
    async fn invalid_json() {
        let stream = Arc::new(Stream::new());
        let ctx = Context::new(request(Arc::clone(&stream)));
        stream.put(Bytes::from_static(b"not json"));
        stream.end();
        assert!(matches!(ctx.json::<User>().await, Err(BodyError::Json(_))));
    }

    #[test]
    fn parameters() {
        let mut params = Parameters::new();
        assert!(params.is_empty());
        params.insert("id".into(), "42".into());
        assert_eq!(params.get("id"), Some("42"));
        assert_eq!(params.len(), 1);
    }
}
