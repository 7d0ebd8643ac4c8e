//! Scripted transport for unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use crate::http::{HttpResponse, HttpTransport};
use crate::{Error, Result};

type PostHandler = dyn Fn(&str, &Value) -> Result<HttpResponse> + Send + Sync;
type GetHandler = dyn Fn(&str) -> Result<Value> + Send + Sync;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPost {
    pub url: String,
    pub bearer_token: Option<String>,
    pub body: Value,
}

pub struct MockTransport {
    post_handler: Box<PostHandler>,
    get_handler: Box<GetHandler>,
    post_delay: Option<Duration>,
    posts: Mutex<Vec<RecordedPost>>,
    gets: Mutex<Vec<String>>,
}

impl MockTransport {
    /// Every POST is acknowledged with `{"success": true}`.
    pub fn accepting() -> Self {
        Self::with_post(|_, _| Ok(ok(json!({"success": true}))))
    }

    /// Every request fails without a response.
    pub fn offline() -> Self {
        Self::with_post(|_, _| Err(unreachable_error())).with_get(|_| Err(unreachable_error()))
    }

    pub fn with_post(
        handler: impl Fn(&str, &Value) -> Result<HttpResponse> + Send + Sync + 'static,
    ) -> Self {
        Self {
            post_handler: Box::new(handler),
            get_handler: Box::new(|url| Err(Error::Transport(format!("no GET handler for {url}")))),
            post_delay: None,
            posts: Mutex::new(Vec::new()),
            gets: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_get(mut self, handler: impl Fn(&str) -> Result<Value> + Send + Sync + 'static) -> Self {
        self.get_handler = Box::new(handler);
        self
    }

    #[must_use]
    pub const fn with_post_delay(mut self, delay: Duration) -> Self {
        self.post_delay = Some(delay);
        self
    }

    pub fn posts(&self) -> Vec<RecordedPost> {
        self.posts.lock().unwrap().clone()
    }

    pub fn gets(&self) -> Vec<String> {
        self.gets.lock().unwrap().clone()
    }

    pub fn get_count(&self, url: &str) -> usize {
        self.gets().iter().filter(|candidate| *candidate == url).count()
    }
}

impl HttpTransport for MockTransport {
    async fn post_json(
        &self,
        url: &str,
        bearer_token: Option<&str>,
        body: &Value,
    ) -> Result<HttpResponse> {
        self.posts.lock().unwrap().push(RecordedPost {
            url: url.to_string(),
            bearer_token: bearer_token.map(ToOwned::to_owned),
            body: body.clone(),
        });
        if let Some(delay) = self.post_delay {
            tokio::time::sleep(delay).await;
        }
        (self.post_handler)(url, body)
    }

    async fn get_json(&self, url: &str, _headers: &[(&str, &str)]) -> Result<Value> {
        self.gets.lock().unwrap().push(url.to_string());
        (self.get_handler)(url)
    }
}

pub fn ok(body: Value) -> HttpResponse {
    HttpResponse { status: 200, body }
}

pub fn unreachable_error() -> Error {
    Error::Transport("network is unreachable".to_string())
}

pub fn shared(transport: MockTransport) -> Arc<MockTransport> {
    Arc::new(transport)
}
