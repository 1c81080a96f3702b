//! In-memory transport that records requests and replays canned responses.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::transport::{HttpRequest, HttpResponse, Transport, TransportError};

/// A [`Transport`] that never touches the network.
///
/// Responses are handed out in the order they were queued. When the queue is
/// empty every request is answered with `200` and a `null` body.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    responses: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response with the given JSON body.
    pub fn with_response(self, data: Value) -> Self {
        self.push_response(Ok(HttpResponse { status: 200, data }));
        self
    }

    /// Queue a non-success status.
    pub fn with_error(self, status: u16, message: &str) -> Self {
        self.push_response(Err(TransportError::Api {
            status,
            message: message.to_string(),
        }));
        self
    }

    pub fn push_response(&self, response: Result<HttpResponse, TransportError>) {
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(response);
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// The most recent request, if any.
    pub fn last_request(&self) -> Option<HttpRequest> {
        self.requests().pop()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request);

        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .unwrap_or(Ok(HttpResponse {
                status: 200,
                data: Value::Null,
            }))
    }
}
