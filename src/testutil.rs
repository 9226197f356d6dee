//! Scripted request executor for unit tests.

use crate::exec::{ExecutedResponse, RequestExecutor, StepRequest, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;

type Responder =
    Box<dyn Fn(&StepRequest) -> Result<ExecutedResponse, TransportError> + Send + Sync>;

/// Executor whose responses are scripted by a closure; records every request.
pub(crate) struct ScriptedExecutor {
    responder: Responder,
    delay: Option<Duration>,
    calls: Mutex<Vec<StepRequest>>,
}

impl ScriptedExecutor {
    pub fn with(
        responder: impl Fn(&StepRequest) -> Result<ExecutedResponse, TransportError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Respond to every request with the given status and duration.
    pub fn ok_all(status: u16, duration: Duration) -> Self {
        Self::with(move |_| {
            Ok(ExecutedResponse {
                status,
                body: String::new(),
                duration,
            })
        })
    }

    /// Respond with a status derived from the request URL.
    pub fn by_path(status_for: impl Fn(&str) -> u16 + Send + Sync + 'static) -> Self {
        Self::with(move |request| {
            Ok(ExecutedResponse {
                status: status_for(&request.url),
                body: String::new(),
                duration: Duration::from_millis(5),
            })
        })
    }

    /// Fail requests whose URL contains the fragment; 200 otherwise.
    pub fn failing_paths(fragment: &'static str) -> Self {
        Self::with(move |request| {
            if request.url.contains(fragment) {
                Err(TransportError {
                    message: "connection refused".to_string(),
                    duration: Duration::from_millis(1),
                })
            } else {
                Ok(ExecutedResponse {
                    status: 200,
                    body: String::new(),
                    duration: Duration::from_millis(5),
                })
            }
        })
    }

    /// Sleep (tokio time) before each response, to simulate in-flight requests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<StepRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl RequestExecutor for ScriptedExecutor {
    async fn send(&self, request: StepRequest) -> Result<ExecutedResponse, TransportError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().push(request.clone());
        (self.responder)(&request)
    }
}
