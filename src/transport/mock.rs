//! Scripted transport for unit tests

use super::{CoapTransport, Exchange, ObserveHandle, ObserveStream, TransportError};
use crate::coap_types::{Request, Response};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

enum Scripted {
    Reply(Response),
    Observe(ObserveStream),
    Fail(TransportError),
}

/// Records every request and answers from a script, falling back to a default reply
pub(crate) struct MockTransport {
    requests: Mutex<Vec<Request>>,
    script: Mutex<VecDeque<Scripted>>,
    default: Response,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_default(Response::content(Vec::new(), Default::default()))
    }

    pub fn with_default(default: Response) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            default,
        }
    }

    pub fn push_response(&self, response: Response) {
        self.script.lock().unwrap().push_back(Scripted::Reply(response));
    }

    /// Script an Observe reply; the handle pushes notifications into it
    pub fn push_observe(&self, first: Response) -> ObserveHandle {
        let (stream, handle) = ObserveStream::channel(first);
        self.script.lock().unwrap().push_back(Scripted::Observe(stream));
        handle
    }

    pub fn push_failure(&self, error: TransportError) {
        self.script.lock().unwrap().push_back(Scripted::Fail(error));
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl CoapTransport for MockTransport {
    async fn send(&self, request: Request) -> Result<Exchange, TransportError> {
        self.requests.lock().unwrap().push(request);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Reply(response)) => Ok(Exchange::Response(response)),
            Some(Scripted::Observe(stream)) => Ok(Exchange::Observe(stream)),
            Some(Scripted::Fail(error)) => Err(error),
            None => Ok(Exchange::Response(self.default.clone())),
        }
    }
}
