//! Bootstrap script replay
//!
//! On `POST /bs?ep=<endpoint>` the device's script is read from the
//! device-setting store and every step is issued towards the requesting peer
//! without waiting for the previous one. The sequence closes with `POST /`,
//! after which the user handler receives the endpoint name and the original
//! payload. A failed step is logged and never stops the sequence.

use crate::coap_types::{IncomingRequest, Request, Response, ResponseCode, query_keys};
use crate::device_setting::{DeviceSettingStore, ScriptOp, ScriptStep};
use crate::error::{Lwm2mError, Result};
use crate::request_builder::{self, RequestBuilder};
use crate::transport::CoapTransport;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

/// Called with the endpoint name and the bootstrap request payload
pub type BootstrapHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// A request issued while bootstrapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapStep {
    /// A step of the device's script
    Script(ScriptStep),
    /// The closing `POST /`
    Finish,
}

impl fmt::Display for BootstrapStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Script(ScriptStep {
                op: ScriptOp::Delete,
                uri,
                ..
            }) => write!(f, "delete {}", uri),
            Self::Script(ScriptStep {
                op: ScriptOp::Write,
                uri,
                ..
            }) => write!(f, "write {}", uri),
            Self::Finish => f.write_str("finish"),
        }
    }
}

/// Result of one issued step
#[derive(Debug)]
pub struct StepOutcome {
    pub step: BootstrapStep,
    pub result: Result<()>,
}

/// Handle on a replay whose steps are still in flight
#[derive(Debug)]
pub struct BootstrapRun {
    pub endpoint: String,
    tasks: Vec<(BootstrapStep, JoinHandle<Result<()>>)>,
}

impl BootstrapRun {
    /// Number of issued requests, the closing POST included
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every step and report its outcome, in issue order
    pub async fn wait(self) -> Vec<StepOutcome> {
        let mut outcomes = Vec::with_capacity(self.tasks.len());
        for (step, task) in self.tasks {
            let result = task.await.unwrap_or_else(|e| {
                Err(Lwm2mError::ClientResponse {
                    target: format!("bootstrap {} {}", self.endpoint, step),
                    message: e.to_string(),
                })
            });
            outcomes.push(StepOutcome { step, result });
        }
        outcomes
    }
}

/// Serves bootstrap requests
#[derive(Clone)]
pub struct BootstrapExecutor {
    settings: Arc<dyn DeviceSettingStore>,
    transport: Arc<dyn CoapTransport>,
    builder: RequestBuilder,
    handler: Arc<Mutex<Option<BootstrapHandler>>>,
}

impl BootstrapExecutor {
    pub fn new(
        settings: Arc<dyn DeviceSettingStore>,
        transport: Arc<dyn CoapTransport>,
        builder: RequestBuilder,
    ) -> Self {
        Self {
            settings,
            transport,
            builder,
            handler: Arc::new(Mutex::new(None)),
        }
    }

    /// Install the handler called once a bootstrap sequence has been issued
    pub fn set_handler(&self, handler: impl Fn(&str, &str) + Send + Sync + 'static) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Answer a bootstrap request and start the replay in the background
    ///
    /// Replies 4.00 when `ep` is missing, 2.04 otherwise.
    pub fn handle(&self, request: &IncomingRequest) -> Response {
        let params = request.query_params();
        if let Err(e) = params.check_mandatory(&[query_keys::ENDPOINT]) {
            tracing::debug!(error = %e, "Bootstrap request rejected");
            return Response::from_error(&e);
        }

        let endpoint = params.get(query_keys::ENDPOINT).unwrap_or_default().to_string();
        let peer = request.source;
        let payload = request.payload_text();
        let executor = self.clone();
        tokio::spawn(async move {
            if let Err(e) = executor.replay(&endpoint, peer, &payload).await {
                tracing::warn!(endpoint = %endpoint, error = %e, "Bootstrap aborted");
            }
        });

        Response::changed()
    }

    /// Issue the script of `endpoint` towards `peer`, then the closing POST, then call the handler
    ///
    /// Fails only when the script cannot be read; step failures are logged and
    /// reported through [`BootstrapRun::wait`].
    pub async fn replay(&self, endpoint: &str, peer: SocketAddr, payload: &str) -> Result<BootstrapRun> {
        let steps = self.settings.get(endpoint).await?;
        tracing::info!(endpoint, %peer, steps = steps.len(), "Replaying bootstrap script");

        let mut tasks = Vec::with_capacity(steps.len() + 1);
        for step in steps {
            let (request, expected) = match step.op {
                ScriptOp::Delete => (
                    self.builder.bootstrap_delete(peer, &step.uri),
                    ResponseCode::Deleted,
                ),
                ScriptOp::Write => (
                    self.builder.bootstrap_write(peer, &step.uri, &step.arg),
                    ResponseCode::Changed,
                ),
            };
            let step = BootstrapStep::Script(step);
            let task = self.issue(endpoint, step.clone(), request, expected);
            tasks.push((step, task));
        }

        let finish = self.builder.bootstrap_finish(peer);
        let task = self.issue(endpoint, BootstrapStep::Finish, finish, ResponseCode::Changed);
        tasks.push((BootstrapStep::Finish, task));

        let handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => handler(endpoint, payload),
            None => tracing::debug!(endpoint, "No bootstrap handler installed"),
        }

        Ok(BootstrapRun {
            endpoint: endpoint.to_string(),
            tasks,
        })
    }

    fn issue(
        &self,
        endpoint: &str,
        step: BootstrapStep,
        request: Request,
        expected: ResponseCode,
    ) -> JoinHandle<Result<()>> {
        let transport = self.transport.clone();
        let target = format!("bootstrap {} {}", endpoint, step);
        tokio::spawn(async move {
            let result = match request_builder::send(transport.as_ref(), request, &target).await {
                Ok(exchange) if exchange.response().code == expected => Ok(()),
                Ok(exchange) => Err(Lwm2mError::ClientError(exchange.response().code)),
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                tracing::warn!(step = %target, error = %e, "Bootstrap step failed");
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap_types::{ContentFormat, Method};
    use crate::config::IpProtocol;
    use crate::device_setting::SqliteDeviceSetting;
    use crate::transport::mock::MockTransport;
    use crate::transport::TransportError;

    fn executor(transport: Arc<MockTransport>) -> BootstrapExecutor {
        let settings = SqliteDeviceSetting::open_in_memory().unwrap();
        settings
            .put("node-1", "delete /0\nwrite /1/0/1 300\nwrite /0/1/0 coap://lwm2m.example:5683")
            .unwrap();
        BootstrapExecutor::new(
            Arc::new(settings),
            transport,
            RequestBuilder::new(IpProtocol::Udp4, 5683, ContentFormat::Text),
        )
    }

    fn peer() -> SocketAddr {
        "10.0.0.7:56830".parse().unwrap()
    }

    #[tokio::test]
    async fn test_replay_issues_script_then_finish() {
        let transport = Arc::new(MockTransport::with_default(Response::changed()));
        transport.push_response(Response::deleted());
        let executor = executor(transport.clone());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        executor.set_handler(move |endpoint, payload| {
            sink.lock().unwrap().push(format!("{}:{}", endpoint, payload))
        });

        let run = executor.replay("node-1", peer(), "hello").await.unwrap();
        assert_eq!(run.len(), 4);
        assert_eq!(*calls.lock().unwrap(), vec!["node-1:hello"]);

        let outcomes = run.wait().await;
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert_eq!(outcomes[3].step, BootstrapStep::Finish);

        let requests = transport.requests();
        let summary: Vec<(Method, String)> = requests
            .iter()
            .map(|r| (r.method, r.uri_path()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (Method::Delete, "/0".to_string()),
                (Method::Put, "/1/0/1".to_string()),
                (Method::Put, "/0/1/0".to_string()),
                (Method::Post, "/".to_string()),
            ]
        );
        assert_eq!(requests[2].payload, b"coap://lwm2m.example:5683".to_vec());
        assert!(requests
            .iter()
            .all(|r| r.proxy_uri.as_deref() == Some("coap://10.0.0.7:56830")));
    }

    #[tokio::test]
    async fn test_step_failure_does_not_stop_sequence() {
        let transport = Arc::new(MockTransport::with_default(Response::changed()));
        transport.push_failure(TransportError::Connection("unreachable".into()));
        transport.push_response(Response::new(ResponseCode::BadRequest));
        let executor = executor(transport.clone());

        let outcomes = executor
            .replay("node-1", peer(), "")
            .await
            .unwrap()
            .wait()
            .await;
        assert_eq!(outcomes.len(), 4);
        assert!(matches!(
            outcomes[0].result,
            Err(Lwm2mError::ClientConnection { .. })
        ));
        assert!(matches!(
            outcomes[1].result,
            Err(Lwm2mError::ClientError(ResponseCode::BadRequest))
        ));
        assert!(outcomes[2].result.is_ok());
        assert!(outcomes[3].result.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_endpoint_fails_without_requests() {
        let transport = Arc::new(MockTransport::new());
        let executor = executor(transport.clone());
        assert!(matches!(
            executor.replay("ghost", peer(), "").await,
            Err(Lwm2mError::DeviceNotFound(_))
        ));
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_handle_checks_endpoint() {
        let transport = Arc::new(MockTransport::with_default(Response::changed()));
        let executor = executor(transport);

        let missing = IncomingRequest::new(Method::Post, "/bs", peer());
        let response = executor.handle(&missing);
        assert_eq!(response.code, ResponseCode::BadRequest);
        assert_eq!(response.payload, b"BAD_REQUEST_ERROR".to_vec());

        let ok = IncomingRequest::new(Method::Post, "/bs?ep=node-1", peer());
        assert_eq!(executor.handle(&ok).code, ResponseCode::Changed);
    }
}
