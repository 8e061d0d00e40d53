//! Device operations
//!
//! [`DeviceManager`] is the public face of the protocol core: every operation
//! looks up the device, goes through the queued-request manager, builds the
//! CoAP request, sends it and classifies the reply.

use crate::codec::{self, Content};
use crate::coap_types::{Request, ResponseCode};
use crate::error::{Lwm2mError, Result};
use crate::queue::{Execute, QueuedRequestManager};
use crate::registry::{Device, DeviceRegistry};
use crate::request_builder::{self, RequestBuilder, process_response};
use crate::transport::{CoapTransport, Exchange};
use crate::types::{DeviceId, Granularity, Operation, OperationKind, ResourcePath};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Attribute names accepted by `write_attributes`
pub const SUPPORTED_ATTRIBUTES: [&str; 6] = ["pmin", "pmax", "gt", "lt", "st", "cancel"];

/// Receives outcomes of operations that were queued and completed on wake-up
pub type DeferredHandler = Arc<dyn Fn(Operation, Result<Content>) + Send + Sync>;

/// Everything needed to reach a device, cheap to clone into deferred closures
#[derive(Clone)]
pub(crate) struct DeviceChannel {
    pub registry: Arc<dyn DeviceRegistry>,
    pub transport: Arc<dyn CoapTransport>,
    pub builder: RequestBuilder,
}

impl DeviceChannel {
    /// Build a request against the device's current address and send it
    pub async fn send<B>(&self, operation: &Operation, build: B) -> Result<Exchange>
    where
        B: FnOnce(&RequestBuilder, &Device) -> Request,
    {
        let device = self.registry.get(operation.device_id).await?;
        let request = build(&self.builder, &device);
        request_builder::send(self.transport.as_ref(), request, &operation.target()).await
    }

    /// Send and classify the reply against `expected`
    pub async fn request<B>(
        &self,
        operation: &Operation,
        expected: ResponseCode,
        build: B,
    ) -> Result<Content>
    where
        B: FnOnce(&RequestBuilder, &Device) -> Request,
    {
        let exchange = self.send(operation, build).await?;
        process_response(exchange.response(), expected, operation)
    }
}

fn log_deferred(operation: Operation, result: Result<Content>) {
    match result {
        Ok(content) => {
            tracing::info!(device_id = operation.device_id, %operation, value = %content.to_json(), "Queued request completed")
        }
        Err(e) => {
            tracing::warn!(device_id = operation.device_id, %operation, error = %e, "Queued request failed")
        }
    }
}

/// Read, write, execute, discover and create on registered devices
#[derive(Clone)]
pub struct DeviceManager {
    channel: DeviceChannel,
    queue: QueuedRequestManager,
    deferred: Arc<Mutex<DeferredHandler>>,
}

impl DeviceManager {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        transport: Arc<dyn CoapTransport>,
        builder: RequestBuilder,
        queue: QueuedRequestManager,
    ) -> Self {
        Self {
            channel: DeviceChannel {
                registry,
                transport,
                builder,
            },
            queue,
            deferred: Arc::new(Mutex::new(Arc::new(log_deferred))),
        }
    }

    pub(crate) fn channel(&self) -> &DeviceChannel {
        &self.channel
    }

    pub fn queue(&self) -> &QueuedRequestManager {
        &self.queue
    }

    /// Replace the handler receiving results of operations completed on wake-up
    pub fn set_deferred_handler(
        &self,
        handler: impl Fn(Operation, Result<Content>) + Send + Sync + 'static,
    ) {
        *self.deferred.lock().unwrap_or_else(PoisonError::into_inner) = Arc::new(handler);
    }

    fn deferred_handler(&self) -> DeferredHandler {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) async fn dispatch(&self, operation: Operation, execute: Execute) -> Result<Content> {
        let deferred = self.deferred_handler();
        self.queue
            .handle(
                self.channel.registry.as_ref(),
                operation,
                execute,
                Box::new(move |operation, result| deferred(operation, result)),
            )
            .await
    }

    /// Read a resource value (expects 2.05)
    pub async fn read(
        &self,
        device_id: DeviceId,
        object_id: u16,
        instance_id: u16,
        resource_id: u16,
    ) -> Result<Content> {
        let path = ResourcePath::resource(object_id, instance_id, resource_id);
        let operation = Operation::new(OperationKind::Read, device_id, path);
        let channel = self.channel.clone();
        let execute: Execute = Box::new(move || {
            async move {
                channel
                    .request(&operation, ResponseCode::Content, |builder, device| {
                        builder.read(device, &path)
                    })
                    .await
            }
            .boxed()
        });
        self.dispatch(operation, execute).await
    }

    /// Write a resource value (PUT, expects 2.04)
    ///
    /// On success the written value is returned, decoded with the write format.
    pub async fn write(
        &self,
        device_id: DeviceId,
        object_id: u16,
        instance_id: u16,
        resource_id: u16,
        value: impl Into<Vec<u8>>,
    ) -> Result<Content> {
        let path = ResourcePath::resource(object_id, instance_id, resource_id);
        let operation = Operation::new(OperationKind::Write, device_id, path);
        let value = value.into();
        let channel = self.channel.clone();
        let execute: Execute = Box::new(move || {
            async move {
                let written = value.clone();
                channel
                    .request(&operation, ResponseCode::Changed, |builder, device| {
                        builder.write(device, &path, value)
                    })
                    .await?;
                codec::decode(channel.builder.write_format(), &written).map_err(|source| {
                    Lwm2mError::Codec {
                        target: operation.target(),
                        source,
                    }
                })
            }
            .boxed()
        });
        self.dispatch(operation, execute).await
    }

    /// Execute a resource (POST, expects 2.04)
    pub async fn execute(
        &self,
        device_id: DeviceId,
        object_id: u16,
        instance_id: u16,
        resource_id: u16,
        args: Option<Vec<u8>>,
    ) -> Result<Content> {
        let path = ResourcePath::resource(object_id, instance_id, resource_id);
        let operation = Operation::new(OperationKind::Execute, device_id, path);
        let channel = self.channel.clone();
        let execute: Execute = Box::new(move || {
            async move {
                channel
                    .request(&operation, ResponseCode::Changed, |builder, device| {
                        builder.execute(device, &path, args)
                    })
                    .await
            }
            .boxed()
        });
        self.dispatch(operation, execute).await
    }

    /// Set notification attributes on `path` (PUT with query, expects 2.04)
    ///
    /// Every attribute name outside [`SUPPORTED_ATTRIBUTES`] is reported in a
    /// single `UnsupportedAttributes` error and nothing is sent.
    pub async fn write_attributes(
        &self,
        device_id: DeviceId,
        path: ResourcePath,
        attributes: &BTreeMap<String, String>,
    ) -> Result<Content> {
        let unsupported: Vec<String> = attributes
            .keys()
            .filter(|name| !SUPPORTED_ATTRIBUTES.contains(&name.as_str()))
            .cloned()
            .collect();
        if !unsupported.is_empty() {
            return Err(Lwm2mError::UnsupportedAttributes(unsupported));
        }

        let operation = Operation::new(OperationKind::WriteAttributes, device_id, path);
        let attributes = attributes.clone();
        let channel = self.channel.clone();
        let execute: Execute = Box::new(move || {
            async move {
                channel
                    .request(&operation, ResponseCode::Changed, |builder, device| {
                        builder.write_attributes(device, &path, &attributes)
                    })
                    .await
            }
            .boxed()
        });
        self.dispatch(operation, execute).await
    }

    /// Discover the attributes and children of an object, instance or resource (expects 2.05)
    pub async fn discover(&self, device_id: DeviceId, path: ResourcePath) -> Result<Content> {
        if path.granularity() == Granularity::Root {
            return Err(Lwm2mError::InvalidPath(path.to_string()));
        }

        let operation = Operation::new(OperationKind::Discover, device_id, path);
        let channel = self.channel.clone();
        let execute: Execute = Box::new(move || {
            async move {
                channel
                    .request(&operation, ResponseCode::Content, |builder, device| {
                        builder.discover(device, &path)
                    })
                    .await
            }
            .boxed()
        });
        self.dispatch(operation, execute).await
    }

    /// Discover `/objectId`
    pub async fn discover_object(&self, device_id: DeviceId, object_id: u16) -> Result<Content> {
        self.discover(device_id, ResourcePath::object(object_id))
            .await
    }

    /// Discover `/objectId/instanceId`
    pub async fn discover_instance(
        &self,
        device_id: DeviceId,
        object_id: u16,
        instance_id: u16,
    ) -> Result<Content> {
        self.discover(device_id, ResourcePath::instance(object_id, instance_id))
            .await
    }

    /// Discover `/objectId/instanceId/resourceId`
    pub async fn discover_resource(
        &self,
        device_id: DeviceId,
        object_id: u16,
        instance_id: u16,
        resource_id: u16,
    ) -> Result<Content> {
        self.discover(
            device_id,
            ResourcePath::resource(object_id, instance_id, resource_id),
        )
        .await
    }

    /// Create an object instance (POST `/objectId/instanceId`, expects 2.01)
    pub async fn create(
        &self,
        device_id: DeviceId,
        object_id: u16,
        instance_id: u16,
    ) -> Result<Content> {
        let path = ResourcePath::instance(object_id, instance_id);
        let operation = Operation::new(OperationKind::Create, device_id, path);
        let channel = self.channel.clone();
        let execute: Execute = Box::new(move || {
            async move {
                channel
                    .request(&operation, ResponseCode::Created, |builder, device| {
                        builder.create(device, &path)
                    })
                    .await
            }
            .boxed()
        });
        self.dispatch(operation, execute).await
    }

    /// Remove an object instance
    ///
    /// Not wired to the device yet: always succeeds without sending anything.
    // TODO: send DELETE /objectId/instanceId expecting 2.02 once delete is part of the operation set
    pub async fn remove(&self, device_id: DeviceId, object_id: u16, instance_id: u16) -> Result<()> {
        tracing::debug!(device_id, object_id, instance_id, "Remove is a no-op");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap_types::{ContentFormat, Method, Response};
    use crate::config::IpProtocol;
    use crate::registry::InMemoryRegistry;
    use crate::transport::TransportError;
    use crate::transport::mock::MockTransport;
    use std::time::{Duration, SystemTime};

    struct Fixture {
        registry: Arc<InMemoryRegistry>,
        transport: Arc<MockTransport>,
        manager: DeviceManager,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(InMemoryRegistry::new());
        let transport = Arc::new(MockTransport::new());
        let manager = DeviceManager::new(
            registry.clone(),
            transport.clone(),
            RequestBuilder::new(IpProtocol::Udp4, 5683, ContentFormat::Text),
            QueuedRequestManager::default(),
        );
        Fixture {
            registry,
            transport,
            manager,
        }
    }

    async fn register(fixture: &Fixture, binding: &str) -> DeviceId {
        let mut device =
            Device::new("node", "10.0.0.2:56830".parse().unwrap()).with_binding(binding);
        device.creation_date = SystemTime::now() - Duration::from_secs(10);
        fixture.registry.register(device).await.unwrap()
    }

    #[tokio::test]
    async fn test_read_sends_get_through_proxy() {
        let fixture = fixture();
        let id = register(&fixture, "U").await;
        fixture
            .transport
            .push_response(Response::content(b"Acme".to_vec(), ContentFormat::Text));

        let value = fixture.manager.read(id, 3, 0, 0).await.unwrap();
        assert_eq!(value.as_text(), Some("Acme"));

        let requests = fixture.transport.requests();
        assert_eq!(requests[0].method, Method::Get);
        assert_eq!(requests[0].uri_path(), "/3/0/0");
        assert_eq!(requests[0].proxy_uri.as_deref(), Some("coap://10.0.0.2:56830"));
    }

    #[tokio::test]
    async fn test_write_returns_written_value() {
        let fixture = fixture();
        let id = register(&fixture, "U").await;
        fixture.transport.push_response(Response::changed());

        let value = fixture.manager.write(id, 1, 0, 1, "300").await.unwrap();
        assert_eq!(value.as_text(), Some("300"));

        let request = &fixture.transport.requests()[0];
        assert_eq!(request.method, Method::Put);
        assert_eq!(request.payload, b"300".to_vec());
        assert_eq!(request.content_format, Some(ContentFormat::Text));
    }

    #[tokio::test]
    async fn test_write_missing_resource() {
        let fixture = fixture();
        let id = register(&fixture, "U").await;
        fixture
            .transport
            .push_response(Response::new(ResponseCode::NotFound));

        assert!(matches!(
            fixture.manager.write(id, 1, 0, 99, "x").await,
            Err(Lwm2mError::ResourceNotFound(path)) if path == "/1/0/99"
        ));
    }

    #[tokio::test]
    async fn test_execute_is_post() {
        let fixture = fixture();
        let id = register(&fixture, "U").await;
        fixture.transport.push_response(Response::changed());

        fixture.manager.execute(id, 3, 0, 4, None).await.unwrap();
        let request = &fixture.transport.requests()[0];
        assert_eq!(request.method, Method::Post);
        assert!(!request.has_payload());
    }

    #[tokio::test]
    async fn test_write_attributes_rejects_unknown_names() {
        let fixture = fixture();
        let id = register(&fixture, "U").await;
        let attributes = BTreeMap::from([
            ("pmin".to_string(), "10".to_string()),
            ("bogus".to_string(), "1".to_string()),
            ("zeta".to_string(), "2".to_string()),
        ]);

        match fixture
            .manager
            .write_attributes(id, ResourcePath::resource(3303, 0, 5700), &attributes)
            .await
        {
            Err(Lwm2mError::UnsupportedAttributes(names)) => {
                assert_eq!(names, vec!["bogus", "zeta"])
            }
            other => panic!("expected UnsupportedAttributes, got {:?}", other),
        }
        assert_eq!(fixture.transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_write_attributes_sends_query() {
        let fixture = fixture();
        let id = register(&fixture, "U").await;
        fixture.transport.push_response(Response::changed());
        let attributes = BTreeMap::from([
            ("pmin".to_string(), "10".to_string()),
            ("pmax".to_string(), "60".to_string()),
        ]);

        fixture
            .manager
            .write_attributes(id, ResourcePath::resource(3303, 0, 5700), &attributes)
            .await
            .unwrap();
        let request = &fixture.transport.requests()[0];
        assert_eq!(request.method, Method::Put);
        assert_eq!(request.query, vec!["pmax=60", "pmin=10"]);
    }

    #[tokio::test]
    async fn test_discover_targets_each_granularity() {
        let fixture = fixture();
        let id = register(&fixture, "U").await;

        fixture.manager.discover_resource(id, 3, 0, 1).await.unwrap();
        fixture.manager.discover_instance(id, 3, 0).await.unwrap();
        fixture.manager.discover_object(id, 3).await.unwrap();

        let paths: Vec<String> = fixture
            .transport
            .requests()
            .iter()
            .map(|r| r.uri_path())
            .collect();
        assert_eq!(paths, vec!["/3/0/1", "/3/0", "/3"]);
        assert!(fixture
            .transport
            .requests()
            .iter()
            .all(|r| r.accept == Some(ContentFormat::LinkFormat)));

        assert!(matches!(
            fixture.manager.discover(id, ResourcePath::root()).await,
            Err(Lwm2mError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_create_expects_created() {
        let fixture = fixture();
        let id = register(&fixture, "U").await;
        fixture.transport.push_response(Response::created("/1/1"));
        fixture.transport.push_response(Response::changed());

        fixture.manager.create(id, 1, 1).await.unwrap();
        assert!(matches!(
            fixture.manager.create(id, 1, 2).await,
            Err(Lwm2mError::ClientError(ResponseCode::Changed))
        ));
        let requests = fixture.transport.requests();
        assert_eq!(requests[0].method, Method::Post);
        assert_eq!(requests[0].uri_path(), "/1/1");
    }

    #[tokio::test]
    async fn test_remove_sends_nothing() {
        let fixture = fixture();
        let id = register(&fixture, "U").await;
        fixture.manager.remove(id, 1, 0).await.unwrap();
        assert_eq!(fixture.transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_carries_target() {
        let fixture = fixture();
        let id = register(&fixture, "U").await;
        fixture
            .transport
            .push_failure(TransportError::Connection("unreachable".into()));

        match fixture.manager.read(id, 3, 0, 0).await {
            Err(Lwm2mError::ClientConnection { target, message }) => {
                assert_eq!(target, format!("device {} /3/0/0", id));
                assert_eq!(message, "unreachable");
            }
            other => panic!("expected connection error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_broken_reply_is_client_response_error() {
        let fixture = fixture();
        let id = register(&fixture, "U").await;
        fixture.transport.push_failure(TransportError::Response(
            "expected a response code, got 0.01".into(),
        ));

        let err = fixture.manager.read(id, 3303, 0, 5700).await.unwrap_err();
        assert_eq!(err.name(), "CLIENT_RESPONSE_ERROR");
        match err {
            Lwm2mError::ClientResponse { target, message } => {
                assert_eq!(target, format!("device {} /3303/0/5700", id));
                assert!(message.contains("0.01"));
            }
            other => panic!("expected response error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_queued_read_delivered_to_deferred_handler() {
        let fixture = fixture();
        let id = register(&fixture, "UQ").await;
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        fixture.manager.set_deferred_handler(move |operation, result| {
            sink.lock()
                .unwrap()
                .push((operation, result.unwrap().as_text().map(str::to_string)));
        });

        assert!(matches!(
            fixture.manager.read(id, 3, 0, 9).await,
            Err(Lwm2mError::RequestInQueue)
        ));
        assert_eq!(fixture.transport.request_count(), 0);

        // The device wakes up from a new address
        let mut device = fixture.registry.get(id).await.unwrap();
        device.port = 40000;
        fixture.registry.update(id, device).await.unwrap();
        fixture
            .transport
            .push_response(Response::content(b"87".to_vec(), ContentFormat::Text));

        assert_eq!(fixture.manager.queue().deliver(id).await, 1);
        assert_eq!(
            fixture.transport.requests()[0].proxy_uri.as_deref(),
            Some("coap://10.0.0.2:40000")
        );
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.kind, OperationKind::Read);
        assert_eq!(results[0].1.as_deref(), Some("87"));
    }
}
