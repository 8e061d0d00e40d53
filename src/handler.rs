//! LWM2M Request Handler
//!
//! Transport-agnostic handling of the requests devices send to the server:
//! registration, registration update, de-registration and bootstrap.
//! Plug into any CoAP server loop.

use crate::bootstrap::BootstrapExecutor;
use crate::coap_types::{IncomingRequest, Method, QueryParams, Response, query_keys};
use crate::config::ServerConfig;
use crate::error::{Lwm2mError, Result};
use crate::observation::ObservationManager;
use crate::queue::QueuedRequestManager;
use crate::registry::{DEFAULT_BINDING, DEFAULT_LIFETIME_SECS, Device, DeviceRegistry};
use crate::types::DeviceId;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

/// Called with the device record and the request payload
pub type DeviceListener = Arc<dyn Fn(&Device, &str) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    registration: Option<DeviceListener>,
    update: Option<DeviceListener>,
    deregistration: Option<DeviceListener>,
}

/// Main LWM2M request handler
///
/// # Example
/// ```ignore
/// let handler = RequestHandler::new(config, registry, queue, observations, bootstrap);
/// let response = handler.handle(&request).await;
/// // Send response via your CoAP transport
/// ```
#[derive(Clone)]
pub struct RequestHandler {
    config: Arc<ServerConfig>,
    registry: Arc<dyn DeviceRegistry>,
    queue: QueuedRequestManager,
    observations: ObservationManager,
    bootstrap: BootstrapExecutor,
    listeners: Arc<Mutex<Listeners>>,
}

impl RequestHandler {
    pub fn new(
        config: Arc<ServerConfig>,
        registry: Arc<dyn DeviceRegistry>,
        queue: QueuedRequestManager,
        observations: ObservationManager,
        bootstrap: BootstrapExecutor,
    ) -> Self {
        Self {
            config,
            registry,
            queue,
            observations,
            bootstrap,
            listeners: Arc::new(Mutex::new(Listeners::default())),
        }
    }

    /// Called after a device has been stored
    pub fn set_registration_listener(&self, listener: impl Fn(&Device, &str) + Send + Sync + 'static) {
        self.listeners().registration = Some(Arc::new(listener));
    }

    /// Called after a registration has been refreshed
    pub fn set_update_listener(&self, listener: impl Fn(&Device, &str) + Send + Sync + 'static) {
        self.listeners().update = Some(Arc::new(listener));
    }

    /// Called with the removed record after a de-registration
    pub fn set_deregistration_listener(
        &self,
        listener: impl Fn(&Device, &str) + Send + Sync + 'static,
    ) {
        self.listeners().deregistration = Some(Arc::new(listener));
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, pick: impl Fn(&Listeners) -> Option<DeviceListener>, device: &Device, payload: &str) {
        // Cloned out so the listener runs without the lock
        let listener = pick(&self.listeners());
        if let Some(listener) = listener {
            listener(device, payload);
        }
    }

    /// Handle an incoming device request
    pub async fn handle(&self, request: &IncomingRequest) -> Response {
        let segments: Vec<&str> = request.path.iter().map(String::as_str).collect();

        let result = match (request.method, segments.as_slice()) {
            (Method::Post, ["bs"]) => return self.bootstrap.handle(request),
            (Method::Post, ["rd", id]) => self.handle_update(request, id).await,
            (Method::Delete, ["rd", id]) => self.handle_deregistration(id).await,
            (Method::Post, ["rd", _, _, ..]) => Err(Lwm2mError::ResourceNotFound(request.uri_path())),
            (Method::Post, _) => self.handle_registration(request).await,
            _ => Err(Lwm2mError::ResourceNotFound(request.uri_path())),
        };

        result.unwrap_or_else(|e| {
            tracing::debug!(method = ?request.method, path = %request.uri_path(), error = %e, "Request ended in error");
            Response::from_error(&e)
        })
    }

    /// Handle registration - `POST /rd?ep=..` or a configured type url
    async fn handle_registration(&self, request: &IncomingRequest) -> Result<Response> {
        let params = request.query_params();
        params.check_mandatory(&[query_keys::ENDPOINT])?;

        let path = request.uri_path();
        let device_type = self.resolve_type(&path)?;

        let endpoint = params.get(query_keys::ENDPOINT).unwrap_or_default();
        let mut device = Device::new(endpoint, request.source)
            .with_lifetime(parse_lifetime(&params)?.unwrap_or(DEFAULT_LIFETIME_SECS))
            .with_binding(params.get(query_keys::BINDING).unwrap_or(DEFAULT_BINDING));
        device.lwm2m_version = params.get(query_keys::VERSION).map(str::to_string);
        device.device_type = device_type;
        device.path = path;

        let id = self.registry.register(device.clone()).await?;
        device.id = id;
        tracing::info!(device_id = id, endpoint, device_type = ?device.device_type, "Device registered");

        self.notify(|l| l.registration.clone(), &device, &request.payload_text());
        Ok(Response::created(&self.config.registration_location(id)))
    }

    /// `/rd` gets the default type, other paths the first type whose url prefixes them
    fn resolve_type(&self, path: &str) -> Result<Option<String>> {
        if path == "/rd" {
            return Ok(self.config.default_type.clone());
        }

        self.config
            .types
            .iter()
            .find(|device_type| path.starts_with(&device_type.url))
            .map(|device_type| Some(device_type.name.clone()))
            .ok_or_else(|| Lwm2mError::TypeNotFound(path.to_string()))
    }

    /// Handle update - `POST /rd/<id>`, then release the device's queued requests
    async fn handle_update(&self, request: &IncomingRequest, id: &str) -> Result<Response> {
        let id = parse_device_id(id)?;
        let params = request.query_params();
        let lifetime = parse_lifetime(&params)?;

        let mut device = self.registry.get(id).await?;
        if let Some(lifetime) = lifetime {
            device.lifetime = lifetime;
        }
        if let Some(binding) = params.get(query_keys::BINDING) {
            device.binding = binding.to_string();
        }
        device.address = request.source.ip();
        device.port = request.source.port();
        device.last_seen = SystemTime::now();
        self.registry.update(id, device.clone()).await?;
        tracing::debug!(device_id = id, address = %request.source, "Registration updated");

        self.notify(|l| l.update.clone(), &device, &request.payload_text());

        // The reply goes out before the queued requests are sent
        let queue = self.queue.clone();
        tokio::spawn(async move {
            let delivered = queue.deliver(id).await;
            if delivered > 0 {
                tracing::info!(device_id = id, delivered, "Queued requests delivered");
            }
        });

        Ok(Response::changed())
    }

    /// Handle de-registration - `DELETE /rd/<id>`
    async fn handle_deregistration(&self, id: &str) -> Result<Response> {
        let id = parse_device_id(id)?;
        let device = self.registry.unregister(id).await?;

        let closed = self.observations.clean_by_device_id(id);
        let discarded = self.queue.discard(id);
        tracing::info!(device_id = id, endpoint = %device.name, closed, discarded, "Device unregistered");

        self.notify(|l| l.deregistration.clone(), &device, "");
        Ok(Response::deleted())
    }
}

fn parse_device_id(id: &str) -> Result<DeviceId> {
    id.parse()
        .map_err(|_| Lwm2mError::DeviceNotFound(id.to_string()))
}

fn parse_lifetime(params: &QueryParams) -> Result<Option<u64>> {
    params
        .get(query_keys::LIFETIME)
        .map(|lt| {
            lt.parse()
                .map_err(|_| Lwm2mError::BadRequest(vec![query_keys::LIFETIME.to_string()]))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap_types::{ContentFormat, ResponseCode};
    use crate::config::{DeviceType, IpProtocol};
    use crate::device_management::DeviceManager;
    use crate::device_setting::SqliteDeviceSetting;
    use crate::registry::InMemoryRegistry;
    use crate::request_builder::RequestBuilder;
    use crate::transport::mock::MockTransport;
    use std::net::SocketAddr;
    use std::time::Duration;

    struct Fixture {
        registry: Arc<InMemoryRegistry>,
        transport: Arc<MockTransport>,
        devices: DeviceManager,
        handler: RequestHandler,
    }

    fn fixture(config: ServerConfig) -> Fixture {
        let registry = Arc::new(InMemoryRegistry::new());
        let transport = Arc::new(MockTransport::new());
        let builder = RequestBuilder::new(IpProtocol::Udp4, 5683, ContentFormat::Text);
        let queue = QueuedRequestManager::new(Duration::from_secs(1));
        let devices = DeviceManager::new(registry.clone(), transport.clone(), builder.clone(), queue.clone());
        let settings = SqliteDeviceSetting::open_in_memory().unwrap();
        settings.put("node-1", "delete /0").unwrap();
        let bootstrap = BootstrapExecutor::new(Arc::new(settings), transport.clone(), builder);
        let handler = RequestHandler::new(
            Arc::new(config),
            registry.clone(),
            queue,
            ObservationManager::new(devices.clone()),
            bootstrap,
        );
        Fixture {
            registry,
            transport,
            devices,
            handler,
        }
    }

    fn source() -> SocketAddr {
        "10.0.0.2:56830".parse().unwrap()
    }

    /// Register a queue-mode device old enough for its requests to be queued
    async fn register_sleepy(f: &Fixture) {
        f.handler
            .handle(&IncomingRequest::new(Method::Post, "/rd?ep=node-1&b=UQ", source()))
            .await;
        let mut device = f.registry.get(1).await.unwrap();
        device.creation_date = SystemTime::now() - Duration::from_secs(10);
        f.registry.update(1, device).await.unwrap();
    }

    #[tokio::test]
    async fn test_register_defaults() {
        let f = fixture(ServerConfig::default());
        let request = IncomingRequest::new(Method::Post, "/rd?ep=node-1&lwm2m=1.0", source())
            .with_payload("</1>,</3/0>");

        let response = f.handler.handle(&request).await;
        assert_eq!(response.code, ResponseCode::Created);
        assert_eq!(response.location(), "rd/1");

        let device = f.registry.get(1).await.unwrap();
        assert_eq!(device.name, "node-1");
        assert_eq!(device.lifetime, DEFAULT_LIFETIME_SECS);
        assert_eq!(device.binding, "U");
        assert_eq!(device.lwm2m_version.as_deref(), Some("1.0"));
        assert_eq!(device.socket_addr(), source());
        assert_eq!(device.path, "/rd");
    }

    #[tokio::test]
    async fn test_register_requires_endpoint() {
        let f = fixture(ServerConfig::default());
        let request = IncomingRequest::new(Method::Post, "/rd?lt=60", source());

        let response = f.handler.handle(&request).await;
        assert_eq!(response.code, ResponseCode::BadRequest);
        assert_eq!(response.payload, b"BAD_REQUEST_ERROR".to_vec());
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_register_resolves_types() {
        let config = ServerConfig {
            base_root: Some("/lwm2m".into()),
            default_type: Some("generic".into()),
            types: vec![DeviceType {
                name: "meter".into(),
                url: "/meters".into(),
            }],
            ..ServerConfig::default()
        };
        let f = fixture(config);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        f.handler.set_registration_listener(move |device, payload| {
            sink.lock()
                .unwrap()
                .push(format!("{}:{:?}:{}", device.name, device.device_type, payload))
        });

        let typed = IncomingRequest::new(Method::Post, "/meters?ep=m1&lt=120&b=UQ", source())
            .with_payload("</1>");
        let response = f.handler.handle(&typed).await;
        assert_eq!(response.location(), "lwm2m/rd/1");
        let device = f.registry.get(1).await.unwrap();
        assert_eq!(device.device_type.as_deref(), Some("meter"));
        assert_eq!(device.lifetime, 120);
        assert!(device.is_queue_mode());

        let default = IncomingRequest::new(Method::Post, "/rd?ep=g1", source());
        f.handler.handle(&default).await;
        assert_eq!(
            f.registry.get(2).await.unwrap().device_type.as_deref(),
            Some("generic")
        );

        let unknown = IncomingRequest::new(Method::Post, "/pumps?ep=p1", source());
        let response = f.handler.handle(&unknown).await;
        assert_eq!(response.code, ResponseCode::NotFound);
        assert_eq!(response.payload, b"TYPE_NOT_FOUND".to_vec());

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "m1:Some(\"meter\"):</1>".to_string(),
                "g1:Some(\"generic\"):".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_update_refreshes_and_delivers() {
        let f = fixture(ServerConfig::default());
        register_sleepy(&f).await;

        let queued = f.devices.read(1, 3, 0, 0).await;
        assert!(matches!(queued, Err(Lwm2mError::RequestInQueue)));
        assert_eq!(f.transport.request_count(), 0);

        let moved: SocketAddr = "10.0.0.9:40000".parse().unwrap();
        let update = IncomingRequest::new(Method::Post, "/rd/1?lt=300", moved);
        let response = f.handler.handle(&update).await;
        assert_eq!(response.code, ResponseCode::Changed);

        let device = f.registry.get(1).await.unwrap();
        assert_eq!(device.lifetime, 300);
        assert_eq!(device.binding, "UQ");
        assert_eq!(device.socket_addr(), moved);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let requests = f.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].proxy_uri.as_deref(), Some("coap://10.0.0.9:40000"));
        assert!(f.devices.queue().pending().is_empty());
    }

    #[tokio::test]
    async fn test_update_unknown_device() {
        let f = fixture(ServerConfig::default());
        for uri in ["/rd/42", "/rd/abc"] {
            let response = f
                .handler
                .handle(&IncomingRequest::new(Method::Post, uri, source()))
                .await;
            assert_eq!(response.code, ResponseCode::NotFound);
            assert_eq!(response.payload, b"DEVICE_NOT_FOUND".to_vec());
        }
    }

    #[tokio::test]
    async fn test_update_rejects_bad_lifetime() {
        let f = fixture(ServerConfig::default());
        f.handler
            .handle(&IncomingRequest::new(Method::Post, "/rd?ep=node-1", source()))
            .await;
        let response = f
            .handler
            .handle(&IncomingRequest::new(Method::Post, "/rd/1?lt=soon", source()))
            .await;
        assert_eq!(response.code, ResponseCode::BadRequest);
        assert_eq!(f.registry.get(1).await.unwrap().lifetime, DEFAULT_LIFETIME_SECS);
    }

    #[tokio::test]
    async fn test_deregistration_discards_queue() {
        let f = fixture(ServerConfig::default());
        register_sleepy(&f).await;
        let _ = f.devices.read(1, 3, 0, 0).await;
        assert_eq!(f.devices.queue().pending_for(1).len(), 1);

        let removed = Arc::new(Mutex::new(None));
        let sink = removed.clone();
        f.handler
            .set_deregistration_listener(move |device, _| *sink.lock().unwrap() = Some(device.id));

        let response = f
            .handler
            .handle(&IncomingRequest::new(Method::Delete, "/rd/1", source()))
            .await;
        assert_eq!(response.code, ResponseCode::Deleted);
        assert!(f.registry.is_empty());
        assert!(f.devices.queue().pending().is_empty());
        assert_eq!(*removed.lock().unwrap(), Some(1));

        let again = f
            .handler
            .handle(&IncomingRequest::new(Method::Delete, "/rd/1", source()))
            .await;
        assert_eq!(again.code, ResponseCode::NotFound);
    }

    #[tokio::test]
    async fn test_bootstrap_route() {
        let f = fixture(ServerConfig::default());
        let response = f
            .handler
            .handle(&IncomingRequest::new(Method::Post, "/bs?ep=node-1", source()))
            .await;
        assert_eq!(response.code, ResponseCode::Changed);

        let missing = f
            .handler
            .handle(&IncomingRequest::new(Method::Post, "/bs", source()))
            .await;
        assert_eq!(missing.code, ResponseCode::BadRequest);
    }

    #[tokio::test]
    async fn test_other_routes_not_found() {
        let f = fixture(ServerConfig::default());
        for (method, uri) in [(Method::Get, "/rd"), (Method::Put, "/rd/1"), (Method::Delete, "/bs")] {
            let response = f
                .handler
                .handle(&IncomingRequest::new(method, uri, source()))
                .await;
            assert_eq!(response.code, ResponseCode::NotFound);
        }
    }

    #[tokio::test]
    async fn test_deep_rd_post_registers_nothing() {
        let f = fixture(ServerConfig::default());
        f.handler
            .handle(&IncomingRequest::new(Method::Post, "/rd?ep=node-1", source()))
            .await;

        let response = f
            .handler
            .handle(&IncomingRequest::new(Method::Post, "/rd/1/extra?ep=node-2", source()))
            .await;
        assert_eq!(response.code, ResponseCode::NotFound);
        assert_eq!(f.registry.len(), 1);
    }
}
