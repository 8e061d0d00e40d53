//! LWM2M server context
//!
//! [`Lwm2mServer`] owns the registry, the queued-request table, the
//! subscriptions and the bootstrap executor, and wires them to one transport.
//! [`Lwm2mServer::listen`] serves devices over UDP: requests carrying a
//! `Proxy-Uri` are forwarded to the named device, every other request goes
//! through the [`RequestHandler`].

use crate::bootstrap::BootstrapExecutor;
use crate::coap_types::{Request, Response, ResponseCode};
use crate::config::ServerConfig;
use crate::device_management::DeviceManager;
use crate::device_setting::{self, DeviceSettingStore};
use crate::error::Result;
use crate::handler::RequestHandler;
use crate::observation::ObservationManager;
use crate::queue::QueuedRequestManager;
use crate::registry::InMemoryRegistry;
use crate::request_builder::RequestBuilder;
use crate::transport::udp::{self, MAX_DATAGRAM_SIZE};
use crate::transport::{CoapTransport, Exchange, UdpTransport};
use coap_lite::{MessageClass, Packet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Everything a running LWM2M server needs, shared between its tasks
#[derive(Clone)]
pub struct Lwm2mServer {
    config: Arc<ServerConfig>,
    registry: Arc<InMemoryRegistry>,
    transport: Arc<dyn CoapTransport>,
    devices: DeviceManager,
    observations: ObservationManager,
    bootstrap: BootstrapExecutor,
    handler: RequestHandler,
}

impl Lwm2mServer {
    /// Server talking UDP, with the device-setting backend named in `config`
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(UdpTransport::new(config.ip_protocol, config.request_timeout()));
        let settings = device_setting::from_config(&config.device_setting)?;
        Ok(Self::with_parts(config, transport, settings))
    }

    /// Server over a caller-supplied transport and device-setting store
    pub fn with_parts(
        config: ServerConfig,
        transport: Arc<dyn CoapTransport>,
        settings: Arc<dyn DeviceSettingStore>,
    ) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(InMemoryRegistry::new());
        let builder = RequestBuilder::from_config(&config);
        let queue = QueuedRequestManager::new(config.queue_delay_threshold());

        let devices = DeviceManager::new(
            registry.clone(),
            transport.clone(),
            builder.clone(),
            queue.clone(),
        );
        let observations = ObservationManager::new(devices.clone());
        let bootstrap = BootstrapExecutor::new(settings, transport.clone(), builder);
        let handler = RequestHandler::new(
            config.clone(),
            registry.clone(),
            queue,
            observations.clone(),
            bootstrap.clone(),
        );

        Self {
            config,
            registry,
            transport,
            devices,
            observations,
            bootstrap,
            handler,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<InMemoryRegistry> {
        &self.registry
    }

    /// Read, write, execute, discover and create
    pub fn devices(&self) -> &DeviceManager {
        &self.devices
    }

    pub fn queue(&self) -> &QueuedRequestManager {
        self.devices.queue()
    }

    pub fn observations(&self) -> &ObservationManager {
        &self.observations
    }

    pub fn bootstrap(&self) -> &BootstrapExecutor {
        &self.bootstrap
    }

    pub fn handler(&self) -> &RequestHandler {
        &self.handler
    }

    /// Start dropping registrations whose lifetime has run out
    pub fn start_lifetime_check(&self) {
        self.registry
            .start_lifetime_check(self.config.lifetime_check_interval());
    }

    /// Close every subscription and stop the lifetime check
    pub async fn stop(&self) {
        let closed = self.observations.clean().await;
        tracing::info!(closed, pending = self.queue().pending().len(), "Server stopped");
    }

    /// Bind `addr` and serve until the socket fails
    pub async fn listen(&self, addr: SocketAddr) -> Result<()> {
        let socket = UdpSocket::bind(addr).await?;
        tracing::info!(address = %socket.local_addr()?, "LWM2M server listening");
        self.serve(socket).await
    }

    /// Serve devices on an already bound socket
    pub async fn serve(&self, socket: UdpSocket) -> Result<()> {
        let socket = Arc::new(socket);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let (len, source) = socket.recv_from(&mut buf).await?;
            let packet = match Packet::from_bytes(&buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::debug!(%source, error = ?e, "Ignoring undecodable datagram");
                    continue;
                }
            };
            if !matches!(packet.header.code, MessageClass::Request(_)) {
                continue;
            }

            let server = self.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                let response = server.respond(&packet, source).await;
                let reply = udp::response_to_packet(&packet, &response);
                match reply.to_bytes() {
                    Ok(bytes) => {
                        if let Err(e) = socket.send_to(&bytes, source).await {
                            tracing::warn!(%source, error = %e, "Failed to send response");
                        }
                    }
                    Err(e) => tracing::warn!(%source, error = ?e, "Failed to encode response"),
                }
            });
        }
    }

    async fn respond(&self, packet: &Packet, source: SocketAddr) -> Response {
        if let Some(request) = udp::packet_to_forward(packet) {
            return self.forward(request).await;
        }

        match udp::packet_to_incoming(packet, source) {
            Some(request) => self.handler.handle(&request).await,
            None => Response::new(ResponseCode::MethodNotAllowed),
        }
    }

    /// Relay a proxied request to its device and hand back the device's reply
    async fn forward(&self, request: Request) -> Response {
        let target = request.destination;
        match self.transport.send(request).await {
            Ok(Exchange::Response(response)) => response,
            Ok(Exchange::Observe(mut stream)) => {
                stream.close();
                stream.first.clone()
            }
            Err(e) => {
                tracing::debug!(%target, error = %e, "Proxied request failed");
                Response::error(ResponseCode::BadGateway, &e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap_types::ContentFormat;
    use crate::device_setting::SqliteDeviceSetting;
    use crate::registry::DeviceRegistry;
    use crate::transport::mock::MockTransport;
    use coap_lite::{CoapOption, MessageType, RequestType};

    fn server(transport: Arc<MockTransport>) -> Lwm2mServer {
        let settings = SqliteDeviceSetting::open_in_memory().unwrap();
        Lwm2mServer::with_parts(ServerConfig::default(), transport, Arc::new(settings))
    }

    fn packet(code: RequestType, path: &[&str], query: &[&str]) -> Packet {
        let mut packet = Packet::new();
        packet.header.set_type(MessageType::Confirmable);
        packet.header.code = MessageClass::Request(code);
        packet.header.message_id = 11;
        packet.set_token(vec![0xab]);
        for segment in path {
            packet.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
        }
        for entry in query {
            packet.add_option(CoapOption::UriQuery, entry.as_bytes().to_vec());
        }
        packet
    }

    #[test]
    fn test_new_rejects_reserved_type_url() {
        let config = ServerConfig {
            types: vec![crate::config::DeviceType {
                name: "bad".into(),
                url: "/bs/meters".into(),
            }],
            ..ServerConfig::default()
        };
        assert!(Lwm2mServer::new(config).is_err());
    }

    #[tokio::test]
    async fn test_respond_routes_to_handler() {
        let server = server(Arc::new(MockTransport::new()));
        let source: SocketAddr = "10.0.0.2:56830".parse().unwrap();

        let register = packet(RequestType::Post, &["rd"], &["ep=node-1"]);
        let response = server.respond(&register, source).await;
        assert_eq!(response.code, ResponseCode::Created);
        assert_eq!(server.registry().len(), 1);

        let fetch = packet(RequestType::Fetch, &["rd"], &[]);
        let response = server.respond(&fetch, source).await;
        assert_eq!(response.code, ResponseCode::MethodNotAllowed);
    }

    #[tokio::test]
    async fn test_respond_forwards_proxied_requests() {
        let transport = Arc::new(MockTransport::with_default(Response::content(
            b"42".to_vec(),
            ContentFormat::Text,
        )));
        let server = server(transport.clone());

        let mut proxied = packet(RequestType::Get, &["3", "0", "1"], &[]);
        proxied.add_option(CoapOption::ProxyUri, b"coap://10.0.0.2:56830".to_vec());
        let response = server
            .respond(&proxied, "127.0.0.1:40000".parse().unwrap())
            .await;
        assert_eq!(response.payload, b"42".to_vec());

        let sent = transport.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, "10.0.0.2:56830".parse().unwrap());
        assert_eq!(sent[0].uri_path(), "/3/0/1");
        assert!(sent[0].proxy_uri.is_none());
    }

    #[tokio::test]
    async fn test_proxy_failure_is_bad_gateway() {
        let transport = Arc::new(MockTransport::new());
        transport.push_failure(crate::transport::TransportError::Connection("timeout".into()));
        let server = server(transport);

        let mut proxied = packet(RequestType::Get, &["3"], &[]);
        proxied.add_option(CoapOption::ProxyUri, b"coap://10.0.0.2:56830".to_vec());
        let response = server
            .respond(&proxied, "127.0.0.1:40000".parse().unwrap())
            .await;
        assert_eq!(response.code, ResponseCode::BadGateway);
    }

    #[tokio::test]
    async fn test_serve_answers_over_udp() {
        let server = server(Arc::new(MockTransport::new()));
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let serving = server.clone();
        let task = tokio::spawn(async move { serving.serve(socket).await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let register = packet(RequestType::Post, &["rd"], &["ep=node-1", "lt=60"]);
        client
            .send_to(&register.to_bytes().unwrap(), addr)
            .await
            .unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, _) = tokio::time::timeout(std::time::Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = Packet::from_bytes(&buf[..len]).unwrap();
        assert_eq!(reply.header.get_type(), MessageType::Acknowledgement);
        assert_eq!(reply.header.message_id, 11);

        let response = udp::packet_to_response(&reply).unwrap();
        assert_eq!(response.code, ResponseCode::Created);
        assert_eq!(response.location(), "rd/1");
        assert_eq!(server.registry().get(1).await.unwrap().lifetime, 60);

        task.abort();
    }
}
