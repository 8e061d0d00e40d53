//! Request building and response classification
//!
//! Device operations and bootstrap steps are sent to the local CoAP proxy
//! (`127.0.0.1` or `::1` on the server port) with a `Proxy-Uri` naming the
//! device. Observe requests go straight to the device.

use crate::codec::{self, Content};
use crate::coap_types::{ContentFormat, Method, Request, Response, ResponseCode};
use crate::config::{IpProtocol, ServerConfig};
use crate::error::{Lwm2mError, Result};
use crate::registry::Device;
use crate::transport::{CoapTransport, Exchange, TransportError};
use crate::types::{Granularity, Operation, ResourcePath};
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Builds addressed CoAP requests for device operations
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    ip_protocol: IpProtocol,
    port: u16,
    write_format: ContentFormat,
}

impl RequestBuilder {
    pub fn new(ip_protocol: IpProtocol, port: u16, write_format: ContentFormat) -> Self {
        Self {
            ip_protocol,
            port,
            write_format,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.ip_protocol, config.port, config.write_format)
    }

    /// Content format used for write payloads
    pub fn write_format(&self) -> ContentFormat {
        self.write_format
    }

    fn via_proxy(&self, method: Method, peer: SocketAddr) -> Request {
        let proxy = SocketAddr::new(self.ip_protocol.proxy_host(), self.port);
        Request::new(method, proxy)
            .with_proxy_uri(self.ip_protocol.device_uri(peer.ip(), peer.port()))
    }

    fn proxied(&self, method: Method, device: &Device, path: &ResourcePath) -> Request {
        self.via_proxy(method, device.socket_addr()).with_path(path)
    }

    /// GET the value at `path`
    pub fn read(&self, device: &Device, path: &ResourcePath) -> Request {
        self.proxied(Method::Get, device, path)
    }

    /// PUT `value` at `path` in the configured write format
    pub fn write(&self, device: &Device, path: &ResourcePath, value: Vec<u8>) -> Request {
        self.proxied(Method::Put, device, path)
            .with_payload(value, self.write_format)
    }

    /// POST to `path` with optional arguments
    pub fn execute(&self, device: &Device, path: &ResourcePath, args: Option<Vec<u8>>) -> Request {
        let request = self.proxied(Method::Post, device, path);
        match args {
            Some(args) => request.with_payload(args, self.write_format),
            None => request,
        }
    }

    /// PUT the attributes as `key=value` query entries
    pub fn write_attributes(
        &self,
        device: &Device,
        path: &ResourcePath,
        attributes: &BTreeMap<String, String>,
    ) -> Request {
        let query = attributes
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        self.proxied(Method::Put, device, path).with_query(query)
    }

    /// GET the link-format description of `path`
    pub fn discover(&self, device: &Device, path: &ResourcePath) -> Request {
        self.proxied(Method::Get, device, path)
            .with_accept(ContentFormat::LinkFormat)
    }

    /// POST a new object instance at `path`
    pub fn create(&self, device: &Device, path: &ResourcePath) -> Request {
        self.proxied(Method::Post, device, path)
    }

    /// GET with the Observe option, addressed to the device itself
    pub fn observe(&self, device: &Device, path: &ResourcePath) -> Request {
        Request::new(Method::Get, device.socket_addr())
            .with_path(path)
            .with_observe()
    }

    /// DELETE `uri` on a device being bootstrapped
    pub fn bootstrap_delete(&self, peer: SocketAddr, uri: &str) -> Request {
        self.via_proxy(Method::Delete, peer).with_uri(uri)
    }

    /// PUT `value` at `uri` on a device being bootstrapped
    pub fn bootstrap_write(&self, peer: SocketAddr, uri: &str, value: &str) -> Request {
        self.via_proxy(Method::Put, peer)
            .with_uri(uri)
            .with_payload(value.as_bytes().to_vec(), self.write_format)
    }

    /// POST `/` closing the bootstrap sequence
    pub fn bootstrap_finish(&self, peer: SocketAddr) -> Request {
        self.via_proxy(Method::Post, peer)
    }
}

/// Send through `transport`, attaching `target` to transport failures
pub async fn send(
    transport: &dyn CoapTransport,
    request: Request,
    target: &str,
) -> Result<Exchange> {
    transport.send(request).await.map_err(|e| match e {
        TransportError::Connection(message) => Lwm2mError::ClientConnection {
            target: target.to_string(),
            message,
        },
        TransportError::Response(message) => Lwm2mError::ClientResponse {
            target: target.to_string(),
            message,
        },
    })
}

/// Classify a device reply
///
/// The expected code decodes the payload; 4.04 becomes `ResourceNotFound` for
/// resource paths and `ObjectNotFound` otherwise; any other code is a
/// `ClientError` carrying it.
pub fn process_response(
    response: &Response,
    expected: ResponseCode,
    operation: &Operation,
) -> Result<Content> {
    if response.code == expected {
        let format = response.content_format.unwrap_or_default();
        return codec::decode(format, &response.payload).map_err(|source| Lwm2mError::Codec {
            target: operation.target(),
            source,
        });
    }

    match response.code {
        ResponseCode::NotFound if operation.path.granularity() == Granularity::Resource => {
            Err(Lwm2mError::ResourceNotFound(operation.path.to_string()))
        }
        ResponseCode::NotFound => Err(Lwm2mError::ObjectNotFound(operation.path.to_string())),
        code => {
            tracing::debug!(%operation, %code, "Unexpected response code");
            Err(Lwm2mError::ClientError(code))
        }
    }
}
