//! LWM2M-specific CoAP types and constants
//!
//! This module defines the CoAP surface used by the LWM2M server core.
//! These abstractions keep the library independent of any CoAP implementation;
//! the UDP transport converts them to and from wire packets.

use crate::error::{Lwm2mError, Result};
use crate::types::ResourcePath;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

/// CoAP Content-Format identifiers used by LWM2M
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentFormat {
    /// text/plain (LWM2M plain text)
    #[default]
    Text,
    /// application/link-format (discover replies)
    LinkFormat,
    /// application/octet-stream (LWM2M opaque)
    Opaque,
    /// application/cbor
    Cbor,
    /// application/vnd.oma.lwm2m+tlv
    Tlv,
    /// application/vnd.oma.lwm2m+json
    Json,
}

impl ContentFormat {
    /// Convert from raw content-format ID
    ///
    /// Accepts the legacy LWM2M 1.0 draft numbers (1541-1544) as well.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 | 1541 => Some(Self::Text),
            40 => Some(Self::LinkFormat),
            42 | 1544 => Some(Self::Opaque),
            60 => Some(Self::Cbor),
            11542 | 1542 => Some(Self::Tlv),
            11543 | 1543 => Some(Self::Json),
            _ => None,
        }
    }

    /// Get the raw content-format ID
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Text => 0,
            Self::LinkFormat => 40,
            Self::Opaque => 42,
            Self::Cbor => 60,
            Self::Tlv => 11542,
            Self::Json => 11543,
        }
    }
}

impl std::fmt::Display for ContentFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => f.write_str("text/plain"),
            Self::LinkFormat => f.write_str("application/link-format"),
            Self::Opaque => f.write_str("application/octet-stream"),
            Self::Cbor => f.write_str("application/cbor"),
            Self::Tlv => f.write_str("application/vnd.oma.lwm2m+tlv"),
            Self::Json => f.write_str("application/vnd.oma.lwm2m+json"),
        }
    }
}

/// CoAP request methods used by LWM2M
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Read, discover, observe
    Get,
    /// Write, write-attributes, bootstrap write
    Put,
    /// Execute, create, registration, bootstrap finish
    Post,
    /// Bootstrap delete, deregistration
    Delete,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Put => f.write_str("PUT"),
            Method::Post => f.write_str("POST"),
            Method::Delete => f.write_str("DELETE"),
        }
    }
}

/// CoAP response codes seen by an LWM2M server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    // Success codes
    /// 2.01 Created
    Created,
    /// 2.02 Deleted
    Deleted,
    /// 2.04 Changed
    Changed,
    /// 2.05 Content
    Content,

    // Client error codes
    /// 4.00 Bad Request
    BadRequest,
    /// 4.01 Unauthorized
    Unauthorized,
    /// 4.04 Not Found
    NotFound,
    /// 4.05 Method Not Allowed
    MethodNotAllowed,
    /// 4.06 Not Acceptable
    NotAcceptable,
    /// 4.15 Unsupported Content-Format
    UnsupportedContentFormat,

    // Server error codes
    /// 5.00 Internal Server Error
    InternalServerError,
    /// 5.02 Bad Gateway
    BadGateway,

    /// Any other code, kept raw
    Other(u8, u8),
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (class, detail) = self.to_code_pair();
        write!(f, "{}.{:02}", class, detail)
    }
}

impl ResponseCode {
    /// Convert to CoAP response code format (class.detail)
    pub fn to_code_pair(self) -> (u8, u8) {
        match self {
            Self::Created => (2, 1),
            Self::Deleted => (2, 2),
            Self::Changed => (2, 4),
            Self::Content => (2, 5),
            Self::BadRequest => (4, 0),
            Self::Unauthorized => (4, 1),
            Self::NotFound => (4, 4),
            Self::MethodNotAllowed => (4, 5),
            Self::NotAcceptable => (4, 6),
            Self::UnsupportedContentFormat => (4, 15),
            Self::InternalServerError => (5, 0),
            Self::BadGateway => (5, 2),
            Self::Other(class, detail) => (class, detail),
        }
    }

    /// Convert from a (class, detail) pair
    pub fn from_code_pair(class: u8, detail: u8) -> Self {
        match (class, detail) {
            (2, 1) => Self::Created,
            (2, 2) => Self::Deleted,
            (2, 4) => Self::Changed,
            (2, 5) => Self::Content,
            (4, 0) => Self::BadRequest,
            (4, 1) => Self::Unauthorized,
            (4, 4) => Self::NotFound,
            (4, 5) => Self::MethodNotAllowed,
            (4, 6) => Self::NotAcceptable,
            (4, 15) => Self::UnsupportedContentFormat,
            (5, 0) => Self::InternalServerError,
            (5, 2) => Self::BadGateway,
            (class, detail) => Self::Other(class, detail),
        }
    }

    /// Check if this is a success code
    pub fn is_success(self) -> bool {
        self.to_code_pair().0 == 2
    }
}

/// An outgoing request from the server to a device (transport-agnostic)
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// The request method
    pub method: Method,
    /// Endpoint the datagram is sent to (the local proxy, or the device itself)
    pub destination: SocketAddr,
    /// Proxy-Uri naming the device when the request goes through the proxy
    pub proxy_uri: Option<String>,
    /// Uri-Path segments
    pub path: Vec<String>,
    /// Uri-Query entries (`key=value`)
    pub query: Vec<String>,
    /// Content format of the payload
    pub content_format: Option<ContentFormat>,
    /// Accept option
    pub accept: Option<ContentFormat>,
    /// Observe option (register) set
    pub observe: bool,
    /// Request payload, empty when none
    pub payload: Vec<u8>,
}

impl Request {
    /// Create a new request with no path
    pub fn new(method: Method, destination: SocketAddr) -> Self {
        Self {
            method,
            destination,
            proxy_uri: None,
            path: Vec::new(),
            query: Vec::new(),
            content_format: None,
            accept: None,
            observe: false,
            payload: Vec::new(),
        }
    }

    /// Set the Uri-Path from a resource path
    pub fn with_path(mut self, path: &ResourcePath) -> Self {
        self.path = path.segments();
        self
    }

    /// Set the Uri-Path from a raw uri like `/1/0/2`
    pub fn with_uri(mut self, uri: &str) -> Self {
        self.path = uri
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        self
    }

    /// Route the request through a proxy towards `uri`
    pub fn with_proxy_uri(mut self, uri: String) -> Self {
        self.proxy_uri = Some(uri);
        self
    }

    /// Set the payload
    pub fn with_payload(mut self, payload: Vec<u8>, format: ContentFormat) -> Self {
        self.payload = payload;
        self.content_format = Some(format);
        self
    }

    /// Set query entries
    pub fn with_query(mut self, query: Vec<String>) -> Self {
        self.query = query;
        self
    }

    /// Set the Accept option
    pub fn with_accept(mut self, format: ContentFormat) -> Self {
        self.accept = Some(format);
        self
    }

    /// Set the Observe option
    pub fn with_observe(mut self) -> Self {
        self.observe = true;
        self
    }

    /// Whether the request carries a body
    pub fn has_payload(&self) -> bool {
        !self.payload.is_empty()
    }

    /// The Uri-Path as a single string, `/` for the root
    pub fn uri_path(&self) -> String {
        format!("/{}", self.path.join("/"))
    }
}

/// A CoAP response (transport-agnostic)
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Response code
    pub code: ResponseCode,
    /// Response payload
    pub payload: Vec<u8>,
    /// Content format of the payload
    pub content_format: Option<ContentFormat>,
    /// Observe sequence number, present on Observe replies and notifications
    pub observe: Option<u32>,
    /// Location-Path segments
    pub location_path: Vec<String>,
}

impl Response {
    /// Create an empty response with the given code
    pub fn new(code: ResponseCode) -> Self {
        Self {
            code,
            payload: Vec::new(),
            content_format: None,
            observe: None,
            location_path: Vec::new(),
        }
    }

    /// Create a success response with content
    pub fn content(payload: Vec<u8>, format: ContentFormat) -> Self {
        Self {
            payload,
            content_format: Some(format),
            ..Self::new(ResponseCode::Content)
        }
    }

    /// Create a changed response
    pub fn changed() -> Self {
        Self::new(ResponseCode::Changed)
    }

    /// Create a created response pointing at `location`
    pub fn created(location: &str) -> Self {
        Self {
            location_path: location
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            ..Self::new(ResponseCode::Created)
        }
    }

    /// Create a deleted response
    pub fn deleted() -> Self {
        Self::new(ResponseCode::Deleted)
    }

    /// Create an error response
    pub fn error(code: ResponseCode, message: &str) -> Self {
        Self {
            payload: message.as_bytes().to_vec(),
            ..Self::new(code)
        }
    }

    /// Create the terminal response for a failed exchange
    pub fn from_error(error: &Lwm2mError) -> Self {
        Self::error(error.coap_code(), error.name())
    }

    /// Mark the response as part of an Observe stream
    pub fn with_observe(mut self, sequence: u32) -> Self {
        self.observe = Some(sequence);
        self
    }

    /// Whether the response carries the Observe option
    pub fn is_observe(&self) -> bool {
        self.observe.is_some()
    }

    /// The Location-Path as a single string
    pub fn location(&self) -> String {
        self.location_path.join("/")
    }
}

/// An incoming request from a device to the server
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// The request method
    pub method: Method,
    /// Uri-Path segments
    pub path: Vec<String>,
    /// Uri-Query entries (`key=value`)
    pub query: Vec<String>,
    /// Request payload
    pub payload: Vec<u8>,
    /// Address the request came from
    pub source: SocketAddr,
}

impl IncomingRequest {
    /// Create a new incoming request for `uri` (query part allowed)
    pub fn new(method: Method, uri: &str, source: SocketAddr) -> Self {
        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path, query),
            None => (uri, ""),
        };
        Self {
            method,
            path: path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            query: query
                .split('&')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            payload: Vec::new(),
            source,
        }
    }

    /// Set the payload
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// The Uri-Path as a single string
    pub fn uri_path(&self) -> String {
        format!("/{}", self.path.join("/"))
    }

    /// The payload as UTF-8 text
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Parsed query parameters
    pub fn query_params(&self) -> QueryParams {
        QueryParams::parse(&self.query)
    }
}

/// Query parameters of an incoming request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParams {
    params: HashMap<String, String>,
}

impl QueryParams {
    /// Parse query entries of the form `key=value` (a bare `key` maps to an empty value)
    pub fn parse(entries: &[String]) -> Self {
        let mut params = HashMap::new();
        for entry in entries {
            match entry.split_once('=') {
                Some((key, value)) => params.insert(key.to_string(), value.to_string()),
                None => params.insert(entry.clone(), String::new()),
            };
        }
        Self { params }
    }

    /// Get a parameter value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Fail with `BadRequest` naming every mandatory parameter that is absent
    pub fn check_mandatory(&self, mandatory: &[&str]) -> Result<()> {
        let missing: Vec<String> = mandatory
            .iter()
            .filter(|key| !self.params.contains_key(**key))
            .map(|key| key.to_string())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            tracing::debug!(?missing, "Missing mandatory query parameters");
            Err(Lwm2mError::BadRequest(missing))
        }
    }
}

/// Registration query parameter names
pub mod query_keys {
    /// Endpoint client name (mandatory)
    pub const ENDPOINT: &str = "ep";
    /// Lifetime in seconds
    pub const LIFETIME: &str = "lt";
    /// LWM2M version
    pub const VERSION: &str = "lwm2m";
    /// Binding mode
    pub const BINDING: &str = "b";
}
