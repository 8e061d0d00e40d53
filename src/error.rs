//! Error types for rust-lwm2m

use crate::codec::CodecError;
use crate::coap_types::ResponseCode;
use thiserror::Error;

/// Main error type for LWM2M server operations
#[derive(Debug, Error)]
pub enum Lwm2mError {
    /// No device registered under the given id or endpoint name
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The device answered 4.04 for a resource-level path
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// The device answered 4.04 for an object or instance path
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// No configured device type matches the registration url
    #[error("Type not found for url: {0}")]
    TypeNotFound(String),

    /// A configured type url collides with a reserved prefix
    #[error("Illegal type url: {0}")]
    IllegalTypeUrl(String),

    /// A configuration value outside its allowed range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// writeAttributes received attribute names outside the supported set
    #[error("Unsupported attributes: {}", .0.join(", "))]
    UnsupportedAttributes(Vec<String>),

    /// The device answered with an unexpected CoAP code
    #[error("Client error with code {0}")]
    ClientError(ResponseCode),

    /// The request could not be delivered to the device
    #[error("Connection error towards {target}: {message}")]
    ClientConnection { target: String, message: String },

    /// The device reply broke off or could not be read
    #[error("Response error from {target}: {message}")]
    ClientResponse { target: String, message: String },

    /// The reply payload could not be decoded
    #[error("Codec error in reply from {target}: {source}")]
    Codec {
        target: String,
        #[source]
        source: CodecError,
    },

    /// The operation was queued for a sleeping device (maps to CoAP 2.05)
    #[error("Request in queue")]
    RequestInQueue,

    /// Mandatory query parameters are missing (maps to CoAP 4.00)
    #[error("Missing query params: {}", .0.join(", "))]
    BadRequest(Vec<String>),

    /// The device refused an Observe request
    #[error("Observation failed: {0}")]
    ObservationFailed(String),

    /// No live subscription under the given id
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// A resource path or subscription id could not be parsed or is not valid here
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing/serialization error (configuration)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Device-setting database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl Lwm2mError {
    /// CoAP code that terminates an exchange failing with this error
    pub fn coap_code(&self) -> ResponseCode {
        match self {
            Self::BadRequest(_) | Self::InvalidPath(_) | Self::UnsupportedAttributes(_) => {
                ResponseCode::BadRequest
            }
            Self::DeviceNotFound(_)
            | Self::ResourceNotFound(_)
            | Self::ObjectNotFound(_)
            | Self::TypeNotFound(_)
            | Self::SubscriptionNotFound(_)
            | Self::ObservationFailed(_) => ResponseCode::NotFound,
            Self::RequestInQueue => ResponseCode::Content,
            Self::ClientError(code) => *code,
            _ => ResponseCode::InternalServerError,
        }
    }

    /// Short reason text sent as the payload of an error response
    pub fn name(&self) -> &'static str {
        match self {
            Self::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            Self::ResourceNotFound(_) => "RESOURCE_NOT_FOUND",
            Self::ObjectNotFound(_) => "OBJECT_NOT_FOUND",
            Self::TypeNotFound(_) => "TYPE_NOT_FOUND",
            Self::IllegalTypeUrl(_) => "ILLEGAL_TYPE_URL",
            Self::InvalidConfig(_) => "INVALID_CONFIGURATION",
            Self::UnsupportedAttributes(_) => "UNSUPPORTED_ATTRIBUTES",
            Self::ClientError(_) => "CLIENT_ERROR",
            Self::ClientConnection { .. } => "CLIENT_CONNECTION_ERROR",
            Self::ClientResponse { .. } => "CLIENT_RESPONSE_ERROR",
            Self::Codec { .. } => "CODEC_ERROR",
            Self::RequestInQueue => "REQUEST_IN_QUEUE",
            Self::BadRequest(_) => "BAD_REQUEST_ERROR",
            Self::ObservationFailed(_) => "OBSERVATION_FAILED",
            Self::SubscriptionNotFound(_) => "SUBSCRIPTION_NOT_FOUND",
            Self::InvalidPath(_) => "INVALID_PATH",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Database(_) => "INTERNAL_DB_ERROR",
        }
    }

    /// Whether this is the deferred-success signal of a queued request
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::RequestInQueue)
    }
}

/// Result type alias for LWM2M operations
pub type Result<T> = std::result::Result<T, Lwm2mError>;
