//! rust-lwm2m - server side of the OMA Lightweight M2M protocol
//!
//! This library provides the protocol core of an LWM2M device-management
//! server: TLV/JSON/text/opaque payload decoding, CoAP request building and
//! response classification, queued requests for sleeping (queue-mode) devices,
//! device operations (read, write, execute, write-attributes, discover,
//! create), observations, and bootstrap script replay.
//!
//! # Example
//!
//! ```no_run
//! use rust_lwm2m::{Lwm2mServer, ServerConfig};
//!
//! # async fn run() -> rust_lwm2m::Result<()> {
//! let server = Lwm2mServer::new(ServerConfig::default())?;
//! server.handler().set_registration_listener(|device, _payload| {
//!     println!("registered {} as {}", device.name, device.id);
//! });
//!
//! // Serve registrations, updates and bootstrap requests
//! let listener = server.clone();
//! tokio::spawn(async move { listener.listen("0.0.0.0:5683".parse().unwrap()).await });
//!
//! // Read the manufacturer of device 1
//! let manufacturer = server.devices().read(1, 3, 0, 0).await?;
//! println!("{}", manufacturer.to_json());
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod coap_types;
pub mod codec;
pub mod config;
pub mod device_management;
pub mod device_setting;
mod error;
pub mod handler;
pub mod observation;
pub mod queue;
pub mod registry;
pub mod request_builder;
pub mod server;
pub mod tlv;
pub mod transport;
mod types;

pub use bootstrap::{BootstrapExecutor, BootstrapRun};
pub use codec::{CodecError, Content, ContentData};
pub use config::ServerConfig;
pub use device_management::DeviceManager;
pub use error::{Lwm2mError, Result};
pub use handler::RequestHandler;
pub use observation::{Notification, ObservationManager};
pub use queue::QueuedRequestManager;
pub use registry::{Device, DeviceRegistry, InMemoryRegistry};
pub use request_builder::RequestBuilder;
pub use server::Lwm2mServer;
pub use transport::{CoapTransport, Exchange, ObserveStream, TransportError};
pub use types::{DeviceId, Granularity, Operation, OperationKind, ResourcePath, SubscriptionId};
