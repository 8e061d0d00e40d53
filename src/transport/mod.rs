//! CoAP transport seam
//!
//! The protocol core talks to devices through [`CoapTransport`]. A send either
//! completes with a single reply or, when the reply carries the Observe option,
//! opens an [`ObserveStream`] whose later notifications arrive on a channel.

pub mod udp;

#[cfg(test)]
pub(crate) mod mock;

use crate::coap_types::{Request, Response};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub use udp::UdpTransport;

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request could not be sent or no reply arrived
    #[error("connection failed: {0}")]
    Connection(String),

    /// A reply arrived but could not be read
    #[error("malformed response: {0}")]
    Response(String),
}

/// Outcome of sending a request
#[derive(Debug)]
pub enum Exchange {
    /// Plain request/response
    Response(Response),
    /// Reply carrying the Observe option, followed by notifications
    Observe(ObserveStream),
}

impl Exchange {
    /// The (first) reply
    pub fn response(&self) -> &Response {
        match self {
            Self::Response(response) => response,
            Self::Observe(stream) => &stream.first,
        }
    }
}

/// Consumer side of an Observe relationship
#[derive(Debug)]
pub struct ObserveStream {
    /// Reply that acknowledged the subscription, carrying the current value
    pub first: Response,
    notifications: mpsc::UnboundedReceiver<Response>,
    close: Option<oneshot::Sender<()>>,
}

/// Producer side of an Observe relationship, held by the transport
#[derive(Debug)]
pub struct ObserveHandle {
    /// Where notifications are pushed
    pub notifications: mpsc::UnboundedSender<Response>,
    /// Resolves once the consumer closes (or drops) the stream
    pub closed: oneshot::Receiver<()>,
}

impl ObserveStream {
    /// Create a stream acknowledged by `first` together with its producer handle
    pub fn channel(first: Response) -> (Self, ObserveHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        (
            Self {
                first,
                notifications: rx,
                close: Some(close_tx),
            },
            ObserveHandle {
                notifications: tx,
                closed: close_rx,
            },
        )
    }

    /// Next notification, `None` once the peer side finished
    pub async fn next(&mut self) -> Option<Response> {
        self.notifications.recv().await
    }

    /// Ask the transport to stop the stream; only the first call has an effect
    pub fn close(&mut self) {
        if let Some(close) = self.close.take() {
            let _ = close.send(());
        }
    }

    /// Split into the first reply, the notification receiver and the close signal
    pub fn into_parts(
        self,
    ) -> (
        Response,
        mpsc::UnboundedReceiver<Response>,
        Option<oneshot::Sender<()>>,
    ) {
        (self.first, self.notifications, self.close)
    }
}

/// Sends CoAP requests to devices
#[async_trait]
pub trait CoapTransport: Send + Sync {
    /// Send `request` and wait for the reply
    async fn send(&self, request: Request) -> Result<Exchange, TransportError>;
}
