//! CoAP over UDP using coap-lite packets

use super::{CoapTransport, Exchange, ObserveHandle, ObserveStream, TransportError};
use crate::coap_types::{ContentFormat, IncomingRequest, Method, Request, Response, ResponseCode};
use crate::config::IpProtocol;
use async_trait::async_trait;
use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;

/// Largest datagram we expect from a constrained device
pub const MAX_DATAGRAM_SIZE: usize = 1500;

/// Sends each request from a fresh ephemeral socket and waits for the reply
pub struct UdpTransport {
    ip_protocol: IpProtocol,
    timeout: Duration,
    message_id: AtomicU16,
    token: AtomicU32,
}

impl UdpTransport {
    pub fn new(ip_protocol: IpProtocol, timeout: Duration) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        Self {
            ip_protocol,
            timeout,
            message_id: AtomicU16::new(seed as u16),
            token: AtomicU32::new(seed),
        }
    }

    fn next_ids(&self) -> (u16, Vec<u8>) {
        let message_id = self.message_id.fetch_add(1, Ordering::Relaxed);
        let token = self.token.fetch_add(1, Ordering::Relaxed);
        (message_id, token.to_be_bytes().to_vec())
    }

    async fn receive_reply(
        &self,
        socket: &UdpSocket,
        token: &[u8],
        target: SocketAddr,
    ) -> Result<Packet, TransportError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let deadline = tokio::time::Instant::now() + self.timeout;

        loop {
            let (len, peer) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf))
                .await
                .map_err(|_| {
                    TransportError::Connection(format!(
                        "no reply from {} within {:?}",
                        target, self.timeout
                    ))
                })?
                .map_err(|e| TransportError::Connection(e.to_string()))?;

            let packet = match Packet::from_bytes(&buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::debug!(%peer, error = ?e, "Ignoring undecodable datagram");
                    continue;
                }
            };

            // Empty ACK: the reply will follow separately
            if packet.header.code == MessageClass::Empty {
                continue;
            }
            if packet.get_token() != token {
                tracing::debug!(%peer, "Ignoring reply with foreign token");
                continue;
            }

            acknowledge(socket, &packet, peer).await;
            return Ok(packet);
        }
    }
}

#[async_trait]
impl CoapTransport for UdpTransport {
    async fn send(&self, request: Request) -> Result<Exchange, TransportError> {
        let target = request.destination;
        let socket = UdpSocket::bind(SocketAddr::new(self.ip_protocol.unspecified(), 0))
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let (message_id, token) = self.next_ids();
        let bytes = request_to_packet(&request, message_id, token.clone())
            .to_bytes()
            .map_err(|e| TransportError::Connection(format!("{:?}", e)))?;

        tracing::debug!(method = %request.method, path = %request.uri_path(), %target, "Sending CoAP request");
        socket
            .send_to(&bytes, target)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let packet = self.receive_reply(&socket, &token, target).await?;
        let response = packet_to_response(&packet)?;

        if request.observe && response.is_observe() {
            let (stream, handle) = ObserveStream::channel(response);
            tokio::spawn(pump_notifications(socket, token, handle));
            Ok(Exchange::Observe(stream))
        } else {
            Ok(Exchange::Response(response))
        }
    }
}

/// Forward notifications for `token` until the consumer closes the stream
async fn pump_notifications(socket: UdpSocket, token: Vec<u8>, mut handle: ObserveHandle) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            _ = &mut handle.closed => break,
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::warn!(error = %e, "Observe socket failed");
                        break;
                    }
                };
                let Ok(packet) = Packet::from_bytes(&buf[..len]) else {
                    continue;
                };
                if packet.get_token() != token.as_slice() {
                    continue;
                }
                acknowledge(&socket, &packet, peer).await;
                match packet_to_response(&packet) {
                    Ok(response) => {
                        if handle.notifications.send(response).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::debug!(error = %e, "Dropping malformed notification"),
                }
            }
        }
    }
    tracing::debug!("Observe stream closed");
}

async fn acknowledge(socket: &UdpSocket, packet: &Packet, peer: SocketAddr) {
    if packet.header.get_type() != MessageType::Confirmable {
        return;
    }
    let mut ack = Packet::new();
    ack.header.set_type(MessageType::Acknowledgement);
    ack.header.message_id = packet.header.message_id;
    ack.header.code = MessageClass::Empty;
    if let Ok(bytes) = ack.to_bytes() {
        let _ = socket.send_to(&bytes, peer).await;
    }
}

/// Encode a CoAP unsigned integer option value (minimal big-endian bytes)
pub(crate) fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

pub(crate) fn decode_uint(bytes: &[u8]) -> u32 {
    bytes.iter().take(4).fold(0u32, |acc, b| (acc << 8) | *b as u32)
}

fn first_option(packet: &Packet, option: CoapOption) -> Option<&Vec<u8>> {
    packet.get_option(option).and_then(|values| values.front())
}

fn all_options(packet: &Packet, option: CoapOption) -> Vec<String> {
    packet
        .get_option(option)
        .map(|values| {
            values
                .iter()
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .collect()
        })
        .unwrap_or_default()
}

fn request_type(method: Method) -> RequestType {
    match method {
        Method::Get => RequestType::Get,
        Method::Put => RequestType::Put,
        Method::Post => RequestType::Post,
        Method::Delete => RequestType::Delete,
    }
}

/// Build a confirmable packet for an outgoing request
pub(crate) fn request_to_packet(request: &Request, message_id: u16, token: Vec<u8>) -> Packet {
    let mut packet = Packet::new();
    packet.header.message_id = message_id;
    packet.header.code = MessageClass::Request(request_type(request.method));
    packet.header.set_type(MessageType::Confirmable);
    packet.set_token(token);

    if request.observe {
        packet.add_option(CoapOption::Observe, encode_uint(0));
    }
    for segment in &request.path {
        packet.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
    }
    if let Some(format) = request.content_format {
        packet.add_option(CoapOption::ContentFormat, encode_uint(format.as_u16() as u32));
    }
    for query in &request.query {
        packet.add_option(CoapOption::UriQuery, query.as_bytes().to_vec());
    }
    if let Some(accept) = request.accept {
        packet.add_option(CoapOption::Accept, encode_uint(accept.as_u16() as u32));
    }
    if let Some(proxy_uri) = &request.proxy_uri {
        packet.add_option(CoapOption::ProxyUri, proxy_uri.as_bytes().to_vec());
    }
    packet.payload = request.payload.clone();
    packet
}

/// Read a device reply
pub(crate) fn packet_to_response(packet: &Packet) -> Result<Response, TransportError> {
    let code = u8::from(packet.header.code);
    let (class, detail) = (code >> 5, code & 0x1f);
    if class < 2 {
        return Err(TransportError::Response(format!(
            "expected a response code, got {}.{:02}",
            class, detail
        )));
    }

    Ok(Response {
        code: ResponseCode::from_code_pair(class, detail),
        payload: packet.payload.clone(),
        content_format: first_option(packet, CoapOption::ContentFormat)
            .and_then(|v| ContentFormat::from_u16(decode_uint(v) as u16)),
        observe: first_option(packet, CoapOption::Observe).map(|v| decode_uint(v)),
        location_path: all_options(packet, CoapOption::LocationPath),
    })
}

/// Read a request sent by a device to the server, `None` for methods we do not serve
pub(crate) fn packet_to_incoming(packet: &Packet, source: SocketAddr) -> Option<IncomingRequest> {
    let method = match packet.header.code {
        MessageClass::Request(RequestType::Get) => Method::Get,
        MessageClass::Request(RequestType::Put) => Method::Put,
        MessageClass::Request(RequestType::Post) => Method::Post,
        MessageClass::Request(RequestType::Delete) => Method::Delete,
        _ => return None,
    };

    Some(IncomingRequest {
        method,
        path: all_options(packet, CoapOption::UriPath),
        query: all_options(packet, CoapOption::UriQuery),
        payload: packet.payload.clone(),
        source,
    })
}

/// Target of a `Proxy-Uri` of the form `coap://host:port[/...]`
pub(crate) fn proxy_target(uri: &str) -> Option<SocketAddr> {
    let authority = uri.strip_prefix("coap://")?;
    let authority = authority.split('/').next()?;
    authority.parse().ok()
}

/// The request to forward when `packet` asks the server to act as a proxy
pub(crate) fn packet_to_forward(packet: &Packet) -> Option<Request> {
    let proxy_uri = first_option(packet, CoapOption::ProxyUri)?;
    let destination = proxy_target(&String::from_utf8_lossy(proxy_uri))?;
    let incoming = packet_to_incoming(packet, destination)?;

    let mut request = Request::new(incoming.method, destination);
    request.path = incoming.path;
    request.query = incoming.query;
    request.payload = incoming.payload;
    request.content_format = first_option(packet, CoapOption::ContentFormat)
        .and_then(|v| ContentFormat::from_u16(decode_uint(v) as u16));
    request.accept = first_option(packet, CoapOption::Accept)
        .and_then(|v| ContentFormat::from_u16(decode_uint(v) as u16));
    Some(request)
}

/// Piggy-back `response` on the acknowledgement of `request`
pub(crate) fn response_to_packet(request: &Packet, response: &Response) -> Packet {
    let mut packet = Packet::new();
    let message_type = if request.header.get_type() == MessageType::Confirmable {
        MessageType::Acknowledgement
    } else {
        MessageType::NonConfirmable
    };
    packet.header.set_type(message_type);
    packet.header.message_id = request.header.message_id;
    let (class, detail) = response.code.to_code_pair();
    packet.header.code = MessageClass::from((class << 5) | (detail & 0x1f));
    packet.set_token(request.get_token().to_vec());

    if let Some(sequence) = response.observe {
        packet.add_option(CoapOption::Observe, encode_uint(sequence));
    }
    for segment in &response.location_path {
        packet.add_option(CoapOption::LocationPath, segment.as_bytes().to_vec());
    }
    if let Some(format) = response.content_format {
        packet.add_option(CoapOption::ContentFormat, encode_uint(format.as_u16() as u32));
    }
    packet.payload = response.payload.clone();
    packet
}
