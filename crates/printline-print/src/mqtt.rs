// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Minimal MQTT 3.1.1 client over TLS.
//
// Only what the printer's control channel needs: CONNECT with username and
// password, one SUBSCRIBE at QoS 0, QoS 0 PUBLISH in both directions, and
// DISCONNECT.  Incoming bytes are buffered until a whole packet is present,
// so a read timeout in the middle of a packet loses nothing.  The session is
// generic over its stream; the printer's is TLS over TCP.

use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::ClientConfig;
use tracing::{debug, info, instrument, trace, warn};

use printline_core::error::{PrintlineError, Result};

use crate::control::{ControlChannel, Message};
use crate::wire::{TlsStream, Wire, connect_tls};

// Fixed-header packet types (high nibble, with required flag bits).
const CONNECT: u8 = 0x10;
const CONNACK: u8 = 0x20;
const PUBLISH: u8 = 0x30;
const SUBSCRIBE: u8 = 0x82;
const SUBACK: u8 = 0x90;
const PINGRESP: u8 = 0xD0;

/// Keep-alive advertised in CONNECT, in seconds.
pub const KEEP_ALIVE_SECS: u16 = 60;

/// `PINGREQ`, no variable header or payload.
pub const PINGREQ: [u8; 2] = [0xC0, 0x00];

/// `DISCONNECT`, no variable header or payload.
pub const DISCONNECT: [u8; 2] = [0xE0, 0x00];

/// Largest value the four-byte remaining-length field can carry.
const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// A decoded packet from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ConnAck { session_present: bool, return_code: u8 },
    Publish { topic: String, payload: Vec<u8> },
    SubAck { packet_id: u16, return_codes: Vec<u8> },
    PingResp,
    /// Anything else, by first header byte.
    Other(u8),
}

/// Human-readable CONNACK refusal reason.
pub fn connack_reason(code: u8) -> &'static str {
    match code {
        0 => "accepted",
        1 => "unacceptable protocol version",
        2 => "identifier rejected",
        3 => "server unavailable",
        4 => "bad user name or password",
        5 => "not authorized",
        _ => "unknown return code",
    }
}

fn put_remaining_length(out: &mut Vec<u8>, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_bytes(out, s.as_bytes());
}

fn put_bytes(out: &mut Vec<u8>, b: &[u8]) {
    // MQTT strings are u16-prefixed; longer inputs are a caller bug.
    let len = b.len().min(usize::from(u16::MAX));
    out.extend_from_slice(&(len as u16).to_be_bytes());
    out.extend_from_slice(&b[..len]);
}

fn frame(header: u8, body: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(header);
    put_remaining_length(&mut out, body.len());
    out.extend(body);
    out
}

/// CONNECT with clean session, username and password.
pub fn encode_connect(client_id: &str, username: &str, password: &str, keep_alive: u16) -> Vec<u8> {
    let mut body = Vec::new();
    put_str(&mut body, "MQTT");
    body.push(0x04); // protocol level 3.1.1
    body.push(0xC2); // username | password | clean session
    body.extend_from_slice(&keep_alive.to_be_bytes());
    put_str(&mut body, client_id);
    put_str(&mut body, username);
    put_bytes(&mut body, password.as_bytes());
    frame(CONNECT, body)
}

/// SUBSCRIBE to a single topic filter at QoS 0.
pub fn encode_subscribe(packet_id: u16, topic: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&packet_id.to_be_bytes());
    put_str(&mut body, topic);
    body.push(0x00);
    frame(SUBSCRIBE, body)
}

/// QoS 0 PUBLISH; no packet identifier.
pub fn encode_publish(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(topic.len() + payload.len() + 2);
    put_str(&mut body, topic);
    body.extend_from_slice(payload);
    frame(PUBLISH, body)
}

/// Decode one packet from the front of `buf`.
///
/// Returns `Ok(None)` while the packet is incomplete, otherwise the packet
/// and the number of bytes it occupied.
pub fn decode(buf: &[u8]) -> Result<Option<(Packet, usize)>> {
    let Some(&header) = buf.first() else {
        return Ok(None);
    };

    let mut len = 0usize;
    let mut multiplier = 1usize;
    let mut pos = 1;
    loop {
        let Some(&byte) = buf.get(pos) else {
            return Ok(None);
        };
        len += usize::from(byte & 0x7F) * multiplier;
        pos += 1;
        if byte & 0x80 == 0 {
            break;
        }
        multiplier *= 128;
        if pos > 4 {
            return Err(PrintlineError::Protocol(
                "MQTT remaining length exceeds four bytes".into(),
            ));
        }
    }
    if len > MAX_REMAINING_LENGTH {
        return Err(PrintlineError::Protocol("MQTT packet too large".into()));
    }

    let end = pos + len;
    if buf.len() < end {
        return Ok(None);
    }
    let body = &buf[pos..end];

    let packet = match header & 0xF0 {
        CONNACK => {
            let &[flags, code] = body else {
                return Err(PrintlineError::Protocol("malformed CONNACK".into()));
            };
            Packet::ConnAck {
                session_present: flags & 0x01 != 0,
                return_code: code,
            }
        }
        PUBLISH => {
            let qos = (header >> 1) & 0x03;
            let topic_len = body
                .get(..2)
                .map(|b| usize::from(u16::from_be_bytes([b[0], b[1]])))
                .ok_or_else(|| PrintlineError::Protocol("truncated PUBLISH topic".into()))?;
            let mut at = 2 + topic_len;
            let topic = body
                .get(2..at)
                .and_then(|t| std::str::from_utf8(t).ok())
                .ok_or_else(|| PrintlineError::Protocol("invalid PUBLISH topic".into()))?
                .to_owned();
            if qos > 0 {
                at += 2;
            }
            let payload = body
                .get(at..)
                .ok_or_else(|| PrintlineError::Protocol("truncated PUBLISH".into()))?
                .to_vec();
            Packet::Publish { topic, payload }
        }
        SUBACK => {
            if body.len() < 2 {
                return Err(PrintlineError::Protocol("malformed SUBACK".into()));
            }
            Packet::SubAck {
                packet_id: u16::from_be_bytes([body[0], body[1]]),
                return_codes: body[2..].to_vec(),
            }
        }
        PINGRESP => Packet::PingResp,
        _ => Packet::Other(header),
    };
    Ok(Some((packet, end)))
}

/// A connected, authenticated MQTT session.
pub struct MqttSession<S: Wire = TlsStream> {
    stream: S,
    inbox: Vec<u8>,
    next_packet_id: u16,
    last_sent: Instant,
    ping_after: Duration,
}

impl MqttSession {
    /// Connect, complete TLS, send CONNECT, and wait for an accepting CONNACK.
    #[instrument(skip(password, tls))]
    pub fn connect(
        ip: IpAddr,
        port: u16,
        client_id: &str,
        username: &str,
        password: &str,
        tls: Arc<ClientConfig>,
        timeout: Duration,
    ) -> Result<Self> {
        let addr = SocketAddr::new(ip, port);
        let stream = connect_tls(addr, tls, timeout)
            .map_err(|e| PrintlineError::Control(format!("MQTT connect to {addr}: {e}")))?;
        let session = Self::over(stream, client_id, username, password, timeout)?;
        info!(%addr, "MQTT session authenticated");
        Ok(session)
    }
}

impl<S: Wire> MqttSession<S> {
    /// Send CONNECT on an open stream and wait up to `timeout` for an
    /// accepting CONNACK.
    pub fn over(stream: S, client_id: &str, username: &str, password: &str, timeout: Duration) -> Result<Self> {
        let mut session = Self {
            stream,
            inbox: Vec::new(),
            next_packet_id: 1,
            last_sent: Instant::now(),
            ping_after: Duration::from_secs(u64::from(KEEP_ALIVE_SECS) / 2),
        };

        session.send(&encode_connect(client_id, username, password, KEEP_ALIVE_SECS))?;
        match session.next_packet(timeout)? {
            Some(Packet::ConnAck { return_code: 0, .. }) => Ok(session),
            Some(Packet::ConnAck { return_code, .. }) => Err(PrintlineError::Control(format!(
                "MQTT connection refused: {}",
                connack_reason(return_code)
            ))),
            Some(other) => Err(PrintlineError::Protocol(format!(
                "expected CONNACK, got {other:?}"
            ))),
            None => Err(PrintlineError::Control(format!(
                "no CONNACK within {}s",
                timeout.as_secs()
            ))),
        }
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream
            .write_all(bytes)
            .and_then(|()| self.stream.flush())
            .map_err(|e| PrintlineError::Control(format!("MQTT send: {e}")))?;
        self.last_sent = Instant::now();
        Ok(())
    }

    /// Keep the broker from dropping us during long receive windows.
    fn ping_if_idle(&mut self) -> Result<()> {
        if self.last_sent.elapsed() >= self.ping_after {
            trace!("sending PINGREQ");
            self.send(&PINGREQ)?;
        }
        Ok(())
    }

    /// Next whole packet, or `None` once `timeout` passes without one.
    fn next_packet(&mut self, timeout: Duration) -> Result<Option<Packet>> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 4096];
        loop {
            if let Some((packet, used)) = decode(&self.inbox)? {
                self.inbox.drain(..used);
                return Ok(Some(packet));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.stream.set_read_timeout(Some(remaining))?;
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(PrintlineError::Control("MQTT broker closed the connection".into()));
                }
                Ok(n) => self.inbox.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None);
                }
                Err(e) => return Err(PrintlineError::Control(format!("MQTT receive: {e}"))),
            }
        }
    }
}

impl<S: Wire> ControlChannel for MqttSession<S> {
    fn subscribe(&mut self, topic: &str) -> Result<()> {
        let packet_id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
        self.send(&encode_subscribe(packet_id, topic))?;

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.next_packet(remaining)? {
                Some(Packet::SubAck { packet_id: id, return_codes }) if id == packet_id => {
                    if return_codes.contains(&0x80) {
                        return Err(PrintlineError::Control(format!(
                            "subscription to {topic} refused"
                        )));
                    }
                    debug!(topic, "subscribed");
                    return Ok(());
                }
                Some(other) => trace!(?other, "ignoring packet while awaiting SUBACK"),
                None => {
                    return Err(PrintlineError::Control(format!(
                        "no SUBACK for {topic}"
                    )));
                }
            }
        }
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
        debug!(topic, bytes = payload.len(), "publishing");
        self.send(&encode_publish(topic, payload))
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Message>> {
        let deadline = Instant::now() + timeout;
        loop {
            self.ping_if_idle()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.next_packet(remaining.min(Duration::from_secs(5)))? {
                Some(Packet::Publish { topic, payload }) => {
                    return Ok(Some(Message { topic, payload }));
                }
                Some(other) => trace!(?other, "ignoring control packet"),
                None if Instant::now() >= deadline => return Ok(None),
                None => {}
            }
        }
    }

    fn disconnect(&mut self) {
        if let Err(e) = self.send(&DISCONNECT) {
            warn!(error = %e, "MQTT disconnect failed");
        }
        let _ = self.stream.close();
    }
}
