// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Byte streams the device protocols run over.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use rustls::{ClientConfig, ClientConnection, StreamOwned};

use printline_security::server_name;

/// TLS over TCP, as spoken by the printer.
pub type TlsStream = StreamOwned<ClientConnection, TcpStream>;

/// A blocking stream with a read deadline and an orderly close.
pub trait Wire: Read + Write {
    /// Bound how long the next read may block.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Announce the end of the stream and flush it.
    fn close(&mut self) -> io::Result<()>;
}

impl Wire for TlsStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.sock.set_read_timeout(timeout)
    }

    fn close(&mut self) -> io::Result<()> {
        self.conn.send_close_notify();
        self.flush()
    }
}

/// Connect to `addr` within `timeout` and set up TLS against it.  The
/// handshake itself runs on first use.
pub fn connect_tls(addr: SocketAddr, tls: Arc<ClientConfig>, timeout: Duration) -> io::Result<TlsStream> {
    let sock = TcpStream::connect_timeout(&addr, timeout)?;
    sock.set_read_timeout(Some(timeout))?;
    sock.set_write_timeout(Some(timeout))?;
    let conn = ClientConnection::new(tls, server_name(addr.ip())).map_err(io::Error::other)?;
    Ok(StreamOwned::new(conn, sock))
}
