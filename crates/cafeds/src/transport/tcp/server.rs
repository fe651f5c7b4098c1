// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Leader-side TCP server.
//!
//! One accept loop, one reader thread per client, one send mutex per
//! connection. The send mutex is required because fan-out and resend replies
//! can write the same connection from different threads; sends are never
//! serialized across connections.

use std::io;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::config;
use crate::proto::Message;
use crate::transport::tcp::stream;

/// Callback invoked for every record a client sends.
pub type ServerHandler = Arc<dyn Fn(&Arc<ClientConn>, Message) + Send + Sync>;

/// One accepted client connection. Writes go through the internal mutex so
/// concurrent senders interleave whole records, never bytes.
pub struct ClientConn {
    peer: SocketAddr,
    stream: Mutex<TcpStream>,
}

impl ClientConn {
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send one record to this client.
    pub fn send(&self, msg: &Message) -> io::Result<()> {
        let mut stream = self.stream.lock();
        stream::write_message(&mut stream, msg)
    }

    fn close(&self) {
        let stream = self.stream.lock();
        let _ = stream.shutdown(Shutdown::Both);
    }
}

/// Accepting server the leader runs on its operator-assigned TCP port.
pub struct OrderServer {
    clients: Arc<Mutex<Vec<Arc<ClientConn>>>>,
    shutdown: Arc<AtomicBool>,
    accept_handle: Option<JoinHandle<()>>,
    port: u16,
}

impl OrderServer {
    /// Bind the port and start accepting. `handler` runs on the per-client
    /// reader threads.
    pub fn start(port: u16, handler: ServerHandler) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))?;
        // Non-blocking accept lets the loop poll the shutdown flag.
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();

        let clients: Arc<Mutex<Vec<Arc<ClientConn>>>> = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept_clients = Arc::clone(&clients);
        let accept_shutdown = Arc::clone(&shutdown);
        let accept_handle = thread::spawn(move || {
            accept_loop(&listener, &accept_clients, &accept_shutdown, &handler);
        });

        log::info!("[tcp-server] listening on 0.0.0.0:{}", port);
        Ok(Self {
            clients,
            shutdown,
            accept_handle: Some(accept_handle),
            port,
        })
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Best-effort fan-out of one record to every live client. A failed send
    /// is left for that client's reader thread to notice and clean up.
    pub fn broadcast(&self, msg: &Message) {
        let targets: Vec<Arc<ClientConn>> = self.clients.lock().clone();
        for client in targets {
            if let Err(err) = client.send(msg) {
                log::debug!("[tcp-server] broadcast to {} failed: {}", client.peer(), err);
            }
        }
    }

    /// Stop accepting and disconnect every client.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let targets: Vec<Arc<ClientConn>> = {
            let mut clients = self.clients.lock();
            clients.drain(..).collect()
        };
        for client in &targets {
            client.close();
        }
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
        log::info!("[tcp-server] stopped (port {})", self.port);
    }
}

impl Drop for OrderServer {
    fn drop(&mut self) {
        if !self.shutdown.load(Ordering::Relaxed) {
            self.stop();
        }
    }
}

fn accept_loop(
    listener: &TcpListener,
    clients: &Arc<Mutex<Vec<Arc<ClientConn>>>>,
    shutdown: &Arc<AtomicBool>,
    handler: &ServerHandler,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = spawn_client(stream, peer, clients, shutdown, handler) {
                    log::debug!("[tcp-server] client setup for {} failed: {}", peer, err);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(config::STOP_POLL_INTERVAL);
            }
            Err(err) => {
                log::debug!("[tcp-server] accept failed: {}", err);
                thread::sleep(config::STOP_POLL_INTERVAL);
            }
        }
    }
}

fn spawn_client(
    stream: TcpStream,
    peer: SocketAddr,
    clients: &Arc<Mutex<Vec<Arc<ClientConn>>>>,
    shutdown: &Arc<AtomicBool>,
    handler: &ServerHandler,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let reader = stream.try_clone()?;

    let conn = Arc::new(ClientConn {
        peer,
        stream: Mutex::new(stream),
    });
    clients.lock().push(Arc::clone(&conn));
    log::info!("[tcp-server] client connected: {}", peer);

    let reader_clients = Arc::clone(clients);
    let reader_shutdown = Arc::clone(shutdown);
    let reader_handler = Arc::clone(handler);
    thread::spawn(move || {
        stream::read_messages(reader, |msg| reader_handler(&conn, msg));
        reader_clients.lock().retain(|c| !Arc::ptr_eq(c, &conn));
        conn.close();
        if !reader_shutdown.load(Ordering::Relaxed) {
            log::info!("[tcp-server] client disconnected: {}", peer);
        }
    });
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
