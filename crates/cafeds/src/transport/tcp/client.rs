// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Follower-side connection to the current leader.
//!
//! A follower holds exactly one of these for its lifetime and re-targets it
//! across leader changes. Connection loss only clears the connected flag;
//! the discovery loop decides when and where to reconnect.

use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::config;
use crate::proto::Message;
use crate::transport::tcp::stream;
use crate::{Error, Result};

/// Callback invoked for every record the leader sends down the link.
pub type LinkHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// The follower's single TCP connection toward the leader.
pub struct LeaderLink {
    stream: Mutex<Option<TcpStream>>,
    connected: Arc<AtomicBool>,
    /// Bumped on every successful connect. A reader thread belonging to an
    /// older generation must not clear the flag of a newer connection.
    generation: Arc<AtomicU64>,
}

impl Default for LeaderLink {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaderLink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stream: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Connect to the leader with the configured timeout and start the reader
    /// thread. Returns false on failure; the caller retries on its own
    /// schedule.
    pub fn connect(&self, ip: IpAddr, port: u16, on_msg: LinkHandler) -> bool {
        let addr = SocketAddr::new(ip, port);
        let stream = match TcpStream::connect_timeout(&addr, config::TCP_CONNECT_TIMEOUT) {
            Ok(stream) => stream,
            Err(err) => {
                log::info!("[tcp-client] connect to {} failed: {}", addr, err);
                return false;
            }
        };
        let _ = stream.set_nodelay(true);
        let reader = match stream.try_clone() {
            Ok(reader) => reader,
            Err(err) => {
                log::info!("[tcp-client] clone for {} failed: {}", addr, err);
                return false;
            }
        };

        // Tear down any previous connection before installing the new one.
        self.close();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.stream.lock() = Some(stream);
        self.connected.store(true, Ordering::Relaxed);

        let connected = Arc::clone(&self.connected);
        let generations = Arc::clone(&self.generation);
        thread::spawn(move || {
            stream::read_messages(reader, |msg| on_msg(msg));
            if generations.load(Ordering::SeqCst) == generation {
                connected.store(false, Ordering::Relaxed);
                log::info!("[tcp-client] link to {} lost", addr);
            }
        });

        log::info!("[tcp-client] connected to leader {}", addr);
        true
    }

    /// Send one record to the leader.
    pub fn send(&self, msg: &Message) -> Result<()> {
        let mut guard = self.stream.lock();
        let Some(stream) = guard.as_mut() else {
            return Err(Error::NotConnected);
        };
        match stream::write_message(stream, msg) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.connected.store(false, Ordering::Relaxed);
                Err(Error::from(err))
            }
        }
    }

    /// Drop the connection. The reader thread notices via the shutdown.
    pub fn close(&self) {
        self.connected.store(false, Ordering::Relaxed);
        if let Some(stream) = self.stream.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for LeaderLink {
    fn drop(&mut self) {
        self.close();
    }
}
