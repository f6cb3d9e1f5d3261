//! TCP command server.
//!
//! A single poll loop multiplexes the loopback listener and a bounded set
//! of clients. Complete lines go through the command router; once per tick
//! the broadcast bus is drained and fanned out to every connected client.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use crossbeam_channel::Receiver;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use crate::proto::Router;

const LISTENER: Token = Token(0);
/// Poll cycle granularity
const POLL_TICK: Duration = Duration::from_millis(1);
/// Longest accepted command line (longer input is force-flushed)
const CLIENT_BUF_MAX: usize = 1023;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind 127.0.0.1:{0}: {1}")]
    Bind(u16, #[source] io::Error),
    #[error("poll failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Mirror raw client input back before dispatching it
    pub echo: bool,
    /// Connection limit; further clients are turned away with a message
    pub max_clients: usize,
}

struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

pub struct Server {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    clients: Vec<Client>,
    router: Router,
    broadcast: Receiver<String>,
    echo: bool,
    max_clients: usize,
}

impl Server {
    /// Binds the loopback listener. Binding only to 127.0.0.1 is the whole
    /// access control story; there is no authentication layer.
    pub fn bind(
        config: &ServerConfig,
        router: Router,
        broadcast: Receiver<String>,
    ) -> Result<Self, ServerError> {
        let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
        let mut listener = TcpListener::bind(addr).map_err(|e| ServerError::Bind(config.port, e))?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        log::info!("listening on {}", listener.local_addr()?);
        Ok(Self {
            poll,
            events: Events::with_capacity(64),
            listener,
            clients: Vec::new(),
            router,
            broadcast,
            echo: config.echo,
            max_clients: config.max_clients,
        })
    }

    /// Actual bound address (useful with an ephemeral port).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn run(mut self) -> Result<(), ServerError> {
        loop {
            self.tick()?;
        }
    }

    /// One poll cycle: readiness, then broadcast fan-out.
    pub fn tick(&mut self) -> Result<(), ServerError> {
        match self.poll.poll(&mut self.events, Some(POLL_TICK)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }

        let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
        for token in tokens {
            if token == LISTENER {
                self.accept_clients();
            } else {
                self.service_client(token.0 - 1);
            }
        }

        self.fan_out_broadcasts();
        Ok(())
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    if self.clients.len() >= self.max_clients {
                        log::warn!("client limit reached, turning {} away", addr);
                        let _ = stream.write_all(b"Max amount of connections reached!\n");
                        continue;
                    }
                    let token = Token(self.clients.len() + 1);
                    if let Err(err) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        log::warn!("can't register client {}: {}", addr, err);
                        continue;
                    }
                    log::info!("client {} connected", addr);
                    self.clients.push(Client {
                        stream,
                        buf: Vec::new(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn service_client(&mut self, idx: usize) {
        if idx >= self.clients.len() {
            // the slot was compacted away earlier in this batch
            return;
        }

        let mut closed = false;
        let mut chunk = [0u8; 512];
        loop {
            match self.clients[idx].stream.read(&mut chunk) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => self.clients[idx].buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("client read failed: {}", e);
                    closed = true;
                    break;
                }
            }
        }

        self.drain_client_lines(idx);
        if closed {
            self.remove_client(idx);
        }
    }

    fn drain_client_lines(&mut self, idx: usize) {
        loop {
            match self.clients[idx].buf.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    let line: Vec<u8> = self.clients[idx].buf.drain(..=pos).collect();
                    self.handle_line(idx, &line);
                }
                None => {
                    if self.clients[idx].buf.len() >= CLIENT_BUF_MAX {
                        let line: Vec<u8> = self.clients[idx].buf.drain(..).collect();
                        self.handle_line(idx, &line);
                    }
                    return;
                }
            }
        }
    }

    fn handle_line(&mut self, idx: usize, raw: &[u8]) {
        if self.echo {
            let _ = self.clients[idx].stream.write_all(raw);
        }

        let text = String::from_utf8_lossy(raw);
        if let Some(mut reply) = self.router.process(&text) {
            reply.push('\n');
            if let Err(err) = self.clients[idx].stream.write_all(reply.as_bytes()) {
                log::debug!("client reply write failed: {}", err);
            }
        }
    }

    fn fan_out_broadcasts(&mut self) {
        while let Ok(mut line) = self.broadcast.try_recv() {
            if !line.ends_with('\n') {
                line.push('\n');
            }
            let mut dead = Vec::new();
            for (idx, client) in self.clients.iter_mut().enumerate() {
                if let Err(err) = client.stream.write_all(line.as_bytes()) {
                    if err.kind() == io::ErrorKind::WouldBlock {
                        // slow client, this line is lost for it
                        log::debug!("broadcast dropped for a congested client");
                    } else {
                        dead.push(idx);
                    }
                }
            }
            // compact from the top so earlier indices stay valid
            for idx in dead.into_iter().rev() {
                self.remove_client(idx);
            }
        }
    }

    /// Deletes a client by swapping the last entry into the hole; the moved
    /// client is re-registered under its new token.
    fn remove_client(&mut self, idx: usize) {
        let mut client = self.clients.swap_remove(idx);
        let _ = self.poll.registry().deregister(&mut client.stream);
        log::info!("client disconnected");

        if idx < self.clients.len() {
            if let Err(err) = self.poll.registry().reregister(
                &mut self.clients[idx].stream,
                Token(idx + 1),
                Interest::READABLE,
            ) {
                log::warn!("can't re-register compacted client: {}", err);
            }
        }
    }
}
