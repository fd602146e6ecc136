use std::net::SocketAddr;
use std::sync::Arc;

use mio::event::Event;
use mio::net::{TcpListener, UdpSocket};
use mio::{Events, Interest, Poll, Token, Waker};
use profiler_symbols::MetadataCache;
use rustc_hash::FxHashMap;

use crate::dispatcher::Apartment;
use crate::error::{Error, Result};
use crate::session::Session;

const LISTENER: Token = Token(0);
const SHUTDOWN: Token = Token(1);
const WAKE: Token = Token(2);
const FIRST_SESSION: usize = 3;

/// A zero id sent on the shutdown socket tells the loop to stop; any other
/// value is reserved for a future per-session disconnect request, mirroring
/// the scalar-over-aux-socket idiom the collector side uses to ask the loop
/// to drop a single session without tearing down the whole server.
const SHUTDOWN_SCALAR: u64 = 0;

/// The `mio::Poll` accept loop: one listener, one loopback socket used to
/// wake the loop for shutdown, a `Waker` the apartment thread pings when it
/// has responses ready, and one `Session` per accepted connection. This
/// thread never touches the store or resolver directly — it only decodes
/// frames and feeds/drains the [`Apartment`]'s queues.
pub struct Server {
    poll: Poll,
    listener: TcpListener,
    shutdown_rx: UdpSocket,
    shutdown_addr: SocketAddr,
    sessions: FxHashMap<Token, Session>,
    next_token: usize,
    apartment: Apartment,
}

impl Server {
    pub fn bind(addr: SocketAddr, cache: Option<Arc<dyn MetadataCache>>) -> Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let mut shutdown_rx = UdpSocket::bind("127.0.0.1:0".parse().unwrap())?;
        let shutdown_addr = shutdown_rx.local_addr()?;
        poll.registry()
            .register(&mut shutdown_rx, SHUTDOWN, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKE)?);
        let apartment = Apartment::spawn(cache, Some(waker));

        Ok(Server {
            poll,
            listener,
            shutdown_rx,
            shutdown_addr,
            sessions: FxHashMap::default(),
            next_token: FIRST_SESSION,
            apartment,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// A handle that can be used from another thread to ask a running
    /// `run()` loop to return. Opens its own socket lazily rather than
    /// sharing the loop's registered one, since a `mio`-registered socket
    /// isn't meant to be driven from two threads at once.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            addr: self.shutdown_addr,
        }
    }

    /// Runs until a shutdown scalar arrives on the auxiliary socket.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(128);
        loop {
            self.poll.poll(&mut events, None)?;
            let mut woke = false;
            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_all()?,
                    SHUTDOWN => {
                        if self.drain_shutdown_signal()? {
                            return Ok(());
                        }
                    }
                    WAKE => woke = true,
                    token => self.service_session(token, event)?,
                }
            }
            if woke {
                self.distribute_apartment_responses();
            }
        }
    }

    fn distribute_apartment_responses(&mut self) {
        for (token, responses) in self.apartment.try_drain() {
            if let Some(session) = self.sessions.get_mut(&token) {
                for response in responses {
                    session.queue(&response);
                }
                if let Err(e) = session.poll_writable() {
                    log::warn!("session {token:?} write failed, dropping it: {e}");
                    self.sessions.remove(&token);
                }
            }
        }
    }

    fn accept_all(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((mut socket, _)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    self.poll.registry().register(
                        &mut socket,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    )?;
                    self.sessions.insert(token, Session::new(socket));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn drain_shutdown_signal(&mut self) -> Result<bool> {
        let mut buf = [0u8; 8];
        loop {
            match self.shutdown_rx.recv(&mut buf) {
                Ok(8) if u64::from_le_bytes(buf) == SHUTDOWN_SCALAR => return Ok(true),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn service_session(&mut self, token: Token, event: &Event) -> Result<()> {
        let Some(session) = self.sessions.get_mut(&token) else {
            return Ok(());
        };

        let mut alive = true;
        if event.is_readable() {
            let mut inbound = Vec::new();
            alive = session.poll_readable(&mut inbound)?;
            for message in inbound {
                self.apartment.submit(token, message);
            }
        }
        if let Some(session) = self.sessions.get_mut(&token) {
            if event.is_writable() || session.has_pending_writes() {
                session.poll_writable()?;
            }
        }
        if !alive {
            self.sessions.remove(&token);
        }
        Ok(())
    }
}

/// Cheap, cloneable handle used to signal a running [`Server::run`] loop to
/// stop from another thread.
#[derive(Clone, Copy)]
pub struct ShutdownHandle {
    addr: SocketAddr,
}

impl ShutdownHandle {
    pub fn shutdown(&self) -> Result<()> {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").map_err(Error::Io)?;
        socket
            .send_to(&SHUTDOWN_SCALAR.to_le_bytes(), self.addr)
            .map_err(Error::Io)?;
        Ok(())
    }
}
