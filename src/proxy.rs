//! SOCKS5 proxy state machine.
//!
//! One `ProxyService` owns the listening socket, the DNS socket, and every
//! live session. The event loop calls back into `handle_event`, which
//! dispatches on the descriptor and the session phase: greeting, request
//! parsing, resolution, connect completion, and streaming.
//!
//! Both descriptors of a session co-index one shared session object in the
//! table; closing a session removes every entry that references it.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::dns::{self, DnsResponse};
use crate::event::{EventHandler, EventLoop, Interest, Readiness};
use crate::session::{
    Session, SessionState, ATYP_DOMAIN, ATYP_IPV4, CMD_CONNECT, REPLY_NO_AUTH, REPLY_SUCCESS,
};
use crate::socket;

/// Upstream resolver for domain CONNECT targets.
pub const DEFAULT_RESOLVER: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53));

/// Streaming relay chunk size.
const RELAY_BUF_SIZE: usize = 8192;

/// Upper bounds on the greeting and request frames.
const GREETING_BUF_SIZE: usize = 256;
const REQUEST_BUF_SIZE: usize = 1024;

type SessionRef = Rc<RefCell<Session>>;

/// Configuration for the proxy service.
pub struct ProxyConfig {
    /// TCP port to listen on.
    pub port: u16,
    /// Upstream DNS server.
    pub resolver: SocketAddr,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 1080,
            resolver: DEFAULT_RESOLVER,
        }
    }
}

/// What to do with a session after its CONNECT request was parsed.
enum RequestAction {
    Close(&'static str),
    Connect,
    Resolve(String),
}

/// The SOCKS5 proxy: listener, DNS sidecar, session table, and the
/// query-id correlator for in-flight resolutions.
pub struct ProxyService {
    listener: TcpListener,
    dns_socket: UdpSocket,
    resolver: SocketAddr,
    sessions: FxHashMap<RawFd, SessionRef>,
    pending_queries: FxHashMap<u16, RawFd>,
}

impl ProxyService {
    pub fn new(config: &ProxyConfig) -> io::Result<Self> {
        let listener = socket::listen_tcp(config.port)?;
        let dns_socket = socket::bind_udp()?;

        Ok(Self {
            listener,
            dns_socket,
            resolver: config.resolver,
            sessions: FxHashMap::default(),
            pending_queries: FxHashMap::default(),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of descriptors currently tracked in the session table.
    pub fn tracked_descriptors(&self) -> usize {
        self.sessions.len()
    }

    /// Number of DNS queries awaiting a response.
    pub fn pending_query_count(&self) -> usize {
        self.pending_queries.len()
    }

    /// Register the server sockets with the event loop.
    pub fn start(&self, event_loop: &EventLoop) -> io::Result<()> {
        info!(
            listener_fd = self.listener.as_raw_fd(),
            dns_fd = self.dns_socket.as_raw_fd(),
            "registering server sockets"
        );
        event_loop.register(self.listener.as_raw_fd(), Interest::READABLE)?;
        event_loop.register(self.dns_socket.as_raw_fd(), Interest::READABLE)?;
        Ok(())
    }

    /// Drain the accept queue, creating one session per connection.
    fn accept_clients(&mut self, event_loop: &EventLoop) -> io::Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(conn) => conn,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return Ok(());
                }
            };

            if let Err(e) = stream.set_nonblocking(true) {
                warn!(error = %e, "failed to set client non-blocking");
                continue;
            }

            let fd = stream.as_raw_fd();
            self.sessions
                .insert(fd, Rc::new(RefCell::new(Session::new(stream))));

            // A descriptor stays in the table only while it is registered.
            if let Err(e) = event_loop.register(fd, Interest::READABLE) {
                warn!(fd, error = %e, "failed to register client descriptor");
                self.sessions.remove(&fd);
                continue;
            }

            info!(fd, peer = %peer, "accepted client");
        }
    }

    /// State Auth: read the greeting and always select no-auth.
    fn handshake_greeting(&mut self, event_loop: &EventLoop, session: &SessionRef) -> io::Result<()> {
        let verdict: Result<(), &'static str> = {
            let mut guard = session.borrow_mut();
            let sess = &mut *guard;
            let Some(client) = sess.client.as_mut() else {
                return Ok(());
            };

            let mut buf = [0u8; GREETING_BUF_SIZE];
            match client.read(&mut buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    debug!(error = %e, "greeting read failed");
                    Err("greeting read failed")
                }
                Ok(0) => Err("client closed during greeting"),
                // The offered methods are deliberately not inspected;
                // no-auth is always selected.
                Ok(_) => match client.write_all(&REPLY_NO_AUTH) {
                    Ok(()) => {
                        sess.state = SessionState::Request;
                        debug!(client_fd = client.as_raw_fd(), "greeting complete");
                        Ok(())
                    }
                    Err(e) => {
                        debug!(error = %e, "greeting reply failed");
                        Err("greeting reply failed")
                    }
                },
            }
        };

        if let Err(reason) = verdict {
            self.close_session(event_loop, session, reason);
        }
        Ok(())
    }

    /// State Request: parse the CONNECT request and pick the next phase.
    fn handshake_request(&mut self, event_loop: &EventLoop, session: &SessionRef) -> io::Result<()> {
        let action = {
            let mut guard = session.borrow_mut();
            let sess = &mut *guard;
            let Some(client) = sess.client.as_mut() else {
                return Ok(());
            };

            let mut buf = [0u8; REQUEST_BUF_SIZE];
            let n = match client.read(&mut buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    debug!(error = %e, "request read failed");
                    0
                }
                Ok(n) => n,
            };

            // Layout: VER CMD RSV ATYP ADDR.. PORT
            if n < 4 {
                RequestAction::Close("request read failed")
            } else if buf[1] != CMD_CONNECT {
                warn!(cmd = buf[1], "unsupported command");
                RequestAction::Close("unsupported command")
            } else {
                match buf[3] {
                    ATYP_IPV4 if n >= 10 => {
                        sess.target_addr =
                            Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]).to_string();
                        sess.target_port = u16::from_be_bytes([buf[8], buf[9]]);
                        RequestAction::Connect
                    }
                    ATYP_IPV4 => RequestAction::Close("truncated request"),
                    ATYP_DOMAIN => {
                        let len = buf[4] as usize;
                        if n < 5 + len + 2 {
                            RequestAction::Close("truncated request")
                        } else {
                            match std::str::from_utf8(&buf[5..5 + len]) {
                                Ok(domain) => {
                                    sess.target_addr = domain.to_string();
                                    sess.target_port =
                                        u16::from_be_bytes([buf[5 + len], buf[6 + len]]);
                                    sess.state = SessionState::Resolving;
                                    RequestAction::Resolve(domain.to_string())
                                }
                                Err(_) => RequestAction::Close("malformed domain"),
                            }
                        }
                    }
                    atyp => {
                        warn!(atyp, "unsupported address type");
                        RequestAction::Close("unsupported address type")
                    }
                }
            }
        };

        match action {
            RequestAction::Close(reason) => {
                self.close_session(event_loop, session, reason);
                Ok(())
            }
            RequestAction::Connect => {
                {
                    let sess = session.borrow();
                    info!(ip = %sess.target_addr, port = sess.target_port, "connecting to literal address");
                }
                self.start_tcp_connect(event_loop, session)
            }
            RequestAction::Resolve(domain) => {
                info!(domain = %domain, "resolving target domain");
                self.send_dns_query(event_loop, session, &domain)
            }
        }
    }

    /// Send an A query for `domain` and correlate it with the session.
    fn send_dns_query(
        &mut self,
        event_loop: &EventLoop,
        session: &SessionRef,
        domain: &str,
    ) -> io::Result<()> {
        let id = self.allocate_query_id();
        let packet = dns::encode_query(id, domain);

        if let Err(e) = self.dns_socket.send_to(&packet, self.resolver) {
            warn!(error = %e, domain, "DNS query send failed");
            self.close_session(event_loop, session, "dns send failed");
            return Ok(());
        }

        let Some(client_fd) = session.borrow().client_fd() else {
            return Ok(());
        };
        session.borrow_mut().query_id = Some(id);
        self.pending_queries.insert(id, client_fd);
        debug!(id, domain, resolver = %self.resolver, "DNS query sent");
        Ok(())
    }

    /// Pick a query id that is not already in flight.
    fn allocate_query_id(&self) -> u16 {
        loop {
            let id = rand::random::<u16>();
            if !self.pending_queries.contains_key(&id) {
                return id;
            }
        }
    }

    /// Drain the DNS socket, advancing every session whose answer arrived.
    fn process_dns_responses(&mut self, event_loop: &EventLoop) -> io::Result<()> {
        let mut buf = [0u8; dns::MAX_PACKET_SIZE];
        loop {
            let n = match self.dns_socket.recv_from(&mut buf) {
                Ok((n, _)) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    debug!(error = %e, "DNS receive failed");
                    return Ok(());
                }
            };

            let Some(response) = DnsResponse::parse(&buf[..n]) else {
                debug!("dropping unparseable DNS response");
                continue;
            };
            // Unknown or stale ids are dropped silently.
            let Some(client_fd) = self.pending_queries.remove(&response.id) else {
                continue;
            };
            let Some(session) = self.sessions.get(&client_fd).cloned() else {
                continue;
            };

            session.borrow_mut().query_id = None;

            let Some(ip) = response.first_a() else {
                warn!(domain = %session.borrow().target_addr, "DNS response has no A records");
                self.close_session(event_loop, &session, "no A records");
                continue;
            };

            info!(domain = %session.borrow().target_addr, ip = %ip, "resolved target");
            session.borrow_mut().target_addr = ip.to_string();
            self.start_tcp_connect(event_loop, &session)?;
        }
    }

    /// Kick off the non-blocking connect to the session's target.
    fn start_tcp_connect(&mut self, event_loop: &EventLoop, session: &SessionRef) -> io::Result<()> {
        let (addr, port) = {
            let sess = session.borrow();
            (sess.target_addr.clone(), sess.target_port)
        };

        let ip: Ipv4Addr = match addr.parse() {
            Ok(ip) => ip,
            Err(_) => {
                self.close_session(event_loop, session, "invalid target address");
                return Ok(());
            }
        };
        let target = SocketAddrV4::new(ip, port);

        let remote = match socket::connect_tcp(target) {
            Ok(stream) => stream,
            Err(e) => {
                debug!(error = %e, target = %target, "connect failed immediately");
                self.close_session(event_loop, session, "connect failed");
                return Ok(());
            }
        };

        let remote_fd = remote.as_raw_fd();
        debug!(target = %target, remote_fd, "initiating connection");

        {
            let mut sess = session.borrow_mut();
            sess.remote = Some(remote);
            sess.state = SessionState::Connecting;
        }
        self.sessions.insert(remote_fd, Rc::clone(session));

        if let Err(e) = event_loop.register(remote_fd, Interest::WRITABLE) {
            warn!(remote_fd, error = %e, "failed to register remote descriptor");
            self.close_session(event_loop, session, "register failed");
        }
        Ok(())
    }

    /// Writable-readiness on the remote: resolve the pending connect.
    fn finalize_connect(&mut self, event_loop: &EventLoop, session: &SessionRef) -> io::Result<()> {
        let verdict: Result<(RawFd, RawFd), &'static str> = {
            let mut guard = session.borrow_mut();
            let sess = &mut *guard;
            let (Some(client), Some(remote)) = (sess.client.as_mut(), sess.remote.as_mut()) else {
                return Ok(());
            };

            match remote.take_error() {
                Ok(None) => match client.write_all(&REPLY_SUCCESS) {
                    Ok(()) => Ok((client.as_raw_fd(), remote.as_raw_fd())),
                    Err(e) => {
                        debug!(error = %e, "success reply write failed");
                        Err("reply write failed")
                    }
                },
                Ok(Some(e)) => {
                    debug!(error = %e, target = %sess.target_addr, "async connect failed");
                    Err("connect failed")
                }
                Err(e) => {
                    debug!(error = %e, "SO_ERROR query failed");
                    Err("connect failed")
                }
            }
        };

        match verdict {
            Ok((client_fd, remote_fd)) => {
                {
                    let mut sess = session.borrow_mut();
                    sess.state = SessionState::Streaming;
                    info!(target = %sess.target_addr, port = sess.target_port, "connected to target");
                }
                if let Err(e) = event_loop
                    .modify(client_fd, Interest::READABLE)
                    .and_then(|()| event_loop.modify(remote_fd, Interest::READABLE))
                {
                    warn!(error = %e, "failed to rearm streaming descriptors");
                    self.close_session(event_loop, session, "rearm failed");
                }
            }
            Err(reason) => self.close_session(event_loop, session, reason),
        }
        Ok(())
    }

    /// State Streaming: copy from whichever side fired to its peer.
    fn relay(&mut self, event_loop: &EventLoop, session: &SessionRef, fd: RawFd) -> io::Result<()> {
        let mut total = 0usize;
        let verdict: Result<(), &'static str> = {
            let mut guard = session.borrow_mut();
            let Session {
                client: Some(client),
                remote: Some(remote),
                ..
            } = &mut *guard
            else {
                return Ok(());
            };

            let (src, dst) = if client.as_raw_fd() == fd {
                (client, remote)
            } else {
                (remote, client)
            };

            let mut buf = [0u8; RELAY_BUF_SIZE];
            // Edge-triggered: keep reading until the source would block.
            loop {
                match src.read(&mut buf) {
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                    Err(e) => {
                        debug!(error = %e, "relay read failed");
                        break Err("read failed");
                    }
                    Ok(0) => break Err("closed by peer"),
                    Ok(n) => {
                        // A short or would-block write is fatal; there is no
                        // egress buffering.
                        if let Err(e) = dst.write_all(&buf[..n]) {
                            debug!(error = %e, "relay write failed");
                            break Err("write failed");
                        }
                        total += n;
                    }
                }
            }
        };

        if total > 0 {
            debug!(fd, bytes = total, "relayed");
        }
        if let Err(reason) = verdict {
            self.close_session(event_loop, session, reason);
        }
        Ok(())
    }

    /// Tear a session down: unregister and close both descriptors exactly
    /// once, drop their table entries, and clear any in-flight DNS query.
    /// Calling it again is a no-op.
    fn close_session(&mut self, event_loop: &EventLoop, session: &SessionRef, reason: &str) {
        let mut sess = session.borrow_mut();
        if sess.state == SessionState::Closed {
            return;
        }
        info!(client_fd = sess.client_fd().unwrap_or(-1), reason, "closing session");
        sess.state = SessionState::Closed;

        if let Some(id) = sess.query_id.take() {
            self.pending_queries.remove(&id);
        }

        for stream in [sess.client.take(), sess.remote.take()].into_iter().flatten() {
            let fd = stream.as_raw_fd();
            if let Err(e) = event_loop.unregister(fd) {
                debug!(fd, error = %e, "unregister failed");
            }
            self.sessions.remove(&fd);
            // Dropping the stream closes the descriptor.
        }
    }
}

impl EventHandler for ProxyService {
    fn handle_event(
        &mut self,
        event_loop: &EventLoop,
        fd: RawFd,
        readiness: Readiness,
    ) -> io::Result<()> {
        if fd == self.listener.as_raw_fd() {
            return self.accept_clients(event_loop);
        }
        if fd == self.dns_socket.as_raw_fd() {
            return self.process_dns_responses(event_loop);
        }

        let Some(session) = self.sessions.get(&fd).cloned() else {
            return Ok(());
        };

        let (state, remote_fd) = {
            let sess = session.borrow();
            (sess.state, sess.remote_fd())
        };

        match state {
            SessionState::Auth => self.handshake_greeting(event_loop, &session),
            SessionState::Request => self.handshake_request(event_loop, &session),
            SessionState::Connecting if remote_fd == Some(fd) && readiness.writable => {
                self.finalize_connect(event_loop, &session)
            }
            SessionState::Streaming => self.relay(event_loop, &session, fd),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream, UdpSocket};
    use std::thread;
    use std::time::Duration;

    const TICK: Duration = Duration::from_millis(200);

    fn spawn_proxy(resolver: SocketAddr) -> (EventLoop, ProxyService, SocketAddr) {
        let event_loop = EventLoop::new().unwrap();
        let proxy = ProxyService::new(&ProxyConfig { port: 0, resolver }).unwrap();
        proxy.start(&event_loop).unwrap();
        let port = proxy.local_addr().unwrap().port();
        (event_loop, proxy, SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn pump(event_loop: &mut EventLoop, proxy: &mut ProxyService, rounds: usize) {
        for _ in 0..rounds {
            event_loop.poll_once(proxy, Some(TICK)).unwrap();
        }
    }

    /// Echo server used as the CONNECT target.
    fn spawn_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            while let Ok((mut stream, _)) = listener.accept() {
                thread::spawn(move || {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf) {
                        if n == 0 || stream.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    /// Test resolver answering every query with the given A record, or with
    /// an empty answer section when `answer` is `None`.
    fn spawn_dns_server(answer: Option<[u8; 4]>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        thread::spawn(move || {
            let mut buf = [0u8; 512];
            while let Ok((n, src)) = socket.recv_from(&mut buf) {
                if n < 12 {
                    continue;
                }
                let response = build_dns_response(&buf[..n], answer);
                let _ = socket.send_to(&response, src);
            }
        });
        addr
    }

    /// Build a response echoing the query's id and question section.
    fn build_dns_response(query: &[u8], answer: Option<[u8; 4]>) -> Vec<u8> {
        let mut response = Vec::with_capacity(512);
        response.extend_from_slice(&query[0..2]); // id
        response.extend_from_slice(&[0x81, 0x80]); // standard response, no error
        response.extend_from_slice(&query[4..6]); // QDCOUNT
        response.extend_from_slice(&u16::from(answer.is_some()).to_be_bytes());
        response.extend_from_slice(&[0, 0, 0, 0]); // NSCOUNT + ARCOUNT
        response.extend_from_slice(&query[12..]); // question section
        if let Some(rdata) = answer {
            response.extend_from_slice(&[0xC0, 0x0C]); // pointer to the question name
            response.extend_from_slice(&dns::TYPE_A.to_be_bytes());
            response.extend_from_slice(&dns::CLASS_IN.to_be_bytes());
            response.extend_from_slice(&60u32.to_be_bytes());
            response.extend_from_slice(&4u16.to_be_bytes());
            response.extend_from_slice(&rdata);
        }
        response
    }

    fn connect_client(addr: SocketAddr) -> TcpStream {
        let client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        client
    }

    /// Run the greeting exchange and assert the no-auth reply.
    fn greet(client: &mut TcpStream, event_loop: &mut EventLoop, proxy: &mut ProxyService) {
        client.write_all(&[0x05, 0x01, 0x00]).unwrap();
        pump(event_loop, proxy, 2);

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(reply, REPLY_NO_AUTH);
    }

    fn ipv4_request(target: SocketAddr) -> Vec<u8> {
        let SocketAddr::V4(v4) = target else {
            panic!("targets are IPv4 in tests");
        };
        let mut request = vec![0x05, 0x01, 0x00, 0x01];
        request.extend_from_slice(&v4.ip().octets());
        request.extend_from_slice(&v4.port().to_be_bytes());
        request
    }

    fn domain_request(domain: &str, port: u16) -> Vec<u8> {
        let mut request = vec![0x05, 0x01, 0x00, 0x03, domain.len() as u8];
        request.extend_from_slice(domain.as_bytes());
        request.extend_from_slice(&port.to_be_bytes());
        request
    }

    #[test]
    fn ipv4_connect_relays_traffic_both_ways() {
        let echo = spawn_echo_server();
        let (mut event_loop, mut proxy, addr) = spawn_proxy(DEFAULT_RESOLVER);
        let mut client = connect_client(addr);
        greet(&mut client, &mut event_loop, &mut proxy);

        client.write_all(&ipv4_request(echo)).unwrap();
        pump(&mut event_loop, &mut proxy, 3);

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(reply, REPLY_SUCCESS);

        client.write_all(b"hello through the proxy").unwrap();
        pump(&mut event_loop, &mut proxy, 3);

        let mut echoed = [0u8; 23];
        client.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"hello through the proxy");
    }

    #[test]
    fn domain_connect_resolves_and_relays() {
        let echo = spawn_echo_server();
        let dns_server = spawn_dns_server(Some([127, 0, 0, 1]));
        let (mut event_loop, mut proxy, addr) = spawn_proxy(dns_server);
        let mut client = connect_client(addr);
        greet(&mut client, &mut event_loop, &mut proxy);

        client
            .write_all(&domain_request("localhost", echo.port()))
            .unwrap();
        pump(&mut event_loop, &mut proxy, 4);

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(reply, REPLY_SUCCESS);
        assert_eq!(proxy.pending_query_count(), 0);

        client.write_all(b"ping").unwrap();
        pump(&mut event_loop, &mut proxy, 3);

        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"ping");
    }

    #[test]
    fn unsupported_command_closes_without_reply() {
        let (mut event_loop, mut proxy, addr) = spawn_proxy(DEFAULT_RESOLVER);
        let mut client = connect_client(addr);
        greet(&mut client, &mut event_loop, &mut proxy);

        // BIND is not supported.
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
            .unwrap();
        pump(&mut event_loop, &mut proxy, 2);

        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(n, 0, "expected a bare TCP close with no SOCKS5 reply");
        assert_eq!(proxy.tracked_descriptors(), 0);
    }

    #[test]
    fn unsupported_address_type_closes() {
        let (mut event_loop, mut proxy, addr) = spawn_proxy(DEFAULT_RESOLVER);
        let mut client = connect_client(addr);
        greet(&mut client, &mut event_loop, &mut proxy);

        // ATYP 0x04 (IPv6) is not supported.
        let mut request = vec![0x05, 0x01, 0x00, 0x04];
        request.extend_from_slice(&[0u8; 16]);
        request.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&request).unwrap();
        pump(&mut event_loop, &mut proxy, 2);

        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
        assert_eq!(proxy.tracked_descriptors(), 0);
    }

    #[test]
    fn truncated_request_closes() {
        let (mut event_loop, mut proxy, addr) = spawn_proxy(DEFAULT_RESOLVER);
        let mut client = connect_client(addr);
        greet(&mut client, &mut event_loop, &mut proxy);

        client.write_all(&[0x05, 0x01]).unwrap();
        pump(&mut event_loop, &mut proxy, 2);

        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
        assert_eq!(proxy.tracked_descriptors(), 0);
    }

    #[test]
    fn empty_dns_answer_closes_session() {
        let dns_server = spawn_dns_server(None);
        let (mut event_loop, mut proxy, addr) = spawn_proxy(dns_server);
        let mut client = connect_client(addr);
        greet(&mut client, &mut event_loop, &mut proxy);

        client
            .write_all(&domain_request("nowhere.test", 80))
            .unwrap();
        pump(&mut event_loop, &mut proxy, 4);

        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
        assert_eq!(proxy.tracked_descriptors(), 0);
        assert_eq!(proxy.pending_query_count(), 0);
    }

    #[test]
    fn refused_connect_closes_session() {
        // Bind and drop to find a loopback port with no listener.
        let closed_port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let (mut event_loop, mut proxy, addr) = spawn_proxy(DEFAULT_RESOLVER);
        let mut client = connect_client(addr);
        greet(&mut client, &mut event_loop, &mut proxy);

        client
            .write_all(&ipv4_request(SocketAddr::from(([127, 0, 0, 1], closed_port))))
            .unwrap();
        pump(&mut event_loop, &mut proxy, 3);

        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
        assert_eq!(proxy.tracked_descriptors(), 0);
    }

    #[test]
    fn peer_eof_closes_client_side() {
        // A target that accepts and immediately hangs up.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = listener.local_addr().unwrap();
        thread::spawn(move || {
            while let Ok((stream, _)) = listener.accept() {
                drop(stream);
            }
        });

        let (mut event_loop, mut proxy, addr) = spawn_proxy(DEFAULT_RESOLVER);
        let mut client = connect_client(addr);
        greet(&mut client, &mut event_loop, &mut proxy);

        client.write_all(&ipv4_request(target)).unwrap();
        pump(&mut event_loop, &mut proxy, 3);

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(reply, REPLY_SUCCESS);

        pump(&mut event_loop, &mut proxy, 2);

        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
        assert_eq!(proxy.tracked_descriptors(), 0);
    }

    #[test]
    fn close_session_is_idempotent() {
        let (mut event_loop, mut proxy, addr) = spawn_proxy(DEFAULT_RESOLVER);
        let _client = connect_client(addr);
        pump(&mut event_loop, &mut proxy, 1);
        assert_eq!(proxy.tracked_descriptors(), 1);

        let session = proxy.sessions.values().next().unwrap().clone();
        proxy.close_session(&event_loop, &session, "test close");
        proxy.close_session(&event_loop, &session, "test close again");

        assert_eq!(proxy.tracked_descriptors(), 0);
        assert_eq!(proxy.pending_query_count(), 0);
        assert_eq!(session.borrow().state, SessionState::Closed);
        assert!(session.borrow().client.is_none());
        assert!(session.borrow().remote.is_none());
    }

    #[test]
    fn closing_a_resolving_session_clears_its_pending_query() {
        // A resolver that never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let resolver = silent.local_addr().unwrap();

        let (mut event_loop, mut proxy, addr) = spawn_proxy(resolver);
        let mut client = connect_client(addr);
        greet(&mut client, &mut event_loop, &mut proxy);

        client.write_all(&domain_request("stuck.test", 80)).unwrap();
        pump(&mut event_loop, &mut proxy, 2);
        assert_eq!(proxy.pending_query_count(), 1);

        let session = proxy.sessions.values().next().unwrap().clone();
        assert_eq!(session.borrow().state, SessionState::Resolving);
        proxy.close_session(&event_loop, &session, "test close");

        assert_eq!(proxy.pending_query_count(), 0);
        assert_eq!(proxy.tracked_descriptors(), 0);
    }

    #[test]
    fn mismatched_query_id_is_ignored() {
        // A resolver that corrupts the id before answering.
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let resolver = socket.local_addr().unwrap();
        thread::spawn(move || {
            let mut buf = [0u8; 512];
            while let Ok((n, src)) = socket.recv_from(&mut buf) {
                if n < 12 {
                    continue;
                }
                buf[0] ^= 0xFF;
                let response = build_dns_response(&buf[..n], Some([127, 0, 0, 1]));
                let _ = socket.send_to(&response, src);
            }
        });

        let (mut event_loop, mut proxy, addr) = spawn_proxy(resolver);
        let mut client = connect_client(addr);
        greet(&mut client, &mut event_loop, &mut proxy);

        client.write_all(&domain_request("skew.test", 80)).unwrap();
        pump(&mut event_loop, &mut proxy, 3);

        // The response was dropped; the session is still waiting.
        assert_eq!(proxy.pending_query_count(), 1);
        let session = proxy.sessions.values().next().unwrap();
        assert_eq!(session.borrow().state, SessionState::Resolving);
    }

    #[test]
    fn client_disconnect_during_greeting_closes_session() {
        let (mut event_loop, mut proxy, addr) = spawn_proxy(DEFAULT_RESOLVER);
        let client = connect_client(addr);
        pump(&mut event_loop, &mut proxy, 1);
        assert_eq!(proxy.tracked_descriptors(), 1);

        drop(client);
        pump(&mut event_loop, &mut proxy, 2);

        assert_eq!(proxy.tracked_descriptors(), 0);
    }
}
