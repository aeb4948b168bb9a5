//! Non-blocking socket construction.
//!
//! The listener, the DNS socket, and outbound connections are created here
//! and handed to the proxy service; all I/O on them happens through the
//! event loop. Partially-created sockets are released by drop on the error
//! path.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

const LISTEN_BACKLOG: i32 = 128;

/// Create a non-blocking IPv4 listener bound to `0.0.0.0:port`.
pub fn listen_tcp(port: u16) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    let addr = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

/// Create a non-blocking IPv4 datagram socket for DNS traffic.
///
/// The socket is left unbound; the kernel assigns an ephemeral source port
/// on the first send.
pub fn bind_udp() -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

/// Start a non-blocking IPv4 connect to `addr`.
///
/// Returns the in-progress stream; completion is observed later through
/// writable-readiness and `take_error`. Immediate success is treated the
/// same as an in-progress connect.
pub fn connect_tcp(addr: SocketAddrV4) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;

    match socket.connect(&SocketAddr::from(addr).into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(e),
    }

    Ok(socket.into())
}
