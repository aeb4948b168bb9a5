//! Session domain types and SOCKS5 wire constants.

use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};

pub const SOCKS_VERSION: u8 = 0x05;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;

/// Greeting reply: version 5, no authentication required.
pub const REPLY_NO_AUTH: [u8; 2] = [SOCKS_VERSION, 0x00];

/// Request reply: succeeded, bind address and port zeroed.
pub const REPLY_SUCCESS: [u8; 10] = [SOCKS_VERSION, 0x00, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];

/// Phases of one client's SOCKS5 conversation.
///
/// A session only moves forward through these phases; closure is the one
/// exception and is reachable from every phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Waiting for the client greeting.
    Auth,
    /// Waiting for the CONNECT request.
    Request,
    /// A DNS query for the target domain is in flight.
    Resolving,
    /// Non-blocking connect to the target is in progress.
    Connecting,
    /// Relaying bytes between client and target.
    Streaming,
    Closed,
}

/// One client connection and its attached outbound connection.
///
/// Both descriptors are held as `Option` so teardown can take and close
/// each exactly once.
pub struct Session {
    pub client: Option<TcpStream>,
    pub remote: Option<TcpStream>,
    pub state: SessionState,
    /// Dotted IPv4 string, or the target domain while resolving.
    pub target_addr: String,
    pub target_port: u16,
    /// Id of the outstanding DNS query, if a resolution is in flight.
    pub query_id: Option<u16>,
}

impl Session {
    pub fn new(client: TcpStream) -> Self {
        Self {
            client: Some(client),
            remote: None,
            state: SessionState::Auth,
            target_addr: String::new(),
            target_port: 0,
            query_id: None,
        }
    }

    pub fn client_fd(&self) -> Option<RawFd> {
        self.client.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn remote_fd(&self) -> Option<RawFd> {
        self.remote.as_ref().map(|s| s.as_raw_fd())
    }
}
