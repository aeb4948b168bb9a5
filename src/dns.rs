//! DNS message construction and parsing.
//!
//! Only the slice of the protocol the proxy needs: building a
//! single-question A query and pulling the answer records out of the
//! response.

use std::net::Ipv4Addr;

const HEADER_LEN: usize = 12;

/// Standard DNS-over-UDP message size limit.
pub const MAX_PACKET_SIZE: usize = 512;

pub const TYPE_A: u16 = 1;
pub const CLASS_IN: u16 = 1;

/// Header flags for a standard query with recursion desired.
const FLAGS_RD: u16 = 0x0100;

/// Encode a single-question A query for `domain`.
///
/// A trailing dot is accepted; labels are emitted FQDN-style either way.
pub fn encode_query(id: u16, domain: &str) -> Vec<u8> {
    let domain = domain.trim_end_matches('.');
    let mut data = Vec::with_capacity(HEADER_LEN + domain.len() + 6);

    // Header
    data.extend_from_slice(&id.to_be_bytes());
    data.extend_from_slice(&FLAGS_RD.to_be_bytes());
    data.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    data.extend_from_slice(&[0x00, 0x00]); // ANCOUNT
    data.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
    data.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

    // Question
    encode_domain(&mut data, domain);
    data.extend_from_slice(&TYPE_A.to_be_bytes());
    data.extend_from_slice(&CLASS_IN.to_be_bytes());

    data
}

fn encode_domain(buf: &mut Vec<u8>, domain: &str) {
    // An empty domain encodes as the bare root label.
    if !domain.is_empty() {
        for label in domain.split('.') {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
    }
    buf.push(0);
}

/// An answer-section resource record. Names are skipped during parsing.
#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

/// A parsed DNS response: the message id and its answer section.
#[derive(Debug, Clone)]
pub struct DnsResponse {
    pub id: u16,
    pub answers: Vec<DnsRecord>,
}

impl DnsResponse {
    /// Parse a response message, keeping only the id and the answer section.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN {
            return None;
        }

        let id = u16::from_be_bytes([data[0], data[1]]);
        let qdcount = u16::from_be_bytes([data[4], data[5]]) as usize;
        let ancount = u16::from_be_bytes([data[6], data[7]]) as usize;

        let mut pos = HEADER_LEN;

        // Skip the question section
        for _ in 0..qdcount {
            pos = skip_name(data, pos)?;
            pos += 4; // QTYPE + QCLASS
            if pos > data.len() {
                return None;
            }
        }

        let mut answers = Vec::with_capacity(ancount);
        for _ in 0..ancount {
            pos = skip_name(data, pos)?;
            if pos + 10 > data.len() {
                return None;
            }

            let rtype = u16::from_be_bytes([data[pos], data[pos + 1]]);
            let class = u16::from_be_bytes([data[pos + 2], data[pos + 3]]);
            let ttl = u32::from_be_bytes([
                data[pos + 4],
                data[pos + 5],
                data[pos + 6],
                data[pos + 7],
            ]);
            let rdlength = u16::from_be_bytes([data[pos + 8], data[pos + 9]]) as usize;
            pos += 10;

            if pos + rdlength > data.len() {
                return None;
            }
            answers.push(DnsRecord {
                rtype,
                class,
                ttl,
                rdata: data[pos..pos + rdlength].to_vec(),
            });
            pos += rdlength;
        }

        Some(Self { id, answers })
    }

    /// First A record in the answer section, if any.
    pub fn first_a(&self) -> Option<Ipv4Addr> {
        self.answers
            .iter()
            .find(|a| a.rtype == TYPE_A && a.class == CLASS_IN && a.rdata.len() == 4)
            .map(|a| Ipv4Addr::new(a.rdata[0], a.rdata[1], a.rdata[2], a.rdata[3]))
    }
}

/// Skip a possibly-compressed name, returning the offset just past it.
fn skip_name(data: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *data.get(pos)?;
        if len == 0 {
            return Some(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            // A compression pointer ends the name
            return Some(pos + 2);
        }
        pos += 1 + len as usize;
    }
}
