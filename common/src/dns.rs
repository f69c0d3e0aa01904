//! Catch-all DNS for the provisioning access point: every name resolves to
//! the portal's own address.

use std::net::Ipv4Addr;

const HEADER_LEN: usize = 12;
const TYPE_A: u16 = 1;
const TYPE_ANY: u16 = 255;
const CLASS_IN: u16 = 1;
const TTL_SECS: u32 = 60;
const MAX_LABEL_LEN: usize = 63;

/// Builds the reply for a single-question query. Returns `None` for anything
/// that is not a well-formed standard query, which the caller should drop.
pub fn catch_all_response(query: &[u8], ip: Ipv4Addr) -> Option<Vec<u8>> {
    if query.len() < HEADER_LEN {
        return None;
    }

    let flags = u16::from_be_bytes([query[2], query[3]]);
    let is_response = flags & 0x8000 != 0;
    let opcode = (flags >> 11) & 0x0f;
    let questions = u16::from_be_bytes([query[4], query[5]]);
    if is_response || opcode != 0 || questions == 0 {
        return None;
    }

    let name_end = question_name_end(query)?;
    let question_end = name_end + 4;
    if query.len() < question_end {
        return None;
    }
    let qtype = u16::from_be_bytes([query[name_end], query[name_end + 1]]);
    let qclass = u16::from_be_bytes([query[name_end + 2], query[name_end + 3]]);
    let answer = (qtype == TYPE_A || qtype == TYPE_ANY) && qclass == CLASS_IN;

    let mut reply = Vec::with_capacity(question_end + 16);
    reply.extend_from_slice(&query[0..2]);
    // QR and AA set, RD echoed.
    let recursion_desired = flags & 0x0100;
    reply.extend_from_slice(&(0x8400 | recursion_desired).to_be_bytes());
    reply.extend_from_slice(&1u16.to_be_bytes());
    reply.extend_from_slice(&u16::from(answer).to_be_bytes());
    reply.extend_from_slice(&0u16.to_be_bytes());
    reply.extend_from_slice(&0u16.to_be_bytes());
    reply.extend_from_slice(&query[HEADER_LEN..name_end]);
    reply.extend_from_slice(&qtype.to_be_bytes());
    reply.extend_from_slice(&qclass.to_be_bytes());

    if answer {
        // Name is a pointer back to the question at offset 12.
        reply.extend_from_slice(&[0xc0, 0x0c]);
        reply.extend_from_slice(&TYPE_A.to_be_bytes());
        reply.extend_from_slice(&CLASS_IN.to_be_bytes());
        reply.extend_from_slice(&TTL_SECS.to_be_bytes());
        reply.extend_from_slice(&4u16.to_be_bytes());
        reply.extend_from_slice(&ip.octets());
    }

    Some(reply)
}

/// Offset just past the question name's terminating zero label.
fn question_name_end(query: &[u8]) -> Option<usize> {
    let mut offset = HEADER_LEN;
    loop {
        let len = usize::from(*query.get(offset)?);
        if len == 0 {
            return Some(offset + 1);
        }
        // Compression pointers and oversized labels never appear in a question.
        if len > MAX_LABEL_LEN {
            return None;
        }
        offset += 1 + len;
    }
}

/// Decoded question name, mostly for logging.
pub fn question_name(query: &[u8]) -> Option<String> {
    let end = question_name_end(query)?;
    let mut labels = Vec::new();
    let mut offset = HEADER_LEN;
    while offset + 1 < end {
        let len = usize::from(query[offset]);
        let label = query.get(offset + 1..offset + 1 + len)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        offset += 1 + len;
    }
    Some(labels.join("."))
}
