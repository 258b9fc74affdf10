//! DNS wire format encode/decode (RFC 1035 §4), grounded on the TCP framing
//! in `microsoft-openvmm`'s `dns_tcp.rs` (length-prefixed messages) plus the
//! standard header/question/answer layout.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, Bytes, BytesMut};

use crate::dns::record::{Record, RecordData, RecordType};

const FLAG_RD: u16 = 0x0100;
const FLAG_TC: u16 = 0x0200;

/// Builds a single-question query packet with a random-looking (caller
/// supplied) transaction id and `RD=1`.
pub fn encode_query(id: u16, qtype: RecordType, name: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(name.len() + 32);
    buf.put_u16(id);
    buf.put_u16(FLAG_RD);
    buf.put_u16(1); // qdcount
    buf.put_u16(0); // ancount
    buf.put_u16(0); // nscount
    buf.put_u16(0); // arcount
    encode_name(&mut buf, name);
    buf.put_u16(qtype.code());
    buf.put_u16(1); // IN
    buf.freeze()
}

fn encode_name(buf: &mut BytesMut, name: &str) {
    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() {
            continue;
        }
        buf.put_u8(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.put_u8(0);
}

/// Outcome of parsing a complete response packet.
pub struct ParsedMessage {
    pub truncated: bool,
    pub records: Vec<Record>,
}

/// Parses `buf` as a response to the query `id`, keeping only answers of
/// `qtype` (spec §4.7 "Record parsing").
pub fn parse(buf: &[u8], id: u16, qtype: RecordType) -> io::Result<ParsedMessage> {
    if buf.len() < 12 {
        return Err(invalid("dns message shorter than a header"));
    }
    let resp_id = u16::from_be_bytes([buf[0], buf[1]]);
    if resp_id != id {
        return Err(invalid("dns response id mismatch"));
    }
    let flags = u16::from_be_bytes([buf[2], buf[3]]);
    let truncated = flags & FLAG_TC != 0;
    let qdcount = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    let ancount = u16::from_be_bytes([buf[6], buf[7]]) as usize;

    let mut offset = 12;
    for _ in 0..qdcount {
        let (_, next) = read_name(buf, offset)?;
        offset = next + 4; // qtype + qclass
    }

    let mut records = Vec::new();
    for _ in 0..ancount {
        let (_, next) = read_name(buf, offset)?;
        offset = next;
        if offset + 10 > buf.len() {
            break;
        }
        let rtype = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        let ttl = u32::from_be_bytes([
            buf[offset + 4],
            buf[offset + 5],
            buf[offset + 6],
            buf[offset + 7],
        ]);
        let rdlen = u16::from_be_bytes([buf[offset + 8], buf[offset + 9]]) as usize;
        let rdata_start = offset + 10;
        if rdata_start + rdlen > buf.len() {
            break;
        }
        let rdata = &buf[rdata_start..rdata_start + rdlen];
        if let Some(data) = decode_rdata(rtype, rdata, buf, rdata_start, qtype) {
            records.push(Record { data, ttl });
        }
        offset = rdata_start + rdlen;
    }

    Ok(ParsedMessage { truncated, records })
}

fn decode_rdata(
    rtype: u16,
    rdata: &[u8],
    buf: &[u8],
    rdata_start: usize,
    qtype: RecordType,
) -> Option<RecordData> {
    if rtype != qtype.code() {
        return None;
    }
    match qtype {
        RecordType::A if rdata.len() == 4 => {
            Some(RecordData::A(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])))
        }
        RecordType::Aaaa if rdata.len() == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(rdata);
            Some(RecordData::Aaaa(Ipv6Addr::from(octets)))
        }
        RecordType::Srv if rdata.len() >= 6 => {
            let priority = u16::from_be_bytes([rdata[0], rdata[1]]);
            let weight = u16::from_be_bytes([rdata[2], rdata[3]]);
            let port = u16::from_be_bytes([rdata[4], rdata[5]]);
            let (target, _) = read_name(buf, rdata_start + 6).ok()?;
            Some(RecordData::Srv { priority, weight, port, target })
        }
        _ => None,
    }
}

/// Reads a (possibly compressed) name starting at `start`, returning the
/// joined labels and the offset immediately after the name as it appears
/// in-line (not following any pointer).
fn read_name(buf: &[u8], start: usize) -> io::Result<(String, usize)> {
    let mut labels = Vec::new();
    let mut offset = start;
    let mut jumped = false;
    let mut end_offset = start;
    let mut hops = 0;
    loop {
        if offset >= buf.len() {
            return Err(invalid("dns name out of bounds"));
        }
        let len = buf[offset];
        if len == 0 {
            if !jumped {
                end_offset = offset + 1;
            }
            break;
        } else if len & 0xC0 == 0xC0 {
            if offset + 1 >= buf.len() {
                return Err(invalid("dns name pointer out of bounds"));
            }
            if !jumped {
                end_offset = offset + 2;
            }
            jumped = true;
            hops += 1;
            if hops > 128 {
                return Err(invalid("dns name compression loop"));
            }
            offset = (((len & 0x3F) as usize) << 8) | buf[offset + 1] as usize;
        } else {
            let len = len as usize;
            if offset + 1 + len > buf.len() {
                return Err(invalid("dns label out of bounds"));
            }
            labels.push(String::from_utf8_lossy(&buf[offset + 1..offset + 1 + len]).into_owned());
            offset += 1 + len;
        }
    }
    Ok((labels.join("."), end_offset))
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_a_response(id: u16, ip: Ipv4Addr, ttl: u32, truncated: bool) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(id);
        buf.put_u16(if truncated { 0x8200 } else { 0x8000 });
        buf.put_u16(1);
        buf.put_u16(1);
        buf.put_u16(0);
        buf.put_u16(0);
        encode_name(&mut buf, "example.com");
        buf.put_u16(RecordType::A.code());
        buf.put_u16(1);
        encode_name(&mut buf, "example.com");
        buf.put_u16(RecordType::A.code());
        buf.put_u16(1);
        buf.put_u32(ttl);
        buf.put_u16(4);
        buf.extend_from_slice(&ip.octets());
        buf.freeze()
    }

    #[test]
    fn round_trips_a_record() {
        let ip = Ipv4Addr::new(93, 184, 216, 34);
        let packet = build_a_response(0xBEEF, ip, 300, false);
        let parsed = parse(&packet, 0xBEEF, RecordType::A).expect("parse");
        assert!(!parsed.truncated);
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].data, RecordData::A(ip));
        assert_eq!(parsed.records[0].ttl, 300);
    }

    #[test]
    fn rejects_mismatched_id() {
        let packet = build_a_response(1, Ipv4Addr::new(1, 2, 3, 4), 60, false);
        assert!(parse(&packet, 2, RecordType::A).is_err());
    }

    #[test]
    fn surfaces_truncation_flag() {
        let packet = build_a_response(7, Ipv4Addr::new(1, 2, 3, 4), 60, true);
        let parsed = parse(&packet, 7, RecordType::A).expect("parse");
        assert!(parsed.truncated);
    }
}
