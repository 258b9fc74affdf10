//! Multi-server resolution algorithm (spec §4.7), independent of any
//! caller-owned `Reactor` — this runs its own `mio::Poll` loop and blocks
//! the calling thread until it has an answer or times out.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Token};

use crate::dns::query::{ActiveQuery, QueryStatus};
use crate::dns::record::{Record, RecordType};
use crate::dns::socket_factory::SocketFactory;
use crate::error::Error;

/// One server to query, and which transport to start with.
#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub force_tcp: bool,
}

impl ServerConfig {
    pub fn udp(addr: SocketAddr) -> Self {
        ServerConfig { addr, force_tcp: false }
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        ServerConfig { addr, force_tcp: true }
    }
}

/// Resolves `name` against every server in `servers`, returning as soon as
/// the first non-empty, validly-signed answer arrives (spec §4.7 steps a-h).
pub fn resolve(
    name: &str,
    qtype: RecordType,
    servers: &[ServerConfig],
    factory: &dyn SocketFactory,
    timeout: Duration,
) -> crate::Result<Vec<Record>> {
    if servers.is_empty() {
        return Err(Error::InvalidParameter("no dns servers configured"));
    }

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(64);
    let mut queries = Vec::new();
    let mut next_token = 0usize;

    for server in servers {
        if let Ok(q) = ActiveQuery::spawn(&mut poll, Token(next_token), name, qtype, server.addr, server.force_tcp, factory) {
            queries.push(q);
            next_token += 1;
        }
    }
    if queries.is_empty() {
        return Err(Error::InvalidParameter("failed to start any dns query"));
    }

    let start = Instant::now();
    let mut end_time = start + timeout;
    let mut empty_result: Option<Vec<Record>> = None;

    loop {
        for q in queries.iter_mut() {
            q.step(qtype);
        }

        // A truncated UDP answer is retried once over TCP to the same
        // server; the UDP query itself is retired.
        let retry_servers: Vec<SocketAddr> = queries
            .iter_mut()
            .filter_map(|q| {
                if matches!(q.status, QueryStatus::NeedsTcpRetry) {
                    q.status = QueryStatus::Errored;
                    Some(q.server)
                } else {
                    None
                }
            })
            .collect();
        for server in retry_servers {
            #[cfg(feature = "log")]
            log::debug!("dns answer from {server} was truncated, retrying over tcp");
            if let Ok(q) = ActiveQuery::spawn(&mut poll, Token(next_token), name, qtype, server, true, factory) {
                queries.push(q);
                next_token += 1;
            }
        }

        for q in &queries {
            if let QueryStatus::Done(parsed) = &q.status {
                if !parsed.records.is_empty() {
                    return Ok(parsed.records.clone());
                }
            }
        }
        if empty_result.is_none()
            && queries.iter().any(|q| matches!(&q.status, QueryStatus::Done(p) if p.records.is_empty()))
        {
            empty_result = Some(Vec::new());
            end_time = end_time.min(Instant::now() + Duration::from_secs(1));
        }

        if queries.iter().all(|q| !matches!(q.status, QueryStatus::Active)) {
            return match empty_result {
                Some(records) => Ok(records),
                None => Err(Error::NotFound),
            };
        }

        let now = Instant::now();
        if now >= end_time {
            #[cfg(feature = "log")]
            log::warn!("dns resolution of {name} timed out against all servers");
            return match empty_result {
                Some(records) => Ok(records),
                None => Err(Error::Timeout),
            };
        }
        let wait = end_time.saturating_duration_since(now).min(Duration::from_secs(1));
        poll.poll(&mut events, Some(wait))?;
    }
}
