//! Concrete upstream forwarder (collaborator J): sends the raw query
//! over UDP to the configured resolver and parses whatever comes back,
//! mirroring `ForwardAction.act`'s socket logic in the distilled source.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::info;

use dnst_lib::{UpstreamForwarder, UpstreamReply};

const RECV_BUFFER: usize = 512;

pub struct UdpForwarder;

#[async_trait]
impl UpstreamForwarder for UdpForwarder {
    async fn forward(
        &self,
        upstream: (Ipv4Addr, u16),
        raw_query: Bytes,
        timeout: Duration,
    ) -> std::io::Result<Option<UpstreamReply>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let addr = SocketAddr::from(upstream);
        socket.send_to(&raw_query, addr).await?;

        let mut buf = [0u8; RECV_BUFFER];
        let recv = tokio::time::timeout(timeout, socket.recv(&mut buf)).await;
        let n = match recv {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                info!(upstream = %addr, "upstream forward timed out");
                return Ok(None);
            }
        };

        match parse_upstream_reply(&buf[..n]) {
            Some(reply) => Ok(Some(reply)),
            None => Ok(None),
        }
    }
}

/// Pull `(ip, ttl)` pairs out of an upstream's A-record answers. Reuses
/// the same wire parser as the inbound side -- a DNS reply and a DNS
/// query share the same message framing, just with the answer section
/// populated.
fn parse_upstream_reply(data: &[u8]) -> Option<UpstreamReply> {
    use hickory_proto::rr::RData;
    use hickory_proto::serialize::binary::BinDecodable;

    let message = hickory_proto::op::Message::from_bytes(data).ok()?;
    let answers: Vec<(Ipv4Addr, u32)> = message
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some((a.0, record.ttl())),
            _ => None,
        })
        .collect();

    if answers.is_empty() {
        None
    } else {
        Some(UpstreamReply { answers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_with_no_a_records_yields_none() {
        let request = {
            let mut m = hickory_proto::op::Message::new();
            m.set_id(7);
            m
        };
        let raw = {
            use hickory_proto::serialize::binary::BinEncodable;
            request.to_vec().unwrap()
        };
        assert!(parse_upstream_reply(&raw).is_none());
    }
}
