use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

/// One upstream A-record reply, already parsed down to what `forward`
/// cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamReply {
    pub answers: Vec<(Ipv4Addr, u32)>,
}

/// The external upstream-resolution integration (component J). The
/// concrete UDP implementation lives in the binary crate; tests inject
/// a `mockall`-generated mock so `forward` can be exercised without a
/// socket.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait UpstreamForwarder: Send + Sync {
    // automock must sit under async_trait so it sees the desugared
    // signature -- see mockall's docs on mocking async traits.
    /// Send `raw_query` to `upstream` and wait up to `timeout` for a
    /// reply. `Ok(None)` means the upstream answered with a non-NOERROR
    /// rcode; the caller logs and moves on exactly like a timeout.
    async fn forward(
        &self,
        upstream: (Ipv4Addr, u16),
        raw_query: Bytes,
        timeout: Duration,
    ) -> std::io::Result<Option<UpstreamReply>>;
}
