//! Concrete NAT sink (collaborator D): shells out to `nft` against a
//! dedicated table/map/chain triad, mirroring `utils/nft_wrapper.py`'s
//! `NftWrapper`.

use std::net::Ipv4Addr;
use std::process::Command;

use dnst_lib::NatSink;
use tracing::{error, warn};

const FAMILY: &str = "ip";
const TABLE: &str = "fake_ip";
const MAP_NAME: &str = "fake_ip_map";
const NAT_HOOKS: [&str; 2] = ["prerouting", "output"];

/// Synchronous `NatSink` impl. Every method shells out to `nft`, so
/// callers must dispatch through `tokio::task::spawn_blocking` -- this
/// type itself does no async work, matching the trait's sync methods.
pub struct NftNatSink;

impl NftNatSink {
    /// Idempotently create the table, map, and DNAT chains. Call once
    /// at startup before handing this sink to the fake-IP registry.
    pub fn new() -> Self {
        let sink = NftNatSink;
        sink.run(&["add", "table", FAMILY, TABLE]);
        sink.run(&[
            "add",
            "map",
            FAMILY,
            TABLE,
            MAP_NAME,
            "{ type ipv4_addr : ipv4_addr ; }",
        ]);
        for hook in NAT_HOOKS {
            let chain = format!("fake_ip_{hook}");
            let chain_spec = format!("{{ type nat hook {hook} priority -100 ; }}");
            sink.run(&["add", "chain", FAMILY, TABLE, &chain, &chain_spec]);
            sink.run(&["flush", "chain", FAMILY, TABLE, &chain]);
            sink.run(&[
                "add",
                "rule",
                FAMILY,
                TABLE,
                &chain,
                "dnat",
                "to",
                "ip",
                "daddr",
                "map",
                &format!("@{MAP_NAME}"),
            ]);
        }
        sink
    }

    fn run(&self, args: &[&str]) {
        match Command::new("nft").args(args).output() {
            Ok(out) if out.status.success() => {}
            Ok(out) => {
                warn!(
                    args = args.join(" "),
                    stderr = %String::from_utf8_lossy(&out.stderr),
                    "nft command failed"
                );
            }
            Err(e) => error!(args = args.join(" "), error = %e, "failed to spawn nft"),
        }
    }
}

impl Default for NftNatSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `nft` on a blocking-pool thread, fire-and-forget. `NatSink`'s
/// methods are synchronous (matchers/the fake-IP pool call them from
/// inside a short-lived `std::sync::Mutex` guard) so the subprocess
/// itself must never run on the calling thread; `spawn_blocking` hands
/// it to the blocking pool without the caller waiting on it.
fn run_detached(args: Vec<String>) {
    tokio::runtime::Handle::current().spawn_blocking(move || {
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        match Command::new("nft").args(&arg_refs).output() {
            Ok(out) if out.status.success() => {}
            Ok(out) => {
                warn!(
                    args = arg_refs.join(" "),
                    stderr = %String::from_utf8_lossy(&out.stderr),
                    "nft command failed"
                );
            }
            Err(e) => error!(args = arg_refs.join(" "), error = %e, "failed to spawn nft"),
        }
    });
}

impl NatSink for NftNatSink {
    fn add(&self, fake: Ipv4Addr, real: Ipv4Addr) {
        let elem = format!("{{ {fake} : {real} }}");
        run_detached(owned(&["add", "element", FAMILY, TABLE, MAP_NAME, &elem]));
    }

    fn delete(&self, fake: Ipv4Addr) {
        let elem = format!("{{ {fake} }}");
        run_detached(owned(&["delete", "element", FAMILY, TABLE, MAP_NAME, &elem]));
    }

    fn flush(&self) {
        run_detached(owned(&["flush", "map", FAMILY, TABLE, MAP_NAME]));
    }
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}
