use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::Cache;
use crate::fakeip::{FakeIpRegistry, NatSink};
use crate::forwarder::UpstreamForwarder;
use crate::query::{QType, Query, Verbosity};

/// What a rule's action list decided, mirroring `DNSTRule.apply`'s
/// string verdicts (`None`/`"break"`/`"return"`/`"drop"`/`"jump2hook
/// H"`) as a real enum instead of sentinel strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Nothing decided; move to the next action, or the next rule.
    Continue,
    /// Stop walking the current chain's rules; fall through to the
    /// next chain in sequence (if this chain was entered by default).
    Break,
    /// Stop the whole `RuleEngine::feed` traversal for this query.
    Return,
    /// Drop the query outright. Propagates up through every caller.
    Drop,
    /// Abandon the rest of this chain and resume evaluation at `hook`.
    Jump(String),
}

/// Everything an action needs besides the query itself. Built once per
/// `feed` call and threaded down by reference -- no action holds its
/// own reference to engine-owned state.
pub struct ActionContext<'a> {
    pub qname: String,
    pub qtype: QType,
    pub raw_query: bytes::Bytes,
    /// A snapshot of the engine's named maps, cloned before the call so
    /// the engine's `RwLock` is never held across an `.await`.
    pub maps: HashMap<String, HashMap<String, String>>,
    pub cache: &'a Cache,
    pub fake_ip_registry: &'a FakeIpRegistry,
    pub nat: &'a Arc<dyn NatSink>,
    pub forwarder: &'a dyn UpstreamForwarder,
}

/// One policy action (component F). `act` is given mutable access to
/// the query so it can append to `query.answer`, adjust verbosity, or
/// trace -- matching the distilled source's `act(query, **kwargs)`.
#[async_trait]
pub trait Action: Send + Sync {
    async fn act(&self, query: &mut Query, ctx: &ActionContext<'_>) -> ActionOutcome;

    /// Rendered form used by `chain list` dumps.
    fn render(&self) -> String;

    /// `Some(hook)` only for `CallAction`. The engine special-cases this
    /// to recurse into `RuleEngine::feed` with depth tracking instead of
    /// going through `act`, since only the engine can call itself.
    fn as_call(&self) -> Option<&str> {
        None
    }
}

macro_rules! control_action {
    ($name:ident, $outcome:expr, $word:literal) => {
        pub struct $name;

        #[async_trait]
        impl Action for $name {
            async fn act(&self, _query: &mut Query, _ctx: &ActionContext<'_>) -> ActionOutcome {
                $outcome
            }

            fn render(&self) -> String {
                $word.to_string()
            }
        }
    };
}

control_action!(DummyAction, ActionOutcome::Continue, "dummy");
control_action!(BreakAction, ActionOutcome::Break, "break");
control_action!(ReturnAction, ActionOutcome::Return, "return");
control_action!(DropAction, ActionOutcome::Drop, "drop");

pub struct JumpAction {
    pub hook: String,
}

#[async_trait]
impl Action for JumpAction {
    async fn act(&self, query: &mut Query, _ctx: &ActionContext<'_>) -> ActionOutcome {
        let hook = self.hook.clone();
        query.trace(Verbosity::Debug, || format!("jumping to hook {hook}"));
        ActionOutcome::Jump(self.hook.clone())
    }

    fn render(&self) -> String {
        format!("jump {}", self.hook)
    }
}

/// `call H` -- invoked inline; the engine resolves this by recursing
/// into `RuleEngine::feed(hook)` and handing back whatever verdict that
/// sub-traversal produced, so the calling rule's action loop can
/// continue (or stop) exactly as if `call` were any other action. The
/// actual recursion lives in `engine.rs`, since it needs `&RuleEngine`;
/// this variant is interpreted there rather than carrying out the
/// call itself.
pub struct CallAction {
    pub hook: String,
}

#[async_trait]
impl Action for CallAction {
    async fn act(&self, _query: &mut Query, _ctx: &ActionContext<'_>) -> ActionOutcome {
        // Never reached: `Rule::apply` intercepts `as_call()` first.
        ActionOutcome::Continue
    }

    fn render(&self) -> String {
        format!("call {}", self.hook)
    }

    fn as_call(&self) -> Option<&str> {
        Some(&self.hook)
    }
}

pub struct VerboseAction {
    pub level: Verbosity,
    pub label: String,
}

#[async_trait]
impl Action for VerboseAction {
    async fn act(&self, query: &mut Query, _ctx: &ActionContext<'_>) -> ActionOutcome {
        query.set_verbose(self.level);
        let label = self.label.clone();
        query.trace(Verbosity::Debug, || format!("verbose level set to {label}"));
        ActionOutcome::Continue
    }

    fn render(&self) -> String {
        format!("verbose {}", self.label)
    }
}

pub struct CacheAction;

#[async_trait]
impl Action for CacheAction {
    async fn act(&self, query: &mut Query, ctx: &ActionContext<'_>) -> ActionOutcome {
        if query.has_answer() {
            ctx.cache.cache(&ctx.qname, ctx.qtype, &query.answer, query.fake_pool_ref.clone());
        }
        ActionOutcome::Continue
    }

    fn render(&self) -> String {
        "cache".to_string()
    }
}

pub struct CacheCheckAction;

#[async_trait]
impl Action for CacheCheckAction {
    async fn act(&self, query: &mut Query, ctx: &ActionContext<'_>) -> ActionOutcome {
        if query.has_answer() {
            query.trace(Verbosity::Debug, || "already got an answer, do nothing".to_string());
            return ActionOutcome::Continue;
        }
        let cached = ctx.cache.get(&ctx.qname, ctx.qtype);
        if !cached.is_empty() {
            query.answer = cached.clone();
            query.trace(Verbosity::Info, || {
                let parts: Vec<String> = cached.iter().map(|(ip, ttl)| format!("{ip}(ttl={ttl})")).collect();
                format!("cache check returns answer {}", parts.join(", "))
            });
        }
        ActionOutcome::Continue
    }

    fn render(&self) -> String {
        "cachecheck".to_string()
    }
}

pub struct ResolveFileAction {
    pub hosts_file: String,
}

#[async_trait]
impl Action for ResolveFileAction {
    async fn act(&self, query: &mut Query, ctx: &ActionContext<'_>) -> ActionOutcome {
        if query.has_answer() {
            query.trace(Verbosity::Debug, || "already got an answer, do nothing".to_string());
            return ActionOutcome::Continue;
        }

        let contents = match tokio::fs::read_to_string(&self.hosts_file).await {
            Ok(c) => c,
            Err(e) => {
                query.trace(Verbosity::Err, || format!("failed to read hosts file {}: {e}", self.hosts_file));
                return ActionOutcome::Continue;
            }
        };

        for line in contents.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let Some(ip_str) = parts.next() else { continue };
            let hostnames: Vec<&str> = parts.collect();
            if hostnames.is_empty() {
                continue;
            }
            let Ok(ip) = ip_str.parse::<Ipv4Addr>() else { continue };

            // Both sides lowercased before comparing -- the distilled
            // source only lowercases the hostnames and silently never
            // matches mixed-case qnames as a result.
            if hostnames.iter().any(|h| h.to_ascii_lowercase() == ctx.qname) {
                query.answer = vec![(ip, 3600)];
                let file = self.hosts_file.clone();
                query.trace(Verbosity::Info, move || format!("hosts file {file} returns answer {ip} ttl 3600"));
                break;
            }
        }
        ActionOutcome::Continue
    }

    fn render(&self) -> String {
        format!("resolvefile {}", self.hosts_file)
    }
}

pub struct ResolveAction {
    pub mapped_answer: String,
}

#[async_trait]
impl Action for ResolveAction {
    async fn act(&self, query: &mut Query, ctx: &ActionContext<'_>) -> ActionOutcome {
        if query.has_answer() {
            query.trace(Verbosity::Debug, || "already got an answer, do nothing".to_string());
            return ActionOutcome::Continue;
        }

        if let Some(map_name) = self.mapped_answer.strip_prefix('@') {
            let Some(ip_map) = ctx.maps.get(map_name) else {
                let name = self.mapped_answer.clone();
                query.trace(Verbosity::Warn, move || format!("cannot find map '{name}'"));
                return ActionOutcome::Continue;
            };
            if let Some(ip_str) = ip_map.get(&ctx.qname) {
                if let Ok(ip) = ip_str.parse::<Ipv4Addr>() {
                    query.answer = vec![(ip, 3600)];
                    let map_name = self.mapped_answer.clone();
                    query.trace(Verbosity::Info, move || format!("local resolve {map_name} returns answer {ip} ttl 3600"));
                }
            }
            return ActionOutcome::Continue;
        }

        if let Ok(ip) = self.mapped_answer.parse::<Ipv4Addr>() {
            query.answer = vec![(ip, 3600)];
            query.trace(Verbosity::Info, move || format!("local resolve returns answer {ip} ttl 3600"));
        }
        ActionOutcome::Continue
    }

    fn render(&self) -> String {
        format!("resolvelocal {}", self.mapped_answer)
    }
}

pub struct ForwardAction {
    pub upstream: String,
}

fn parse_upstream(server: &str) -> Option<(Ipv4Addr, u16)> {
    if let Some((ip_str, port_str)) = server.split_once(':') {
        let ip = ip_str.parse().ok()?;
        let port = port_str.parse().ok()?;
        Some((ip, port))
    } else {
        server.parse().ok().map(|ip| (ip, 53))
    }
}

#[async_trait]
impl Action for ForwardAction {
    async fn act(&self, query: &mut Query, ctx: &ActionContext<'_>) -> ActionOutcome {
        if query.has_answer() {
            query.trace(Verbosity::Debug, || "already got an answer, do nothing".to_string());
            return ActionOutcome::Continue;
        }

        let upstream_server = if let Some(map_name) = self.upstream.strip_prefix('@') {
            let Some(upstream_map) = ctx.maps.get(map_name) else {
                let name = self.upstream.clone();
                query.trace(Verbosity::Warn, move || format!("cannot find map '{name}'"));
                return ActionOutcome::Continue;
            };
            // Keyed by the actual qname, not the literal string "qname".
            match upstream_map.get(&ctx.qname) {
                Some(s) => s.clone(),
                None => return ActionOutcome::Continue,
            }
        } else {
            self.upstream.clone()
        };

        let Some((ip, port)) = parse_upstream(&upstream_server) else {
            query.trace(Verbosity::Warn, move || format!("invalid upstream '{upstream_server}'"));
            return ActionOutcome::Continue;
        };

        query.trace(Verbosity::Debug, move || format!("forwarding to upstream {ip}:{port}..."));
        let raw_query = ctx.raw_query.clone();
        match ctx.forwarder.forward((ip, port), raw_query, Duration::from_secs(5)).await {
            Ok(Some(reply)) => {
                query.answer = reply.answers.clone();
                query.trace(Verbosity::Info, move || {
                    let parts: Vec<String> = reply.answers.iter().map(|(ip, ttl)| format!("{ip}(ttl={ttl})")).collect();
                    format!("received upstream reply {}", parts.join(","))
                });
            }
            Ok(None) => {
                query.trace(Verbosity::Info, move || format!("upstream {ip}:{port} returned an error rcode"));
            }
            Err(e) => {
                query.trace(Verbosity::Info, move || format!("forwarding DNS query to upstream {ip}:{port} failed: {e}"));
            }
        }
        ActionOutcome::Continue
    }

    fn render(&self) -> String {
        format!("forward {}", self.upstream)
    }
}

pub struct FakeIpAction {
    pub fake_net: ipnet::Ipv4Net,
}

#[async_trait]
impl Action for FakeIpAction {
    async fn act(&self, query: &mut Query, ctx: &ActionContext<'_>) -> ActionOutcome {
        if !query.has_answer() {
            query.trace(Verbosity::Debug, || "no answer received, skip".to_string());
            return ActionOutcome::Continue;
        }
        if query.fake_pool_ref.is_some() {
            query.trace(Verbosity::Debug, || "fake ip already set, skip".to_string());
            return ActionOutcome::Continue;
        }

        let pool = ctx.fake_ip_registry.pool_for(self.fake_net, ctx.nat);
        // Only the first answer is mapped if multiple were returned.
        let (real_ip, ttl) = query.answer[0];
        let Some(fake_ip) = pool.register(&ctx.qname, real_ip) else {
            let net = self.fake_net;
            let qname = ctx.qname.clone();
            query.trace(Verbosity::Err, move || format!("unable to map {qname}({real_ip}) to fake net {net}"));
            return ActionOutcome::Continue;
        };

        query.answer = vec![(fake_ip, ttl)];
        query.fake_pool_ref = Some(pool);
        let net = self.fake_net;
        let qname = ctx.qname.clone();
        query.trace(Verbosity::Info, move || format!("replace answer {real_ip} for {qname} with fake ip {fake_ip} from {net}"));
        ActionOutcome::Continue
    }

    fn render(&self) -> String {
        format!("fakeip {}", self.fake_net)
    }
}

/// Parse a single action token sequence, consuming as many words as the
/// action needs (mirrors `DNSTActionBuilder.build`'s destructive
/// consumption of the command word list).
pub fn parse_action(words: &mut Vec<String>) -> Option<Box<dyn Action>> {
    if words.is_empty() {
        return None;
    }
    let name = words[0].as_str();
    let action: Box<dyn Action> = match name {
        "dummy" => Box::new(DummyAction),
        "break" => Box::new(BreakAction),
        "return" => Box::new(ReturnAction),
        "drop" => Box::new(DropAction),
        "jump" if words.len() >= 2 => Box::new(JumpAction { hook: words[1].clone() }),
        "call" if words.len() >= 2 => Box::new(CallAction { hook: words[1].clone() }),
        "verbose" if words.len() >= 2 => {
            let level = Verbosity::parse(&words[1])?;
            Box::new(VerboseAction { level, label: words[1].clone() })
        }
        "cache" => Box::new(CacheAction),
        "cachecheck" => Box::new(CacheCheckAction),
        "resolvefile" if words.len() >= 2 => Box::new(ResolveFileAction { hosts_file: words[1].clone() }),
        "resolvelocal" if words.len() >= 2 => Box::new(ResolveAction { mapped_answer: words[1].clone() }),
        "forward" if words.len() >= 2 => Box::new(ForwardAction { upstream: words[1].clone() }),
        "fakeip" if words.len() >= 2 => Box::new(FakeIpAction { fake_net: words[1].parse().ok()? }),
        _ => return None,
    };

    let consumed = match name {
        "jump" | "call" | "verbose" | "resolvefile" | "resolvelocal" | "forward" | "fakeip" => 2,
        _ => 1,
    };
    words.drain(..consumed);
    Some(action)
}
