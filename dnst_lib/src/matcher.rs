use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::RwLock;

use ipnet::Ipv4Net;

use crate::query::Query;

/// What a matcher is evaluated against: the query plus read access to
/// the engine's named sets. Kept separate from `RuleEngine` itself so
/// the matcher module doesn't need to know about chains/rules/maps.
pub struct MatchContext<'a> {
    pub query: &'a Query,
    pub sets: &'a HashMap<String, HashSet<String>>,
}

/// A side-effect-free predicate over a query (component E).
pub trait Matcher: Send + Sync + fmt::Display {
    fn eval(&self, ctx: &MatchContext) -> bool;
}

pub struct Not(pub Box<dyn Matcher>);
impl Matcher for Not {
    fn eval(&self, ctx: &MatchContext) -> bool {
        !self.0.eval(ctx)
    }
}
impl fmt::Display for Not {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not {}", self.0)
    }
}

pub struct And(pub Box<dyn Matcher>, pub Box<dyn Matcher>);
impl Matcher for And {
    fn eval(&self, ctx: &MatchContext) -> bool {
        self.0.eval(ctx) && self.1.eval(ctx)
    }
}
impl fmt::Display for And {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.1)
    }
}

pub struct Or(pub Box<dyn Matcher>, pub Box<dyn Matcher>);
impl Matcher for Or {
    fn eval(&self, ctx: &MatchContext) -> bool {
        self.0.eval(ctx) || self.1.eval(ctx)
    }
}
impl fmt::Display for Or {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} or {}", self.0, self.1)
    }
}

/// `qname P` -- either a literal/glob or a `@set` reference with
/// wildcard-suffix semantics (§4.1).
pub struct QnameMatcher {
    pub pattern: String,
}

impl QnameMatcher {
    fn match_set(qname: &str, set: &HashSet<String>) -> bool {
        if set.contains(qname) {
            return true;
        }
        let parts: Vec<&str> = qname.split('.').collect();
        for i in 1..parts.len() {
            let wildcard = format!("*.{}", parts[i..].join("."));
            if set.contains(&wildcard) {
                return true;
            }
        }
        false
    }
}

impl Matcher for QnameMatcher {
    fn eval(&self, ctx: &MatchContext) -> bool {
        if let Some(name) = self.pattern.strip_prefix('@') {
            match ctx.sets.get(name) {
                Some(set) => Self::match_set(&ctx.query.qname, set),
                None => {
                    tracing::warn!("qname matcher: unknown set '{name}'");
                    false
                }
            }
        } else {
            glob::Pattern::new(&self.pattern)
                .map(|p| p.matches(&ctx.query.qname))
                .unwrap_or(false)
        }
    }
}

impl fmt::Display for QnameMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "qname {}", self.pattern)
    }
}

/// Which field of the query an `IpMatcher` inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpField {
    Src,
    AnyAnswer,
    EveryAnswer,
}

impl fmt::Display for IpField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IpField::Src => "src",
            IpField::AnyAnswer => "anyanswer",
            IpField::EveryAnswer => "everyanswer",
        };
        write!(f, "{s}")
    }
}

/// `src IP` / `anyanswer IP` / `everyanswer IP` -- literal/CIDR or
/// `@set`. The `@set` form materializes a collapsed network list plus a
/// small membership cache on first use (§4.1 required behavior).
pub struct IpMatcher {
    pub field: IpField,
    pub pattern: String,
    resolved: RwLock<Option<ResolvedIpSet>>,
}

struct ResolvedIpSet {
    networks: Vec<Ipv4Net>,
    cache: HashMap<Ipv4Addr, bool>,
}

impl IpMatcher {
    pub fn new(field: IpField, pattern: String) -> Self {
        IpMatcher {
            field,
            pattern,
            resolved: RwLock::new(None),
        }
    }

    fn single_match(pattern: &str, ip: Ipv4Addr) -> bool {
        if let Ok(net) = pattern.parse::<Ipv4Net>() {
            return net.contains(&ip);
        }
        pattern.parse::<Ipv4Addr>().map(|lit| lit == ip).unwrap_or(false)
    }

    fn set_match(&self, ip: Ipv4Addr, set: &HashSet<String>) -> bool {
        if let Some(cached) = self
            .resolved
            .read()
            .unwrap()
            .as_ref()
            .and_then(|r| r.cache.get(&ip).copied())
        {
            return cached;
        }

        {
            let mut guard = self.resolved.write().unwrap();
            if guard.is_none() {
                let networks: Vec<Ipv4Net> = set
                    .iter()
                    .filter_map(|s| {
                        s.parse::<Ipv4Net>()
                            .ok()
                            .or_else(|| s.parse::<Ipv4Addr>().ok().map(|a| Ipv4Net::new(a, 32).unwrap()))
                    })
                    .collect();
                let collapsed = Ipv4Net::aggregate(&networks);
                *guard = Some(ResolvedIpSet {
                    networks: collapsed,
                    cache: HashMap::new(),
                });
            }
            let resolved = guard.as_mut().unwrap();
            let matched = resolved.networks.iter().any(|n| n.contains(&ip));
            resolved.cache.insert(ip, matched);
            matched
        }
    }

    fn ip_match(&self, ctx: &MatchContext, ip: Ipv4Addr) -> bool {
        if let Some(name) = self.pattern.strip_prefix('@') {
            match ctx.sets.get(name) {
                Some(set) => self.set_match(ip, set),
                None => {
                    tracing::warn!("ip matcher: unknown set '{name}'");
                    false
                }
            }
        } else {
            Self::single_match(&self.pattern, ip)
        }
    }
}

impl Matcher for IpMatcher {
    fn eval(&self, ctx: &MatchContext) -> bool {
        match self.field {
            IpField::Src => self.ip_match(ctx, ctx.query.src_ip),
            IpField::AnyAnswer => {
                if !ctx.query.has_answer() {
                    return false;
                }
                ctx.query.answer.iter().any(|(ip, _)| self.ip_match(ctx, *ip))
            }
            IpField::EveryAnswer => {
                if !ctx.query.has_answer() {
                    return false;
                }
                ctx.query.answer.iter().all(|(ip, _)| self.ip_match(ctx, *ip))
            }
        }
    }
}

impl fmt::Display for IpMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field, self.pattern)
    }
}

pub struct SrcPortMatcher {
    pub port: u16,
}
impl Matcher for SrcPortMatcher {
    fn eval(&self, ctx: &MatchContext) -> bool {
        ctx.query.src_port == self.port
    }
}
impl fmt::Display for SrcPortMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "src_port {}", self.port)
    }
}

pub struct HasAnswerMatcher;
impl Matcher for HasAnswerMatcher {
    fn eval(&self, ctx: &MatchContext) -> bool {
        ctx.query.has_answer()
    }
}
impl fmt::Display for HasAnswerMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hasanswer")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{QType, Verbosity};
    use bytes::Bytes;

    fn ctx_query(qname: &str) -> Query {
        Query::new(
            Ipv4Addr::new(192, 168, 0, 7),
            5000,
            qname,
            QType::A,
            Bytes::new(),
            Verbosity::Warn,
        )
    }

    #[test]
    fn glob_suffix_matches_subdomains_not_bare_domain() {
        let sets = HashMap::new();
        let q = ctx_query("a.b.com");
        let ctx = MatchContext { query: &q, sets: &sets };
        assert!(QnameMatcher { pattern: "*.com".into() }.eval(&ctx));

        let q2 = ctx_query("com");
        let ctx2 = MatchContext { query: &q2, sets: &sets };
        assert!(!QnameMatcher { pattern: "*.com".into() }.eval(&ctx2));
    }

    #[test]
    fn qname_set_matches_exact_and_wildcard_suffix() {
        let mut sets = HashMap::new();
        sets.insert(
            "blocked".to_string(),
            HashSet::from(["a.b.c.d".to_string(), "*.c.d".to_string()]),
        );
        let q = ctx_query("x.c.d");
        let ctx = MatchContext { query: &q, sets: &sets };
        assert!(QnameMatcher { pattern: "@blocked".into() }.eval(&ctx));

        let q2 = ctx_query("a.b.c.d");
        let ctx2 = MatchContext { query: &q2, sets: &sets };
        assert!(QnameMatcher { pattern: "@blocked".into() }.eval(&ctx2));
    }

    #[test]
    fn missing_set_is_a_non_match() {
        let sets = HashMap::new();
        let q = ctx_query("foo");
        let ctx = MatchContext { query: &q, sets: &sets };
        assert!(!QnameMatcher { pattern: "@nope".into() }.eval(&ctx));
    }

    #[test]
    fn empty_answer_never_satisfies_any_or_every() {
        let sets = HashMap::new();
        let q = ctx_query("foo");
        let ctx = MatchContext { query: &q, sets: &sets };
        let any = IpMatcher::new(IpField::AnyAnswer, "0.0.0.0/0".into());
        let every = IpMatcher::new(IpField::EveryAnswer, "0.0.0.0/0".into());
        assert!(!any.eval(&ctx));
        assert!(!every.eval(&ctx));
    }

    #[test]
    fn cidr_containment_via_set() {
        let mut sets = HashMap::new();
        sets.insert(
            "nets".to_string(),
            HashSet::from(["10.0.0.0/24".to_string(), "10.0.1.0/24".to_string()]),
        );
        let mut q = ctx_query("foo");
        q.answer.push((Ipv4Addr::new(10, 0, 0, 42), 60));
        let ctx = MatchContext { query: &q, sets: &sets };
        let m = IpMatcher::new(IpField::AnyAnswer, "@nets".into());
        assert!(m.eval(&ctx));
        // repeated eval exercises the membership cache path
        assert!(m.eval(&ctx));
    }

    #[test]
    fn src_port_exact_match() {
        let sets = HashMap::new();
        let q = ctx_query("foo");
        let ctx = MatchContext { query: &q, sets: &sets };
        assert!(SrcPortMatcher { port: 5000 }.eval(&ctx));
        assert!(!SrcPortMatcher { port: 1 }.eval(&ctx));
    }

    #[test]
    fn and_or_not_combinators() {
        let sets = HashMap::new();
        let q = ctx_query("foo");
        let ctx = MatchContext { query: &q, sets: &sets };
        let t = Box::new(HasAnswerMatcher) as Box<dyn Matcher>;
        let not_t = Not(t);
        assert!(not_t.eval(&ctx));

        let a = Box::new(SrcPortMatcher { port: 5000 }) as Box<dyn Matcher>;
        let b = Box::new(SrcPortMatcher { port: 1 }) as Box<dyn Matcher>;
        assert!(Or(a, b).eval(&ctx));
    }
}
