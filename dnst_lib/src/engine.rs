use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

use async_recursion::async_recursion;

use crate::action::{Action, ActionContext, ActionOutcome};
use crate::cache::Cache;
use crate::fakeip::{FakeIpRegistry, NatSink};
use crate::forwarder::UpstreamForwarder;
use crate::matcher::{MatchContext, Matcher};
use crate::query::{Query, Verbosity};

/// Recursion depth above which a `jump`/`call` cycle is assumed runaway
/// and the query is dropped instead of looping forever. The distilled
/// source has no such guard; any chain graph with a cycle hangs it.
const MAX_TRANSITION_DEPTH: u32 = 64;

/// One rule: an optional matcher and an ordered action list, mirroring
/// `DNSTRule` in the distilled source. Immutable once built; `chains`
/// stores these behind `Arc` so a chain's rule list can be snapshotted
/// for iteration without holding the engine's lock across an `.await`.
pub struct Rule {
    pub matcher: Option<Box<dyn Matcher>>,
    pub actions: Vec<Box<dyn Action>>,
    pub hook: String,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let actions_str: Vec<String> = self.actions.iter().map(|a| a.render()).collect();
        match &self.matcher {
            Some(m) => write!(f, "{m} {}", actions_str.join(" ")),
            None => write!(f, "{}", actions_str.join(" ")),
        }
    }
}

impl Rule {
    async fn apply(&self, query: &mut Query, ctx: &EvalContext<'_>, index: usize) -> ActionOutcome {
        let matched = match &self.matcher {
            Some(m) => ctx.engine.eval_matcher(m.as_ref(), &*query),
            None => true,
        };

        if !matched {
            query.trace(Verbosity::Debug, || "skipped rule".to_string());
            query.flush_trace();
            return ActionOutcome::Continue;
        }

        let qname = query.qname.clone();
        let hook = self.hook.clone();
        query.trace(Verbosity::Debug, move || format!("query matched in chain {hook}[{index}]: qname={qname}"));

        let mut outcome = ActionOutcome::Continue;
        for action in &self.actions {
            outcome = if let Some(hook) = action.as_call() {
                ctx.engine.call(query, ctx, hook.to_string()).await
            } else {
                let maps = ctx.engine.maps.read().unwrap().clone();
                let action_ctx = ActionContext {
                    qname: query.qname.clone(),
                    qtype: query.qtype,
                    raw_query: query.raw_query.clone(),
                    maps,
                    cache: ctx.cache,
                    fake_ip_registry: ctx.fake_ip_registry,
                    nat: ctx.nat,
                    forwarder: ctx.forwarder,
                };
                action.act(query, &action_ctx).await
            };

            if outcome != ActionOutcome::Continue {
                break;
            }
        }

        query.flush_trace();
        outcome
    }
}

/// Borrowed, per-call bundle of collaborators `feed`/`call` need at
/// every recursion level. Keeps `RuleEngine::feed`'s signature from
/// growing a parameter per collaborator.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    pub engine: &'a RuleEngine,
    pub cache: &'a Cache,
    pub fake_ip_registry: &'a FakeIpRegistry,
    pub nat: &'a Arc<dyn NatSink>,
    pub forwarder: &'a dyn UpstreamForwarder,
    pub depth: u32,
}

/// Which way `feed` was entered: the default chain sequence (falls
/// through to the next chain when a rule chain finishes without an
/// explicit verdict) or an explicit hook name from `jump`/`call`
/// (never falls through -- the distilled source's attempt to do so in
/// that case, comparing a `None` hook index against an int, is itself
/// a bug; this type makes the two cases unrepresentable as the same
/// state instead of reproducing it).
enum Entry {
    Default(usize),
    Named(String),
}

/// The policy engine (components E-H taken together): named sets/maps,
/// an ordered list of chain names ("hooks"), and the rules within each.
/// All mutable state sits behind `std::sync::RwLock` so matchers never
/// suspend while holding a lock.
#[derive(Default)]
pub struct RuleEngine {
    pub sets: RwLock<HashMap<String, HashSet<String>>>,
    pub maps: RwLock<HashMap<String, HashMap<String, String>>>,
    hooks: RwLock<Vec<String>>,
    chains: RwLock<HashMap<String, Vec<Arc<Rule>>>>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_chain(&self, name: &str) {
        let mut hooks = self.hooks.write().unwrap();
        if !hooks.iter().any(|h| h == name) {
            hooks.push(name.to_string());
            self.chains.write().unwrap().insert(name.to_string(), Vec::new());
        }
    }

    pub fn delete_chain(&self, name: &str) {
        self.hooks.write().unwrap().retain(|h| h != name);
        self.chains.write().unwrap().remove(name);
    }

    pub fn add_rule(&self, hook: &str, rule: Rule, at_index: Option<usize>) -> bool {
        let mut chains = self.chains.write().unwrap();
        let Some(list) = chains.get_mut(hook) else { return false };
        let index = at_index.unwrap_or(list.len()).min(list.len());
        list.insert(index, Arc::new(rule));
        true
    }

    pub fn delete_rule(&self, hook: &str, index: usize) -> bool {
        let mut chains = self.chains.write().unwrap();
        let Some(list) = chains.get_mut(hook) else { return false };
        if index >= list.len() {
            return false;
        }
        list.remove(index);
        true
    }

    pub fn has_chain(&self, hook: &str) -> bool {
        self.chains.read().unwrap().contains_key(hook)
    }

    /// Snapshot for `chain list` dumps / debugging; not on the query
    /// hot path.
    pub fn hooks_snapshot(&self) -> Vec<String> {
        self.hooks.read().unwrap().clone()
    }

    pub fn rules_snapshot(&self, hook: &str) -> Vec<Arc<Rule>> {
        self.chains.read().unwrap().get(hook).cloned().unwrap_or_default()
    }

    fn eval_matcher(&self, matcher: &dyn Matcher, query: &Query) -> bool {
        let sets = self.sets.read().unwrap();
        let ctx = MatchContext { query, sets: &sets };
        matcher.eval(&ctx)
    }

    /// Entry point: evaluate `query` starting at `hook`, or the first
    /// default chain if `hook` is `None`.
    pub async fn feed(
        &self,
        query: &mut Query,
        cache: &Cache,
        fake_ip_registry: &FakeIpRegistry,
        nat: &Arc<dyn NatSink>,
        forwarder: &dyn UpstreamForwarder,
        hook: Option<&str>,
    ) -> ActionOutcome {
        let ctx = EvalContext {
            engine: self,
            cache,
            fake_ip_registry,
            nat,
            forwarder,
            depth: 0,
        };

        let entry = match hook {
            Some(h) => Entry::Named(h.to_string()),
            None => Entry::Default(0),
        };
        self.feed_entry(query, &ctx, entry).await
    }

    #[async_recursion]
    async fn feed_entry(&self, query: &mut Query, ctx: &EvalContext<'_>, entry: Entry) -> ActionOutcome {
        if ctx.depth > MAX_TRANSITION_DEPTH {
            query.trace(Verbosity::Err, || "transition depth exceeded, dropping query".to_string());
            query.flush_trace();
            return ActionOutcome::Drop;
        }

        let hook_name = match &entry {
            Entry::Default(idx) => match self.hooks.read().unwrap().get(*idx) {
                Some(h) => h.clone(),
                None => return ActionOutcome::Continue,
            },
            Entry::Named(h) => {
                if !self.has_chain(h) {
                    let h = h.clone();
                    query.trace(Verbosity::Err, move || format!("unknown chain name {h}"));
                    query.flush_trace();
                    return ActionOutcome::Drop;
                }
                h.clone()
            }
        };

        query.trace(Verbosity::Debug, || format!("enter chain {hook_name}"));
        query.flush_trace();

        let rules = self.rules_snapshot(&hook_name);
        let mut fell_through = true;

        for (i, rule) in rules.iter().enumerate() {
            let outcome = rule.apply(query, ctx, i).await;
            match outcome {
                ActionOutcome::Continue => continue,
                ActionOutcome::Break => {
                    fell_through = true;
                    break;
                }
                ActionOutcome::Return => return ActionOutcome::Continue,
                ActionOutcome::Jump(h) => {
                    let deeper = EvalContext { depth: ctx.depth + 1, ..*ctx };
                    return self.feed_entry(query, &deeper, Entry::Named(h)).await;
                }
                ActionOutcome::Drop => return ActionOutcome::Drop,
            }
        }

        if fell_through {
            if let Entry::Default(idx) = entry {
                let next = idx + 1;
                if self.hooks.read().unwrap().len() > next {
                    let deeper = EvalContext { depth: ctx.depth + 1, ..*ctx };
                    return self.feed_entry(query, &deeper, Entry::Default(next)).await;
                }
            }
        }

        ActionOutcome::Continue
    }

    /// Resolve a `call H` in place: re-enter `feed` at `hook` one level
    /// deeper and hand back its verdict so the calling rule's action
    /// loop can keep going on `Continue`.
    async fn call(&self, query: &mut Query, ctx: &EvalContext<'_>, hook: String) -> ActionOutcome {
        query.trace(Verbosity::Debug, {
            let hook = hook.clone();
            move || format!("calling to hook {hook}")
        });
        let inner = EvalContext { depth: ctx.depth + 1, ..*ctx };
        self.feed_entry(query, &inner, Entry::Named(hook)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{parse_action, DropAction, ResolveAction};
    use crate::fakeip::{FakeIpRegistry, NullNatSink};
    use crate::forwarder::MockUpstreamForwarder;
    use crate::matcher::{HasAnswerMatcher, Not};
    use crate::query::QType;
    use bytes::Bytes;
    use std::net::Ipv4Addr;

    fn rule(hook: &str, matcher: Option<Box<dyn Matcher>>, actions: Vec<Box<dyn Action>>) -> Rule {
        Rule { matcher, actions, hook: hook.to_string() }
    }

    fn new_query() -> Query {
        Query::new(Ipv4Addr::new(10, 0, 0, 1), 5000, "example.com", QType::A, Bytes::new(), Verbosity::Debug)
    }

    async fn run(engine: &RuleEngine, query: &mut Query, hook: Option<&str>) -> ActionOutcome {
        let cache = Cache::new();
        let registry = FakeIpRegistry::new();
        let nat: Arc<dyn NatSink> = Arc::new(NullNatSink);
        let forwarder = MockUpstreamForwarder::new();
        engine.feed(query, &cache, &registry, &nat, &forwarder, hook).await
    }

    #[tokio::test]
    async fn falls_through_from_default_chain_to_the_next() {
        let engine = RuleEngine::new();
        engine.add_chain("preresolve");
        engine.add_chain("postresolve");
        engine.add_rule(
            "preresolve",
            rule("preresolve", None, vec![Box::new(ResolveAction { mapped_answer: "1.1.1.1".into() })]),
            None,
        );
        engine.add_rule("postresolve", rule("postresolve", None, vec![Box::new(DropAction)]), None);

        let mut q = new_query();
        let outcome = run(&engine, &mut q, None).await;
        assert_eq!(outcome, ActionOutcome::Drop);
        assert_eq!(q.answer, vec![(Ipv4Addr::new(1, 1, 1, 1), 3600)]);
    }

    #[tokio::test]
    async fn return_absorbs_the_verdict_and_skips_later_chains() {
        let engine = RuleEngine::new();
        engine.add_chain("preresolve");
        engine.add_chain("postresolve");
        engine.add_rule("preresolve", rule("preresolve", None, vec![Box::new(crate::action::ReturnAction)]), None);
        engine.add_rule("postresolve", rule("postresolve", None, vec![Box::new(DropAction)]), None);

        let mut q = new_query();
        let outcome = run(&engine, &mut q, None).await;
        assert_eq!(outcome, ActionOutcome::Continue);
    }

    #[tokio::test]
    async fn break_skips_rest_of_chain_but_still_falls_through() {
        let engine = RuleEngine::new();
        engine.add_chain("preresolve");
        engine.add_chain("postresolve");
        engine.add_rule(
            "preresolve",
            rule("preresolve", None, vec![Box::new(crate::action::BreakAction)]),
            None,
        );
        engine.add_rule(
            "preresolve",
            rule("preresolve", None, vec![Box::new(DropAction)]),
            None,
        );
        engine.add_rule("postresolve", rule("postresolve", None, vec![Box::new(DropAction)]), None);

        let mut q = new_query();
        let outcome = run(&engine, &mut q, None).await;
        assert_eq!(outcome, ActionOutcome::Drop);
    }

    #[tokio::test]
    async fn jump_bypasses_the_rest_of_the_current_chain() {
        let engine = RuleEngine::new();
        engine.add_chain("preresolve");
        engine.add_chain("postresolve");
        engine.add_rule(
            "preresolve",
            rule("preresolve", None, vec![Box::new(crate::action::JumpAction { hook: "postresolve".into() })]),
            None,
        );
        engine.add_rule("preresolve", rule("preresolve", None, vec![Box::new(DropAction)]), None);
        engine.add_rule(
            "postresolve",
            rule("postresolve", None, vec![Box::new(ResolveAction { mapped_answer: "2.2.2.2".into() })]),
            None,
        );

        let mut q = new_query();
        let outcome = run(&engine, &mut q, None).await;
        assert_eq!(outcome, ActionOutcome::Continue);
        assert_eq!(q.answer, vec![(Ipv4Addr::new(2, 2, 2, 2), 3600)]);
    }

    #[tokio::test]
    async fn jump_to_unknown_chain_drops() {
        let engine = RuleEngine::new();
        engine.add_chain("preresolve");
        engine.add_rule(
            "preresolve",
            rule("preresolve", None, vec![Box::new(crate::action::JumpAction { hook: "nope".into() })]),
            None,
        );

        let mut q = new_query();
        let outcome = run(&engine, &mut q, None).await;
        assert_eq!(outcome, ActionOutcome::Drop);
    }

    #[tokio::test]
    async fn call_resumes_the_calling_chain_on_continue() {
        let engine = RuleEngine::new();
        engine.add_chain("preresolve");
        engine.add_chain("helper");
        engine.add_rule(
            "preresolve",
            rule(
                "preresolve",
                None,
                vec![
                    Box::new(crate::action::CallAction { hook: "helper".into() }),
                    Box::new(ResolveAction { mapped_answer: "3.3.3.3".into() }),
                ],
            ),
            None,
        );
        engine.add_rule(
            "helper",
            rule("helper", None, vec![Box::new(crate::action::VerboseAction { level: Verbosity::Info, label: "info".into() })]),
            None,
        );

        let mut q = new_query();
        let outcome = run(&engine, &mut q, None).await;
        assert_eq!(outcome, ActionOutcome::Continue);
        assert_eq!(q.answer, vec![(Ipv4Addr::new(3, 3, 3, 3), 3600)]);
    }

    #[tokio::test]
    async fn matcher_gates_rule_application() {
        let engine = RuleEngine::new();
        engine.add_chain("preresolve");
        let not_has_answer: Box<dyn Matcher> = Box::new(Not(Box::new(HasAnswerMatcher)));
        engine.add_rule(
            "preresolve",
            rule("preresolve", Some(not_has_answer), vec![Box::new(ResolveAction { mapped_answer: "4.4.4.4".into() })]),
            None,
        );

        let mut q = new_query();
        q.answer.push((Ipv4Addr::new(9, 9, 9, 9), 60));
        run(&engine, &mut q, None).await;
        assert_eq!(q.answer, vec![(Ipv4Addr::new(9, 9, 9, 9), 60)]);
    }

    #[tokio::test]
    async fn cyclic_jump_eventually_drops_instead_of_hanging() {
        let engine = RuleEngine::new();
        engine.add_chain("a");
        engine.add_chain("b");
        engine.add_rule("a", rule("a", None, vec![Box::new(crate::action::JumpAction { hook: "b".into() })]), None);
        engine.add_rule("b", rule("b", None, vec![Box::new(crate::action::JumpAction { hook: "a".into() })]), None);

        let mut q = new_query();
        let outcome = run(&engine, &mut q, Some("a")).await;
        assert_eq!(outcome, ActionOutcome::Drop);
    }

    #[test]
    fn delete_rule_out_of_range_is_rejected() {
        let engine = RuleEngine::new();
        engine.add_chain("preresolve");
        assert!(!engine.delete_rule("preresolve", 0));
    }

    #[test]
    fn parse_action_still_works_alongside_engine_types() {
        let mut words = vec!["cache".to_string()];
        assert!(parse_action(&mut words).is_some());
    }
}
