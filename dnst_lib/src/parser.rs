use crate::action::parse_action;
use crate::engine::{Rule, RuleEngine};
use crate::error::{Error, Result};
use crate::matcher::{And, HasAnswerMatcher, IpField, IpMatcher, Matcher, Or, QnameMatcher, SrcPortMatcher};

/// Parse the next matcher token sequence, consuming as many words as it
/// needs. Mirrors `DNSTMatcherBuilder.build`'s destructive consumption,
/// including the trailing-`and`-by-juxtaposition / explicit-`or` rule.
fn parse_matcher(words: &mut Vec<String>) -> Option<Box<dyn Matcher>> {
    if words.is_empty() {
        return None;
    }

    let head = words[0].clone();
    let built: Box<dyn Matcher> = match head.as_str() {
        "not" => {
            words.remove(0);
            let inner = parse_matcher(words)?;
            Box::new(crate::matcher::Not(inner))
        }
        "hasanswer" => {
            words.remove(0);
            Box::new(HasAnswerMatcher)
        }
        "qname" if words.len() >= 2 => {
            words.remove(0);
            let pattern = words.remove(0);
            Box::new(QnameMatcher { pattern })
        }
        "src_port" if words.len() >= 2 => {
            words.remove(0);
            let port: u16 = words.remove(0).parse().ok()?;
            Box::new(SrcPortMatcher { port })
        }
        "src" | "anyanswer" | "everyanswer" if words.len() >= 2 => {
            let field = match words.remove(0).as_str() {
                "src" => IpField::Src,
                "anyanswer" => IpField::AnyAnswer,
                _ => IpField::EveryAnswer,
            };
            let pattern = words.remove(0);
            Box::new(IpMatcher::new(field, pattern))
        }
        _ => return None,
    };

    // Juxtaposed matchers are AND-ed; an explicit `or` AND-binds looser.
    if !words.is_empty() && words[0] == "or" {
        words.remove(0);
        let rhs = parse_matcher(words)?;
        return Some(Box::new(Or(built, rhs)));
    }
    match parse_matcher(words) {
        Some(rhs) => Some(Box::new(And(built, rhs))),
        None => Some(built),
    }
}

/// `add set NAME` / `add map NAME` / `delete set NAME` / `delete map NAME`.
fn add_del_set_map(engine: &RuleEngine, is_add: bool, words: &[String]) -> Result<()> {
    if words.len() != 2 || (words[0] != "set" && words[0] != "map") {
        return Err(Error::Parse("invalid add/delete set/map syntax".to_string()));
    }
    let is_map = words[0] == "map";
    let name = &words[1];

    if is_add {
        if is_map {
            engine.maps.write().unwrap().entry(name.clone()).or_default();
        } else {
            engine.sets.write().unwrap().entry(name.clone()).or_default();
        }
    } else if is_map {
        if engine.maps.write().unwrap().remove(name).is_none() {
            return Err(Error::Reference(format!("unable to find map {name}")));
        }
    } else if engine.sets.write().unwrap().remove(name).is_none() {
        return Err(Error::Reference(format!("unable to find set {name}")));
    }
    Ok(())
}

/// `add element NAME { a b c }` / map form `add element NAME { k1 : v1 k2 : v2 }`.
fn add_del_element(engine: &RuleEngine, is_add: bool, words: &[String]) -> Result<()> {
    if words.len() < 3 || words[1] != "{" || words.last().map(String::as_str) != Some("}") {
        return Err(Error::Parse("invalid add/delete element syntax".to_string()));
    }
    let name = &words[0];
    let body = &words[2..words.len() - 1];

    let is_map = engine.maps.read().unwrap().contains_key(name);
    let is_set = engine.sets.read().unwrap().contains_key(name);
    if !is_map && !is_set {
        return Err(Error::Reference(format!("unable to find set/map: {name}")));
    }

    if is_map {
        let mut maps = engine.maps.write().unwrap();
        let target = maps.get_mut(name).unwrap();
        if is_add {
            let mut i = 0;
            while i < body.len() {
                if i + 2 >= body.len() || body[i + 1] != ":" {
                    return Err(Error::Parse("invalid add element (maps) syntax".to_string()));
                }
                target.insert(body[i].clone(), body[i + 2].clone());
                i += 3;
            }
        } else {
            for key in body {
                target.remove(key);
            }
        }
    } else {
        let mut sets = engine.sets.write().unwrap();
        let target = sets.get_mut(name).unwrap();
        if is_add {
            for item in body {
                target.insert(item.clone());
            }
        } else {
            for item in body {
                target.remove(item);
            }
        }
    }
    Ok(())
}

/// `add rule HOOK [matchers] action [action...] [index N]` / `delete rule
/// HOOK index N`.
fn add_del_rule(engine: &RuleEngine, is_add: bool, mut words: Vec<String>) -> Result<()> {
    if words.is_empty() {
        return Err(Error::Parse("missing chain name".to_string()));
    }
    let hook = words.remove(0);
    if !engine.has_chain(&hook) {
        return Err(Error::Reference(format!("chain {hook} does not exist")));
    }

    if !is_add {
        if words.len() != 2 || words[0] != "index" || words[1].parse::<usize>().is_err() {
            return Err(Error::Parse("invalid delete rule syntax".to_string()));
        }
        let index: usize = words[1].parse().unwrap();
        if !engine.delete_rule(&hook, index) {
            return Err(Error::Reference(format!("{hook} rulechain has no rule with index {index}")));
        }
        return Ok(());
    }

    let matcher = parse_matcher(&mut words);
    let mut actions = Vec::new();
    while let Some(action) = parse_action(&mut words) {
        actions.push(action);
    }
    if actions.is_empty() {
        return Err(Error::Parse("rule requires at least one action".to_string()));
    }

    let mut index = None;
    if words.first().map(String::as_str) == Some("index") {
        words.remove(0);
        let Some(idx_str) = words.first() else {
            return Err(Error::Parse("invalid 'index' syntax".to_string()));
        };
        index = Some(idx_str.parse::<usize>().map_err(|_| Error::Parse("invalid 'index' syntax".to_string()))?);
        words.remove(0);
    }

    if !words.is_empty() {
        return Err(Error::Parse(format!("failed to parse cmd at {}", words.join(" "))));
    }

    let rule = Rule { matcher, actions, hook: hook.clone() };
    engine.add_rule(&hook, rule, index);
    Ok(())
}

fn add_del_chain(engine: &RuleEngine, is_add: bool, words: &[String]) -> Result<()> {
    if words.len() != 1 {
        return Err(Error::Parse("invalid add/delete chain syntax".to_string()));
    }
    let name = &words[0];
    if is_add {
        engine.add_chain(name);
    } else {
        engine.delete_chain(name);
    }
    Ok(())
}

fn tokenize(line: &str) -> Vec<String> {
    line.replace(',', "").split_whitespace().map(str::to_string).collect()
}

/// Run one policy command line against `engine` (component G). Mirrors
/// `dnst_engine.cmd`'s dispatch, with Rust `Result` in place of the
/// distilled source's string-or-`None` convention.
pub fn run_command(engine: &RuleEngine, line: &str) -> Result<()> {
    let mut words = tokenize(line);
    if words.is_empty() {
        return Ok(());
    }
    if words.len() < 3 {
        return Err(Error::Parse("command too short".to_string()));
    }

    let is_add = match words.remove(0).as_str() {
        "add" => true,
        "delete" => false,
        other => return Err(Error::Parse(format!("unknown command {other}"))),
    };

    match words[0].as_str() {
        "set" | "map" => add_del_set_map(engine, is_add, &words),
        "rule" => add_del_rule(engine, is_add, words[1..].to_vec()),
        "element" => add_del_element(engine, is_add, &words[1..]),
        "chain" => add_del_chain(engine, is_add, &words[1..]),
        other => Err(Error::Parse(format!("unknown keyword {other}"))),
    }
}

/// `list` dump, roughly mirroring `DNSTables.__str__`.
pub fn render_tables(engine: &RuleEngine) -> String {
    let mut out = String::new();
    for (name, set) in engine.sets.read().unwrap().iter() {
        out.push_str(&format!("set {name} {{\n"));
        for item in set {
            out.push_str(&format!("\t{item}\n"));
        }
        out.push_str("}\n\n");
    }
    for (name, map) in engine.maps.read().unwrap().iter() {
        out.push_str(&format!("map {name} {{\n"));
        for (k, v) in map {
            out.push_str(&format!("\t{k} : {v}\n"));
        }
        out.push_str("}\n\n");
    }
    for (hook_index, hook) in engine.hooks_snapshot().iter().enumerate() {
        out.push_str(&format!("chain [{hook_index}] {hook} {{\n"));
        for (index, rule) in engine.rules_snapshot(hook).iter().enumerate() {
            out.push_str(&format!("\t[{index}] {rule}\n"));
        }
        out.push_str("}\n\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_chain_then_rule_then_list_round_trips() {
        let engine = RuleEngine::new();
        run_command(&engine, "add chain preresolve").unwrap();
        run_command(&engine, "add rule preresolve src 192.168.0.0/24 drop").unwrap();
        let out = render_tables(&engine);
        assert!(out.contains("preresolve"));
        assert!(out.contains("drop"));
    }

    #[test]
    fn add_rule_requires_at_least_one_action() {
        let engine = RuleEngine::new();
        run_command(&engine, "add chain preresolve").unwrap();
        let err = run_command(&engine, "add rule preresolve src 10.0.0.0/8").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn add_rule_to_unknown_chain_is_rejected() {
        let engine = RuleEngine::new();
        let err = run_command(&engine, "add rule nope drop").unwrap_err();
        assert!(matches!(err, Error::Reference(_)));
    }

    #[test]
    fn add_set_then_add_element_populates_it() {
        let engine = RuleEngine::new();
        run_command(&engine, "add set blocked").unwrap();
        run_command(&engine, "add element blocked { *.ads.example }").unwrap();
        assert!(engine.sets.read().unwrap()["blocked"].contains("*.ads.example"));
    }

    #[test]
    fn add_map_then_add_element_populates_key_value_pairs() {
        let engine = RuleEngine::new();
        run_command(&engine, "add map hosts").unwrap();
        run_command(&engine, "add element hosts { example.com : 1.2.3.4 }").unwrap();
        assert_eq!(engine.maps.read().unwrap()["hosts"]["example.com"], "1.2.3.4");
    }

    #[test]
    fn delete_rule_by_index_removes_it() {
        let engine = RuleEngine::new();
        run_command(&engine, "add chain preresolve").unwrap();
        run_command(&engine, "add rule preresolve drop").unwrap();
        run_command(&engine, "delete rule preresolve index 0").unwrap();
        assert!(engine.rules_snapshot("preresolve").is_empty());
    }

    #[test]
    fn and_juxtaposition_and_explicit_or_both_parse() {
        let mut words = tokenize("src 10.0.0.0/8 src_port 53");
        assert!(parse_matcher(&mut words).is_some());
        assert!(words.is_empty());

        let mut words2 = tokenize("qname *.ads.example or qname *.tracker.example");
        assert!(parse_matcher(&mut words2).is_some());
        assert!(words2.is_empty());
    }
}
