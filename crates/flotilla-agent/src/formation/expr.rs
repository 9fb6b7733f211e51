//! The small expression language used by edge maps, edge guards, fan-out
//! sources and fleet task mappings.
//!
//! Edge expressions resolve `output`, `output.<path>`, `input`,
//! `input.<path>` or `<node>.<path>` against completed node outputs.
//! Anything else evaluates to itself as a string literal.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use flotilla_core::error::{FlotillaError, Result};

use super::definition::EdgeSpec;

/// Outputs of completed nodes, by node id.
pub type NodeOutputs = BTreeMap<String, Map<String, Value>>;

pub const GUARD_ALWAYS: &str = "always";
pub const GUARD_ALL_WORKERS_DONE: &str = "all_workers_done";

/// Follow a dot path through nested objects. Missing keys and non-object
/// intermediates yield `Null`.
pub fn get_path(root: &Map<String, Value>, parts: &[&str]) -> Value {
    let Some((first, rest)) = parts.split_first() else {
        return Value::Object(root.clone());
    };
    let mut current = match root.get(*first) {
        Some(v) => v,
        None => return Value::Null,
    };
    for part in rest {
        current = match current.as_object().and_then(|m| m.get(*part)) {
            Some(v) => v,
            None => return Value::Null,
        };
    }
    current.clone()
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('.').collect()
}

pub fn eval_edge_expr(
    expr: &str,
    input: &Map<String, Value>,
    output: &Map<String, Value>,
    outputs: &NodeOutputs,
) -> Value {
    let expr = expr.trim();
    match expr {
        "output" => return Value::Object(output.clone()),
        "input" => return Value::Object(input.clone()),
        _ => {}
    }
    if let Some(path) = expr.strip_prefix("output.") {
        return get_path(output, &split_path(path));
    }
    if let Some(path) = expr.strip_prefix("input.") {
        return get_path(input, &split_path(path));
    }

    node_path(expr, outputs).unwrap_or_else(|| Value::String(expr.to_string()))
}

/// Resolve `<node>.<path>` against a completed node's output. `None` when
/// the expression has no path or the node has not produced output.
fn node_path(expr: &str, outputs: &NodeOutputs) -> Option<Value> {
    let parts = split_path(expr);
    if parts.len() < 2 {
        return None;
    }
    outputs.get(parts[0]).map(|root| get_path(root, &parts[1..]))
}

/// Node id a `<node>.<path>` guard reads from, if it is one.
pub fn guard_node(guard: &str) -> Option<&str> {
    let guard = guard.trim();
    if guard.starts_with("output.") || guard.starts_with("input.") {
        return None;
    }
    match guard.split_once('.') {
        Some((node, path)) if !node.is_empty() && !path.is_empty() => Some(node),
        _ => None,
    }
}

/// Evaluate a task-mapping expression against one fan-out item.
pub fn eval_item_expr(expr: &str, item: &Value) -> Value {
    let expr = expr.trim();
    if expr == "item" {
        return item.clone();
    }
    if let Some(path) = expr.strip_prefix("item.") {
        if let Some(obj) = item.as_object() {
            return get_path(obj, &split_path(path));
        }
    }
    Value::String(expr.to_string())
}

/// Resolve a fleet's `fanout_from` path to the array of items to fan out.
pub fn resolve_fanout_items(
    fanout: &str,
    input: &Map<String, Value>,
    outputs: &NodeOutputs,
) -> Result<Vec<Value>> {
    let value = if let Some(path) = fanout.strip_prefix("input.") {
        get_path(input, &split_path(path))
    } else {
        let parts = split_path(fanout);
        if parts.len() < 2 {
            return Err(FlotillaError::invalid_input(format!(
                "invalid fanout_from path: {}",
                fanout
            )));
        }
        let root = outputs.get(parts[0]).ok_or_else(|| {
            FlotillaError::invalid_input(format!(
                "fanout_from references unknown node output: {}",
                parts[0]
            ))
        })?;
        get_path(root, &parts[1..])
    };

    match value {
        Value::Array(items) => Ok(items),
        _ => Err(FlotillaError::invalid_input("fanout value must be an array")),
    }
}

/// JSON truthiness: null, false, zero and empty values are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Whether `guard` is syntax the runtime can evaluate.
pub fn is_supported_guard<'a>(guard: &str, mut node_ids: impl Iterator<Item = &'a str>) -> bool {
    let guard = guard.trim();
    match guard {
        "" | GUARD_ALWAYS | GUARD_ALL_WORKERS_DONE | "output" | "input" => true,
        _ if guard.starts_with("output.") || guard.starts_with("input.") => true,
        _ => match guard.split_once('.') {
            Some((node, path)) if !path.is_empty() => node_ids.any(|id| id == node),
            _ => false,
        },
    }
}

pub fn guard_fires(
    guard: &str,
    input: &Map<String, Value>,
    output: &Map<String, Value>,
    outputs: &NodeOutputs,
) -> bool {
    match guard.trim() {
        "" | GUARD_ALWAYS => true,
        GUARD_ALL_WORKERS_DONE => output.get(GUARD_ALL_WORKERS_DONE) == Some(&Value::Bool(true)),
        // A node guard only fires on that node's actual output.
        expr if guard_node(expr).is_some() => node_path(expr, outputs).is_some_and(|v| truthy(&v)),
        expr => truthy(&eval_edge_expr(expr, input, output, outputs)),
    }
}

/// Payload an edge delivers downstream, or `None` if its guard does not fire.
pub fn map_edge_payload(
    edge: &EdgeSpec,
    input: &Map<String, Value>,
    output: &Map<String, Value>,
    outputs: &NodeOutputs,
) -> Option<Map<String, Value>> {
    if !guard_fires(edge.guard(), input, output, outputs) {
        return None;
    }
    if edge.map.is_empty() {
        return Some(output.clone());
    }
    Some(
        edge.map
            .iter()
            .map(|(key, expr)| (key.clone(), eval_edge_expr(expr, input, output, outputs)))
            .collect(),
    )
}

/// Prompt text for a payload: a non-empty `message` string verbatim,
/// otherwise the payload as JSON (`{}` when empty).
pub fn message_for(payload: &Map<String, Value>) -> String {
    if let Some(Value::String(message)) = payload.get("message") {
        if !message.is_empty() {
            return message.clone();
        }
    }
    Value::Object(payload.clone()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    fn outputs() -> NodeOutputs {
        let mut outputs = NodeOutputs::new();
        outputs.insert("plan".into(), obj(json!({"topics": ["a", "b"], "meta": {"n": 2}})));
        outputs
    }

    #[test]
    fn test_edge_expressions() {
        let input = obj(json!({"goal": "ship", "cfg": {"depth": 3}}));
        let output = obj(json!({"summary": "done", "score": {"value": 7}}));
        let outs = outputs();

        assert_eq!(eval_edge_expr("output", &input, &output, &outs), Value::Object(output.clone()));
        assert_eq!(eval_edge_expr(" output.score.value ", &input, &output, &outs), json!(7));
        assert_eq!(eval_edge_expr("input.cfg.depth", &input, &output, &outs), json!(3));
        assert_eq!(eval_edge_expr("input", &input, &output, &outs), Value::Object(input.clone()));
        assert_eq!(eval_edge_expr("plan.meta.n", &input, &output, &outs), json!(2));
        assert_eq!(eval_edge_expr("output.missing.deep", &input, &output, &outs), Value::Null);
        assert_eq!(eval_edge_expr("other.x", &input, &output, &outs), json!("other.x"));
        assert_eq!(eval_edge_expr("literal", &input, &output, &outs), json!("literal"));
    }

    #[test]
    fn test_item_expressions() {
        let item = json!({"title": "T", "nested": {"k": 1}});
        assert_eq!(eval_item_expr("item", &item), item);
        assert_eq!(eval_item_expr("item.nested.k", &item), json!(1));
        assert_eq!(eval_item_expr("item.title", &json!("scalar")), json!("item.title"));
        assert_eq!(eval_item_expr("fixed", &item), json!("fixed"));
    }

    #[test]
    fn test_fanout_sources() {
        let input = obj(json!({"items": ["x", "y", "z"], "n": 1}));
        let outs = outputs();

        assert_eq!(resolve_fanout_items("input.items", &input, &outs).unwrap().len(), 3);
        assert_eq!(resolve_fanout_items("plan.topics", &input, &outs).unwrap(), vec![json!("a"), json!("b")]);

        let err = resolve_fanout_items("items", &input, &outs).unwrap_err();
        assert!(err.to_string().contains("invalid fanout_from path: items"));
        let err = resolve_fanout_items("ghost.items", &input, &outs).unwrap_err();
        assert!(err.to_string().contains("unknown node output: ghost"));
        let err = resolve_fanout_items("input.n", &input, &outs).unwrap_err();
        assert!(err.to_string().contains("must be an array"));
    }

    #[test]
    fn test_guards() {
        let input = Map::new();
        let outs = outputs();
        let done = obj(json!({"all_workers_done": true, "flag": 0}));
        let pending = obj(json!({"all_workers_done": "yes"}));

        assert!(guard_fires("", &input, &pending, &outs));
        assert!(guard_fires("always", &input, &pending, &outs));
        assert!(guard_fires("all_workers_done", &input, &done, &outs));
        assert!(!guard_fires("all_workers_done", &input, &pending, &outs));
        assert!(!guard_fires("output.flag", &input, &done, &outs));
        assert!(guard_fires("plan.topics", &input, &done, &outs));
        assert!(!guard_fires("output.nothing", &input, &done, &outs));
    }

    #[test]
    fn test_guard_on_unfinished_node_does_not_fire() {
        let input = Map::new();
        let output = obj(json!({"ok": true}));
        let mut outs = outputs();
        assert!(!guard_fires("review.ok", &input, &output, &outs));

        outs.insert("review".into(), obj(json!({"ok": false})));
        assert!(!guard_fires("review.ok", &input, &output, &outs));
        outs.insert("review".into(), obj(json!({"ok": true})));
        assert!(guard_fires("review.ok", &input, &output, &outs));
    }

    #[test]
    fn test_guard_node() {
        assert_eq!(guard_node(" plan.ready "), Some("plan"));
        assert_eq!(guard_node("output.ok"), None);
        assert_eq!(guard_node("input.flag"), None);
        assert_eq!(guard_node("always"), None);
        assert_eq!(guard_node("plan."), None);
    }

    #[test]
    fn test_supported_guards() {
        let ids = ["plan", "review"];
        assert!(is_supported_guard("all_workers_done", ids.iter().copied()));
        assert!(is_supported_guard("output.ok", ids.iter().copied()));
        assert!(is_supported_guard("plan.ready", ids.iter().copied()));
        assert!(!is_supported_guard("ghost.ready", ids.iter().copied()));
        assert!(!is_supported_guard("score > 3", ids.iter().copied()));
        assert!(!is_supported_guard("plan.", ids.iter().copied()));
    }

    #[test]
    fn test_map_edge_payload() {
        let input = obj(json!({"goal": "g"}));
        let output = obj(json!({"x": 1, "all_workers_done": false}));
        let outs = NodeOutputs::new();

        let passthrough = EdgeSpec {
            from: "a".into(),
            to: "b".into(),
            ..EdgeSpec::default()
        };
        assert_eq!(map_edge_payload(&passthrough, &input, &output, &outs), Some(output.clone()));

        let mut mapped = passthrough.clone();
        mapped.map.insert("value".into(), "output.x".into());
        mapped.map.insert("goal".into(), "input.goal".into());
        assert_eq!(
            map_edge_payload(&mapped, &input, &output, &outs),
            Some(obj(json!({"value": 1, "goal": "g"})))
        );

        let mut guarded = passthrough;
        guarded.when = Some("all_workers_done".into());
        assert_eq!(map_edge_payload(&guarded, &input, &output, &outs), None);
    }

    #[test]
    fn test_message_for() {
        assert_eq!(message_for(&Map::new()), "{}");
        assert_eq!(message_for(&obj(json!({"message": "do it", "x": 1}))), "do it");
        assert_eq!(message_for(&obj(json!({"message": "", "x": 1}))), r#"{"message":"","x":1}"#);
        assert_eq!(message_for(&obj(json!({"item": "a"}))), r#"{"item":"a"}"#);
    }
}
