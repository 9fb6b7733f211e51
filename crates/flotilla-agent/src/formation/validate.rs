use std::collections::{HashMap, HashSet, VecDeque};

use flotilla_core::error::{FlotillaError, Result};

use super::definition::{AgentSpec, FormationDefinition, NodeKind};
use super::expr::{guard_node, is_supported_guard};

fn invalid(message: impl Into<String>) -> FlotillaError {
    FlotillaError::InvalidFormation(message.into())
}

/// Check a definition before anything runs: required fields per node kind,
/// edge endpoints, guard syntax, acyclicity, and that node guards read from
/// a node that has finished before the edge is evaluated.
pub fn validate(def: &FormationDefinition) -> Result<()> {
    if def.name.trim().is_empty() {
        return Err(invalid("name is required"));
    }
    if def.nodes.is_empty() {
        return Err(invalid("nodes is required"));
    }

    let mut ids = HashSet::with_capacity(def.nodes.len());
    for node in &def.nodes {
        if node.id.is_empty() {
            return Err(invalid("node id is required"));
        }
        if !ids.insert(node.id.as_str()) {
            return Err(invalid(format!("duplicate node id: {}", node.id)));
        }

        match node.node_kind() {
            Some(NodeKind::Agent) => {
                let agent = node.agent.as_ref().ok_or_else(|| {
                    invalid(format!("node {:?} kind agent requires agent config", node.id))
                })?;
                check_agent(agent, &format!("node {:?} requires agent", node.id))?;
            }
            Some(NodeKind::Fleet) => {
                let fleet = node.fleet.as_ref().ok_or_else(|| {
                    invalid(format!("node {:?} kind fleet requires fleet config", node.id))
                })?;
                let agent = fleet.agent.as_ref().ok_or_else(|| {
                    invalid(format!("node {:?} fleet requires agent config", node.id))
                })?;
                if fleet.fanout_from.trim().is_empty() {
                    return Err(invalid(format!("node {:?} fleet requires fanout_from", node.id)));
                }
                check_agent(agent, &format!("node {:?} fleet agent requires", node.id))?;
            }
            Some(NodeKind::Join) => {}
            None => {
                return Err(invalid(format!(
                    "node {:?} has unsupported kind {:?}",
                    node.id, node.kind
                )));
            }
        }
    }

    for edge in &def.edges {
        if edge.from.is_empty() || edge.to.is_empty() {
            return Err(invalid("edge from and to are required"));
        }
        if !ids.contains(edge.from.as_str()) {
            return Err(invalid(format!("edge references unknown from node {:?}", edge.from)));
        }
        if !ids.contains(edge.to.as_str()) {
            return Err(invalid(format!("edge references unknown to node {:?}", edge.to)));
        }
        if !is_supported_guard(edge.guard(), ids.iter().copied()) {
            return Err(invalid(format!(
                "edge {} -> {} has unsupported guard {:?}",
                edge.from,
                edge.to,
                edge.guard()
            )));
        }
    }

    check_acyclic(def)?;
    check_guard_sources(def)
}

/// A `<node>.<path>` guard must name the edge's source or one of its
/// ancestors; any other node may not have run yet.
fn check_guard_sources(def: &FormationDefinition) -> Result<()> {
    let mut incoming: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &def.edges {
        incoming.entry(edge.to.as_str()).or_default().push(edge.from.as_str());
    }

    for edge in &def.edges {
        let Some(node) = guard_node(edge.guard()) else {
            continue;
        };
        if !upstream_of(&incoming, &edge.from).contains(node) {
            return Err(invalid(format!(
                "edge {} -> {} guard {:?} reads node {:?}, which is not upstream of {:?}",
                edge.from,
                edge.to,
                edge.guard(),
                node,
                edge.from
            )));
        }
    }
    Ok(())
}

/// `id` plus every node with a path to it.
fn upstream_of<'a>(incoming: &HashMap<&'a str, Vec<&'a str>>, id: &'a str) -> HashSet<&'a str> {
    let mut seen = HashSet::from([id]);
    let mut queue = VecDeque::from([id]);
    while let Some(current) = queue.pop_front() {
        for &from in incoming.get(current).map(Vec::as_slice).unwrap_or_default() {
            if seen.insert(from) {
                queue.push_back(from);
            }
        }
    }
    seen
}

fn check_agent(agent: &AgentSpec, prefix: &str) -> Result<()> {
    if agent.provider.trim().is_empty() || agent.model.trim().is_empty() {
        return Err(invalid(format!("{} provider and model", prefix)));
    }
    if agent.output_schema.is_none() {
        return Err(invalid(format!("{} output_schema", prefix)));
    }
    Ok(())
}

/// Kahn's algorithm: the graph is acyclic iff every node is dequeued once.
fn check_acyclic(def: &FormationDefinition) -> Result<()> {
    let mut indegree: HashMap<&str, usize> = def.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut adjacent: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &def.edges {
        adjacent.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
        *indegree.entry(edge.to.as_str()).or_default() += 1;
    }

    let mut queue: VecDeque<&str> = def
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| indegree.get(id) == Some(&0))
        .collect();

    let mut visited = 0;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        for &to in adjacent.get(id).map(Vec::as_slice).unwrap_or_default() {
            if let Some(d) = indegree.get_mut(to) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(to);
                }
            }
        }
    }

    if visited != def.nodes.len() {
        return Err(FlotillaError::CyclicGraph);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> FormationDefinition {
        FormationDefinition::from_json(json).unwrap()
    }

    const AGENT: &str = r#"{"provider": "anthropic", "model": "m", "output_schema": {"type": "object"}}"#;

    fn agent_node(id: &str) -> String {
        format!(r#"{{"id": "{}", "kind": "agent", "agent": {}}}"#, id, AGENT)
    }

    #[test]
    fn test_valid_graph() {
        let def = parse(&format!(
            r#"{{"name": "f", "nodes": [{}, {}, {{"id": "j", "kind": "join"}}],
                "edges": [{{"from": "a", "to": "b"}}, {{"from": "b", "to": "j", "when": "output.ok"}}]}}"#,
            agent_node("a"),
            agent_node("b")
        ));
        validate(&def).unwrap();
    }

    #[test]
    fn test_cycle_rejected() {
        let def = parse(&format!(
            r#"{{"name": "f", "nodes": [{}, {}, {}],
                "edges": [{{"from": "a", "to": "b"}}, {{"from": "b", "to": "c"}}, {{"from": "c", "to": "b"}}]}}"#,
            agent_node("a"),
            agent_node("b"),
            agent_node("c")
        ));
        let err = validate(&def).unwrap_err();
        assert!(matches!(err, FlotillaError::CyclicGraph));
        assert_eq!(err.to_string(), "graph must be acyclic");
    }

    #[test]
    fn test_self_loop_rejected() {
        let def = parse(r#"{"name": "f", "nodes": [{"id": "j", "kind": "join"}], "edges": [{"from": "j", "to": "j"}]}"#);
        assert!(matches!(validate(&def), Err(FlotillaError::CyclicGraph)));
    }

    #[test]
    fn test_structural_errors() {
        let cases = [
            (r#"{"name": " ", "nodes": []}"#.to_string(), "name is required"),
            (r#"{"name": "f", "nodes": []}"#.to_string(), "nodes is required"),
            (r#"{"name": "f", "nodes": [{"id": "", "kind": "join"}]}"#.to_string(), "node id is required"),
            (
                r#"{"name": "f", "nodes": [{"id": "a", "kind": "join"}, {"id": "a", "kind": "join"}]}"#.to_string(),
                "duplicate node id: a",
            ),
            (
                r#"{"name": "f", "nodes": [{"id": "a", "kind": "loop"}]}"#.to_string(),
                r#"node "a" has unsupported kind "loop""#,
            ),
            (
                r#"{"name": "f", "nodes": [{"id": "a", "kind": "join"}], "edges": [{"from": "a", "to": "z"}]}"#.to_string(),
                r#"edge references unknown to node "z""#,
            ),
            (
                r#"{"name": "f", "nodes": [{"id": "a", "kind": "join"}], "edges": [{"from": "", "to": "a"}]}"#.to_string(),
                "edge from and to are required",
            ),
        ];
        for (json, expected) in cases {
            let err = validate(&parse(&json)).unwrap_err();
            assert!(err.to_string().contains(expected), "{} vs {}", err, expected);
        }
    }

    #[test]
    fn test_agent_requirements() {
        let def = parse(r#"{"name": "f", "nodes": [{"id": "a", "kind": "agent"}]}"#);
        assert!(validate(&def).unwrap_err().to_string().contains("requires agent config"));

        let def = parse(r#"{"name": "f", "nodes": [{"id": "a", "kind": "agent", "agent": {"provider": "p"}}]}"#);
        assert!(validate(&def).unwrap_err().to_string().contains(r#"node "a" requires agent provider and model"#));

        let def = parse(r#"{"name": "f", "nodes": [{"id": "a", "kind": "agent", "agent": {"provider": "p", "model": "m"}}]}"#);
        assert!(validate(&def).unwrap_err().to_string().contains("requires agent output_schema"));
    }

    #[test]
    fn test_fleet_requirements() {
        let def = parse(r#"{"name": "f", "nodes": [{"id": "w", "kind": "fleet"}]}"#);
        assert!(validate(&def).unwrap_err().to_string().contains("requires fleet config"));

        let def = parse(r#"{"name": "f", "nodes": [{"id": "w", "kind": "fleet", "fleet": {"fanout_from": "input.items"}}]}"#);
        assert!(validate(&def).unwrap_err().to_string().contains("fleet requires agent config"));

        let def = parse(&format!(
            r#"{{"name": "f", "nodes": [{{"id": "w", "kind": "fleet", "fleet": {{"agent": {}}}}}]}}"#,
            AGENT
        ));
        assert!(validate(&def).unwrap_err().to_string().contains("fleet requires fanout_from"));

        let def = parse(r#"{"name": "f", "nodes": [{"id": "w", "kind": "fleet", "fleet": {"fanout_from": "input.items", "agent": {"provider": "p", "model": "m"}}}]}"#);
        assert!(validate(&def).unwrap_err().to_string().contains("fleet agent requires output_schema"));
    }

    #[test]
    fn test_unsupported_guard() {
        let def = parse(
            r#"{"name": "f", "nodes": [{"id": "a", "kind": "join"}, {"id": "b", "kind": "join"}],
                "edges": [{"from": "a", "to": "b", "when": "score > 3"}]}"#,
        );
        let err = validate(&def).unwrap_err();
        assert!(err.to_string().contains("unsupported guard"));
    }

    #[test]
    fn test_node_guard_must_be_upstream() {
        let def = parse(&format!(
            r#"{{"name": "f", "nodes": [{}, {}, {}, {{"id": "j", "kind": "join"}}],
                "edges": [{{"from": "a", "to": "b"}}, {{"from": "b", "to": "j", "when": "a.ok"}},
                          {{"from": "c", "to": "j", "when": "c.ok"}}]}}"#,
            agent_node("a"),
            agent_node("b"),
            agent_node("c")
        ));
        validate(&def).unwrap();

        let def = parse(&format!(
            r#"{{"name": "f", "nodes": [{}, {}, {{"id": "j", "kind": "join"}}],
                "edges": [{{"from": "a", "to": "j", "when": "b.ok"}}]}}"#,
            agent_node("a"),
            agent_node("b")
        ));
        let err = validate(&def).unwrap_err();
        assert!(matches!(err, FlotillaError::InvalidFormation(_)));
        assert!(err.to_string().contains(r#"reads node "b", which is not upstream of "a""#), "{}", err);
    }
}
