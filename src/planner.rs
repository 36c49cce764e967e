//! Startup planner: decides how every node resumes after a restart or a
//! config change, one weakly connected subgraph at a time.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::{Change, ChangeKind, MineMeldConfig},
    mgmtbus::NodeStateInfo,
};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Reset,
    Initialize,
    Rebuild,
}

impl Action {
    /// Management bus command carrying this action.
    pub fn command(self) -> &'static str {
        match self {
            Action::Reset => "reset",
            Action::Initialize => "initialize",
            Action::Rebuild => "rebuild",
        }
    }
}

pub type Plan = BTreeMap<String, Action>;

/// Nodes missing from `state_info` are planned as if they had no checkpoint.
pub fn plan(config: &MineMeldConfig, state_info: &BTreeMap<String, NodeStateInfo>) -> Plan {
    let mut out = Plan::new();
    for component in components(config) {
        let part = plan_component(config, state_info, &component);
        debug!(nodes = component.len(), ?part, "planner: subgraph planned");
        out.extend(part);
    }
    out
}

/*──────── graph ────────*/

/// Weakly connected components, each sorted by node name. Inputs naming
/// unknown nodes are ignored.
pub fn components(config: &MineMeldConfig) -> Vec<Vec<String>> {
    let mut adj: BTreeMap<&str, BTreeSet<&str>> = config
        .nodes
        .keys()
        .map(|n| (n.as_str(), BTreeSet::new()))
        .collect();
    for (name, node) in &config.nodes {
        for input in &node.inputs {
            if !config.nodes.contains_key(input) {
                continue;
            }
            if let Some(e) = adj.get_mut(name.as_str()) {
                e.insert(input.as_str());
            }
            if let Some(e) = adj.get_mut(input.as_str()) {
                e.insert(name.as_str());
            }
        }
    }

    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut out = Vec::new();
    for &start in adj.keys() {
        if !seen.insert(start) {
            continue;
        }
        let mut component = vec![start.to_string()];
        let mut queue = VecDeque::from([start]);
        while let Some(n) = queue.pop_front() {
            for &next in adj.get(n).into_iter().flatten() {
                if seen.insert(next) {
                    component.push(next.to_string());
                    queue.push_back(next);
                }
            }
        }
        component.sort();
        out.push(component);
    }
    out
}

/*──────── per-subgraph rules ────────*/

fn checkpoint_of<'a>(state_info: &'a BTreeMap<String, NodeStateInfo>, node: &str) -> Option<&'a str> {
    state_info.get(node).and_then(|s| s.checkpoint.as_deref())
}

fn plan_component(
    config: &MineMeldConfig,
    state_info: &BTreeMap<String, NodeStateInfo>,
    nodes: &[String],
) -> Plan {
    let checkpoint = |n: &str| checkpoint_of(state_info, n);
    let is_source = |n: &str| config.is_source(n);
    let changes: Vec<&Change> = nodes.iter().flat_map(|n| config.changes_for(n)).collect();
    let has_change = |n: &str, kind: ChangeKind| config.changes_for(n).any(|c| c.kind == kind);
    let all = |action: Action| -> Plan { nodes.iter().map(|n| (n.clone(), action)).collect() };

    // Buckets in first-seen order over sorted node names.
    let mut buckets: Vec<(Option<&str>, Vec<&str>)> = Vec::new();
    for n in nodes {
        let cp = checkpoint(n.as_str());
        match buckets.iter_mut().find(|(k, _)| *k == cp) {
            Some((_, members)) => members.push(n.as_str()),
            None => buckets.push((cp, vec![n.as_str()])),
        }
    }

    // 1. first run of this subgraph
    if buckets.len() == 1 && buckets[0].0.is_none() {
        return all(Action::Reset);
    }

    // 2. consistent restart
    if buckets.len() == 1 && changes.is_empty() {
        return all(Action::Initialize);
    }

    // 3. quorum: non-null bucket holding the most sources, first wins ties
    let mut quorum: Option<&str> = None;
    let mut best = 0usize;
    for (cp, members) in &buckets {
        let Some(cp) = *cp else { continue };
        let sources = members.iter().filter(|&&n| is_source(n)).count();
        if quorum.is_none() || sources > best {
            quorum = Some(cp);
            best = sources;
        }
    }

    // 4. invalid nodes
    let invalid: BTreeSet<&str> = nodes
        .iter()
        .map(String::as_str)
        .filter(|&n| {
            let cp = checkpoint(n);
            (cp.is_some() && cp != quorum)
                || (cp.is_none() && !has_change(n, ChangeKind::Added))
                || has_change(n, ChangeKind::InputDeleted)
        })
        .collect();

    let rebuild_from_quorum = |extra_reset: &BTreeSet<&str>| -> Plan {
        nodes
            .iter()
            .map(|n| {
                let action = if extra_reset.contains(n.as_str())
                    || !is_source(n.as_str())
                    || checkpoint(n.as_str()) != quorum
                {
                    Action::Reset
                } else {
                    Action::Rebuild
                };
                (n.clone(), action)
            })
            .collect()
    };

    // 5. inconsistent state somewhere
    if !invalid.is_empty() {
        return rebuild_from_quorum(&invalid);
    }

    // 6. only new sources were plugged in
    let added_sources: BTreeSet<&str> = changes
        .iter()
        .filter(|c| c.kind == ChangeKind::Added && is_source(c.nodename.as_str()))
        .map(|c| c.nodename.as_str())
        .collect();
    let only_source_additions = changes.iter().all(|c| match c.kind {
        ChangeKind::Added => added_sources.contains(c.nodename.as_str()),
        ChangeKind::InputAdded => c
            .detail
            .as_deref()
            .is_some_and(|d| added_sources.contains(d)),
        ChangeKind::Deleted | ChangeKind::InputDeleted => false,
    });
    if only_source_additions {
        return nodes
            .iter()
            .map(|n| {
                let action = if added_sources.contains(n.as_str()) {
                    Action::Reset
                } else {
                    Action::Initialize
                };
                (n.clone(), action)
            })
            .collect();
    }

    // 7. topology changed downstream of the sources
    rebuild_from_quorum(&BTreeSet::new())
}
