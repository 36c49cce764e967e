use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

fn default_output() -> bool {
    true
}

/// One graph node as written in the running config.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default = "default_output")]
    pub output: bool,
    #[serde(default, alias = "prototype")]
    pub class: String,
    #[serde(default)]
    pub config: Value,
}

impl NodeConfig {
    pub fn is_source(&self) -> bool {
        self.inputs.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Added,
    Deleted,
    InputAdded,
    InputDeleted,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Change {
    pub nodename: String,
    #[serde(default)]
    pub nodeclass: String,
    #[serde(rename = "change")]
    pub kind: ChangeKind,
    /// Input name for `INPUT_ADDED` / `INPUT_DELETED`.
    #[serde(default)]
    pub detail: Option<String>,
}

impl Change {
    fn new(nodename: &str, nodeclass: &str, kind: ChangeKind, detail: Option<&str>) -> Self {
        Self {
            nodename: nodename.to_string(),
            nodeclass: nodeclass.to_string(),
            kind,
            detail: detail.map(str::to_string),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct MineMeldConfig {
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeConfig>,
    #[serde(default)]
    pub changes: Vec<Change>,
    /// No usable previous config: every node must rebuild from scratch.
    #[serde(default)]
    pub newconfig: bool,
}

impl MineMeldConfig {
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Replace `changes` with the diff against `old`. Without a previous
    /// config the graph is flagged as new and carries no change list.
    pub fn compute_changes(&mut self, old: Option<&MineMeldConfig>) {
        self.changes.clear();
        let Some(old) = old else {
            self.newconfig = true;
            return;
        };
        self.newconfig = false;

        for (name, node) in &old.nodes {
            if !self.nodes.contains_key(name) {
                self.changes
                    .push(Change::new(name, &node.class, ChangeKind::Deleted, None));
            }
        }

        for (name, node) in &self.nodes {
            let Some(prev) = old.nodes.get(name) else {
                self.changes
                    .push(Change::new(name, &node.class, ChangeKind::Added, None));
                continue;
            };

            if prev.class != node.class || prev.config != node.config {
                // A reconfigured node is a different node.
                self.changes
                    .push(Change::new(name, &prev.class, ChangeKind::Deleted, None));
                self.changes
                    .push(Change::new(name, &node.class, ChangeKind::Added, None));
                continue;
            }

            let before: BTreeSet<&str> = prev.inputs.iter().map(String::as_str).collect();
            let after: BTreeSet<&str> = node.inputs.iter().map(String::as_str).collect();
            for input in after.difference(&before) {
                self.changes.push(Change::new(
                    name,
                    &node.class,
                    ChangeKind::InputAdded,
                    Some(input),
                ));
            }
            for input in before.difference(&after) {
                self.changes.push(Change::new(
                    name,
                    &node.class,
                    ChangeKind::InputDeleted,
                    Some(input),
                ));
            }
        }
        debug!(changes = self.changes.len(), "config: computed change set");
    }

    pub fn changes_for<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Change> + 'a {
        self.changes.iter().filter(move |c| c.nodename == node)
    }

    pub fn is_source(&self, node: &str) -> bool {
        self.nodes.get(node).is_some_and(NodeConfig::is_source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cfg(v: Value) -> MineMeldConfig {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn parses_graph_with_defaults() {
        let c = MineMeldConfig::from_json(
            r#"{"nodes": {"m1": {"class": "minemeld.ft.http.HttpFT"},
                          "o1": {"inputs": ["m1"], "output": false}}}"#,
        )
        .unwrap();
        assert!(c.nodes["m1"].output);
        assert!(c.is_source("m1"));
        assert!(!c.is_source("o1"));
        assert!(!c.newconfig);
        assert!(c.changes.is_empty());
    }

    #[test]
    fn first_config_is_new() {
        let mut c = cfg(json!({"nodes": {"m1": {}}}));
        c.compute_changes(None);
        assert!(c.newconfig);
        assert!(c.changes.is_empty());
    }

    #[test]
    fn diff_reports_node_and_input_changes() {
        let old = cfg(json!({"nodes": {
            "m1": {"class": "A"},
            "m3": {"class": "A"},
            "p1": {"class": "P", "inputs": ["m1", "m3"]},
            "x": {"class": "X"}
        }}));
        let mut new = cfg(json!({"nodes": {
            "m1": {"class": "A"},
            "m2": {"class": "A"},
            "m3": {"class": "A", "config": {"age": 3}},
            "p1": {"class": "P", "inputs": ["m1", "m2"]}
        }}));
        new.compute_changes(Some(&old));

        let got: Vec<(String, ChangeKind, Option<String>)> = new
            .changes
            .iter()
            .map(|c| (c.nodename.clone(), c.kind, c.detail.clone()))
            .collect();
        assert_eq!(
            got,
            vec![
                ("x".into(), ChangeKind::Deleted, None),
                ("m2".into(), ChangeKind::Added, None),
                ("m3".into(), ChangeKind::Deleted, None),
                ("m3".into(), ChangeKind::Added, None),
                ("p1".into(), ChangeKind::InputAdded, Some("m2".into())),
                ("p1".into(), ChangeKind::InputDeleted, Some("m3".into())),
            ]
        );
        assert!(!new.newconfig);

        let m3: Vec<ChangeKind> = new.changes_for("m3").map(|c| c.kind).collect();
        assert_eq!(m3, vec![ChangeKind::Deleted, ChangeKind::Added]);
        assert_eq!(new.changes_for("m1").count(), 0);
    }

    #[test]
    fn change_kinds_use_wire_names() {
        let c = Change::new("p1", "P", ChangeKind::InputDeleted, Some("m1"));
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["change"], json!("INPUT_DELETED"));
    }
}
