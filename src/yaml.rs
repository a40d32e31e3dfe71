//! YAML parsing utilities using yaml-rust2
//!
//! Parses YAML into a node tree that retains anchors and aliases, so that
//! fields can be rewritten *before* alias resolution. An alias that points
//! at a rewritten anchor resolves to the new value. Resolution produces a
//! `serde_json::Value` for typed deserialization; serde_json is used for
//! all serialization needs.

use serde_json::{Map, Number, Value};
use yaml_rust2::parser::{Event, MarkedEventReceiver, Parser, Tag};
use yaml_rust2::scanner::{Marker, TScalarStyle};
use yaml_rust2::Yaml;

use crate::error::Error;
use crate::Result;

/// A YAML document node with anchors and aliases left unresolved.
///
/// Anchor ids come from the parser; `0` means the node carries no anchor.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// A scalar value. `plain` records whether the scalar was unquoted,
    /// which decides whether resolution applies YAML type inference.
    Scalar {
        /// The raw scalar text.
        value: String,
        /// True for plain (unquoted) scalars.
        plain: bool,
        /// Anchor id, or 0.
        anchor: usize,
    },
    /// A sequence of nodes.
    Sequence {
        /// The sequence items.
        items: Vec<Node>,
        /// Anchor id, or 0.
        anchor: usize,
    },
    /// A mapping. Entry order is preserved.
    Mapping {
        /// The mapping entries as (key, value) pairs.
        entries: Vec<(Node, Node)>,
        /// Anchor id, or 0.
        anchor: usize,
    },
    /// A reference to a previously anchored node.
    Alias(usize),
}

impl Node {
    /// A quoted scalar node with no anchor. Resolution always yields a
    /// string for these, never an inferred type.
    fn quoted(value: &str) -> Node {
        Node::Scalar {
            value: value.to_string(),
            plain: false,
            anchor: 0,
        }
    }

    fn empty_mapping() -> Node {
        Node::Mapping {
            entries: Vec::new(),
            anchor: 0,
        }
    }

    /// The scalar text of this node, if it is a scalar.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::Scalar { value, .. } => Some(value.as_str()),
            _ => None,
        }
    }

    fn scalar_eq(&self, wanted: &str) -> bool {
        self.as_str() == Some(wanted)
    }

    /// Look up a mapping entry by string key.
    pub fn get(&self, key: &str) -> Option<&Node> {
        match self {
            Node::Mapping { entries, .. } => entries
                .iter()
                .find(|(k, _)| k.scalar_eq(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Remove and return every top-level mapping entry whose key begins
    /// with `$`. Returns an empty list for non-mapping nodes.
    pub fn drain_special_keys(&mut self) -> Vec<(String, Node)> {
        let entries = match self {
            Node::Mapping { entries, .. } => entries,
            _ => return Vec::new(),
        };

        let mut special = Vec::new();
        let mut keep = Vec::with_capacity(entries.len());

        for (key, value) in entries.drain(..) {
            match key.as_str() {
                Some(name) if name.starts_with('$') => special.push((name.to_string(), value)),
                _ => keep.push((key, value)),
            }
        }

        *entries = keep;
        special
    }

    /// Set the string value at the given mapping path, creating missing
    /// intermediate mappings.
    ///
    /// An existing scalar is rewritten in place so its anchor survives and
    /// aliases continue to track the value. Alias nodes are left alone:
    /// there is no way to know whether rewriting the referent is wanted.
    pub fn set_string(&mut self, path: &[&str], value: &str) -> Result<()> {
        let entries = match self {
            Node::Mapping { entries, .. } => entries,
            _ => {
                return Err(Error::bad_input(format!(
                    "cannot set {:?} on a non-mapping YAML node",
                    path.join(".")
                )))
            }
        };

        let (head, rest) = match path.split_first() {
            Some(split) => split,
            None => return Ok(()),
        };

        let index = entries.iter().position(|(k, _)| k.scalar_eq(head));

        if rest.is_empty() {
            match index {
                Some(i) => {
                    if let Node::Scalar { value: v, plain, .. } = &mut entries[i].1 {
                        *v = value.to_string();
                        *plain = false;
                    }
                }
                None => entries.push((Node::quoted(head), Node::quoted(value))),
            }
            return Ok(());
        }

        let i = match index {
            Some(i) => i,
            None => {
                entries.push((Node::quoted(head), Node::empty_mapping()));
                entries.len() - 1
            }
        };

        entries[i].1.set_string(rest, value)
    }

    /// Resolve this tree into a `serde_json::Value`, expanding aliases.
    pub fn resolve(&self) -> Result<Value> {
        let mut anchors = std::collections::HashMap::new();
        resolve_node(self, &mut anchors)
    }
}

fn resolve_node(node: &Node, anchors: &mut std::collections::HashMap<usize, Value>) -> Result<Value> {
    match node {
        Node::Scalar {
            value,
            plain,
            anchor,
        } => {
            let resolved = scalar_value(value, *plain);
            if *anchor != 0 {
                anchors.insert(*anchor, resolved.clone());
            }
            Ok(resolved)
        }
        Node::Sequence { items, anchor } => {
            let mut array = Vec::with_capacity(items.len());
            for item in items {
                array.push(resolve_node(item, anchors)?);
            }
            let resolved = Value::Array(array);
            if *anchor != 0 {
                anchors.insert(*anchor, resolved.clone());
            }
            Ok(resolved)
        }
        Node::Mapping { entries, anchor } => {
            let mut map = Map::with_capacity(entries.len());
            for (key, value) in entries {
                let key = match key {
                    Node::Scalar { value, .. } => value.clone(),
                    _ => return Err(Error::bad_input("unsupported YAML key type")),
                };
                map.insert(key, resolve_node(value, anchors)?);
            }
            let resolved = Value::Object(map);
            if *anchor != 0 {
                anchors.insert(*anchor, resolved.clone());
            }
            Ok(resolved)
        }
        Node::Alias(id) => anchors
            .get(id)
            .cloned()
            .ok_or_else(|| Error::bad_input("YAML alias references an unknown anchor")),
    }
}

/// Convert a scalar to a JSON value. Quoted scalars are always strings;
/// plain scalars follow YAML type inference.
fn scalar_value(raw: &str, plain: bool) -> Value {
    if !plain {
        return Value::String(raw.to_string());
    }

    if raw.is_empty() {
        return Value::Null;
    }

    match Yaml::from_str(raw) {
        Yaml::Null => Value::Null,
        Yaml::Boolean(b) => Value::Bool(b),
        Yaml::Integer(i) => Value::Number(i.into()),
        Yaml::Real(s) => s
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Yaml::String(s) => Value::String(s),
        _ => Value::String(raw.to_string()),
    }
}

#[derive(Default)]
struct TreeBuilder {
    docs: Vec<Node>,
    stack: Vec<Frame>,
}

enum Frame {
    Sequence {
        items: Vec<Node>,
        anchor: usize,
    },
    Mapping {
        entries: Vec<(Node, Node)>,
        pending: Option<Node>,
        anchor: usize,
    },
}

impl TreeBuilder {
    fn push_node(&mut self, node: Node) {
        match self.stack.last_mut() {
            None => self.docs.push(node),
            Some(Frame::Sequence { items, .. }) => items.push(node),
            Some(Frame::Mapping {
                entries, pending, ..
            }) => match pending.take() {
                None => *pending = Some(node),
                Some(key) => entries.push((key, node)),
            },
        }
    }
}

impl MarkedEventReceiver for TreeBuilder {
    fn on_event(&mut self, event: Event, _mark: Marker) {
        match event {
            Event::Scalar(value, style, anchor, tag) => {
                let plain = style == TScalarStyle::Plain && !tag_forces_string(&tag);
                self.push_node(Node::Scalar {
                    value,
                    plain,
                    anchor,
                });
            }
            Event::Alias(id) => self.push_node(Node::Alias(id)),
            Event::SequenceStart(anchor, _tag) => self.stack.push(Frame::Sequence {
                items: Vec::new(),
                anchor,
            }),
            Event::SequenceEnd => {
                if let Some(Frame::Sequence { items, anchor }) = self.stack.pop() {
                    self.push_node(Node::Sequence { items, anchor });
                }
            }
            Event::MappingStart(anchor, _tag) => self.stack.push(Frame::Mapping {
                entries: Vec::new(),
                pending: None,
                anchor,
            }),
            Event::MappingEnd => {
                if let Some(Frame::Mapping {
                    entries, anchor, ..
                }) = self.stack.pop()
                {
                    self.push_node(Node::Mapping { entries, anchor });
                }
            }
            Event::Nothing
            | Event::StreamStart
            | Event::StreamEnd
            | Event::DocumentStart
            | Event::DocumentEnd => {}
        }
    }
}

fn tag_forces_string(tag: &Option<Tag>) -> bool {
    tag.as_ref()
        .map(|t| t.suffix == "str" || t.suffix == "tag:yaml.org,2002:str")
        .unwrap_or(false)
}

/// Parse a YAML string into a node tree.
///
/// For multi-document input, returns only the first document. Empty input
/// is an error: callers always expect a value.
pub fn parse_node(input: &str) -> Result<Node> {
    let mut builder = TreeBuilder::default();
    let mut parser = Parser::new_from_str(input);

    parser
        .load(&mut builder, true)
        .map_err(|e| Error::bad_input(format!("failed to parse YAML: {e}")))?;

    builder
        .docs
        .into_iter()
        .next()
        .ok_or_else(|| Error::bad_input("empty YAML document"))
}

/// Parse a YAML string straight into a `serde_json::Value`.
pub fn parse_value(input: &str) -> Result<Value> {
    parse_node(input)?.resolve()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let value = parse_value("name: test\nvalue: 42").unwrap();
        assert_eq!(value["name"], "test");
        assert_eq!(value["value"], 42);
    }

    #[test]
    fn test_parse_nested() {
        let value = parse_value(
            r#"
metadata:
  name: my-app
  namespace: default
spec:
  replicas: 3
"#,
        )
        .unwrap();
        assert_eq!(value["metadata"]["name"], "my-app");
        assert_eq!(value["spec"]["replicas"], 3);
    }

    #[test]
    fn test_parse_scalar_types() {
        let value = parse_value("a: true\nb: null\nc: 1.5\nd: hello").unwrap();
        assert_eq!(value["a"], true);
        assert!(value["b"].is_null());
        assert!((value["c"].as_f64().unwrap() - 1.5).abs() < 0.0001);
        assert_eq!(value["d"], "hello");
    }

    #[test]
    fn test_quoted_scalars_stay_strings() {
        let value = parse_value("a: \"123\"\nb: 'true'").unwrap();
        assert_eq!(value["a"], "123");
        assert_eq!(value["b"], "true");
    }

    #[test]
    fn test_alias_resolves_to_anchor_value() {
        let value = parse_value("name: &n httpbin\nalso: *n").unwrap();
        assert_eq!(value["name"], "httpbin");
        assert_eq!(value["also"], "httpbin");
    }

    #[test]
    fn test_set_string_tracks_aliases() {
        let mut node = parse_node(
            r#"
metadata:
  name: &name httpbin
  labels:
    app: *name
"#,
        )
        .unwrap();

        node.set_string(&["metadata", "name"], "httpbin2").unwrap();

        let value = node.resolve().unwrap();
        assert_eq!(value["metadata"]["name"], "httpbin2");
        assert_eq!(value["metadata"]["labels"]["app"], "httpbin2");
    }

    #[test]
    fn test_set_string_creates_missing_path() {
        let mut node = parse_node("metadata:\n  name: web").unwrap();

        node.set_string(&["metadata", "namespace"], "prod").unwrap();
        node.set_string(&["metadata", "labels", "app"], "web").unwrap();

        let value = node.resolve().unwrap();
        assert_eq!(value["metadata"]["namespace"], "prod");
        assert_eq!(value["metadata"]["labels"]["app"], "web");
    }

    #[test]
    fn test_set_string_leaves_alias_nodes_alone() {
        let mut node = parse_node(
            r#"
metadata:
  name: &name httpbin
  namespace: *name
"#,
        )
        .unwrap();

        // The namespace field is an alias, so only the anchored name moves.
        node.set_string(&["metadata", "namespace"], "other").unwrap();

        let value = node.resolve().unwrap();
        assert_eq!(value["metadata"]["namespace"], "httpbin");
    }

    #[test]
    fn test_drain_special_keys() {
        let mut node = parse_node(
            r#"
$apply: delete
$unknown: whatever
apiVersion: v1
kind: Service
"#,
        )
        .unwrap();

        let special = node.drain_special_keys();
        let names: Vec<&str> = special.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["$apply", "$unknown"]);

        let value = node.resolve().unwrap();
        assert_eq!(value["apiVersion"], "v1");
        assert!(value.get("$apply").is_none());
    }

    #[test]
    fn test_multi_document_returns_first() {
        let value = parse_value("name: first\n---\nname: second").unwrap();
        assert_eq!(value["name"], "first");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_value("not: valid: yaml: {{").is_err());
    }

    #[test]
    fn test_parse_empty_is_an_error() {
        assert!(parse_value("").is_err());
    }
}
