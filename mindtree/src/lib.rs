//! Mind-map topic trees and their flat text encodings.
//! The core stays pure: a `Node` tree and four codecs. Documents, storage and the two
//! pipelines (extract a tree out of a document, construct a document from text) sit around it.

pub mod core {
    use serde::Serialize;

    /* ----------------------------- Constants ----------------------------- */

    /// Spaces per depth level in the plain-text encoding.
    pub const INDENT_WIDTH: usize = 2;

    /// Deepest tree a decoder accepts unless told otherwise. The root alone has depth 1.
    pub const DEFAULT_MAX_DEPTH: usize = 1024;

    /* ------------------------------ Traversal ------------------------------ */

    /// Anything shaped like an ordered tree.
    pub trait Tree: Sized {
        fn branches(&self) -> &[Self];
    }

    /// Post-order fold over a tree without recursion.
    ///
    /// `f` receives each node together with the values already produced for its
    /// children, in sibling order.
    pub fn fold<N: Tree, T>(root: &N, mut f: impl FnMut(&N, Vec<T>) -> T) -> T {
        struct Frame<'a, N, T> {
            node: &'a N,
            next: usize,
            done: Vec<T>,
        }

        let mut stack = vec![Frame {
            node: root,
            next: 0,
            done: Vec::new(),
        }];
        while let Some(mut frame) = stack.pop() {
            if let Some(child) = frame.node.branches().get(frame.next) {
                frame.next += 1;
                stack.push(frame);
                stack.push(Frame {
                    node: child,
                    next: 0,
                    done: Vec::with_capacity(child.branches().len()),
                });
                continue;
            }
            let value = f(frame.node, frame.done);
            match stack.last_mut() {
                Some(parent) => parent.done.push(value),
                None => return value,
            }
        }
        unreachable!("the root frame yields the result before the stack empties")
    }

    /* -------------------------------- Node -------------------------------- */

    /// A topic in the tree model: a title and its ordered children.
    ///
    /// Serializes as `{"name": .., "children": [..]}`; `children` is left out for leaves.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
    pub struct Node {
        #[serde(rename = "name")]
        pub title: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        pub children: Vec<Node>,
    }

    impl Node {
        pub fn new(title: impl Into<String>) -> Self {
            Self {
                title: title.into(),
                children: vec![],
            }
        }

        pub fn with_children(title: impl Into<String>, children: Vec<Node>) -> Self {
            Self {
                title: title.into(),
                children,
            }
        }

        pub fn is_leaf(&self) -> bool {
            self.children.is_empty()
        }

        /// Number of levels, counting the root as 1.
        pub fn depth(&self) -> usize {
            fold(self, |_, below: Vec<usize>| 1 + below.into_iter().max().unwrap_or(0))
        }

        /// Number of nodes, the root included.
        pub fn count(&self) -> usize {
            fold(self, |_, below: Vec<usize>| 1 + below.into_iter().sum::<usize>())
        }
    }

    impl Tree for Node {
        fn branches(&self) -> &[Self] {
            &self.children
        }
    }

    // Deep trees would otherwise drop one stack frame per level.
    impl Drop for Node {
        fn drop(&mut self) {
            let mut pending = std::mem::take(&mut self.children);
            while let Some(mut node) = pending.pop() {
                pending.append(&mut node.children);
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn chain(levels: usize) -> Node {
            let mut node = Node::new("leaf");
            for i in 1..levels {
                node = Node::with_children(format!("level {i}"), vec![node]);
            }
            node
        }

        #[test]
        fn fold_visits_children_in_order() {
            let tree = Node::with_children(
                "root",
                vec![
                    Node::with_children("a", vec![Node::new("a1"), Node::new("a2")]),
                    Node::new("b"),
                ],
            );
            let order = fold(&tree, |node, below: Vec<String>| {
                let mut out = node.title.clone();
                if !below.is_empty() {
                    out.push('(');
                    out.push_str(&below.join(","));
                    out.push(')');
                }
                out
            });
            assert_eq!(order, "root(a(a1,a2),b)");
        }

        #[test]
        fn depth_and_count() {
            let tree = Node::with_children(
                "root",
                vec![Node::with_children("a", vec![Node::new("a1")]), Node::new("b")],
            );
            assert_eq!(tree.depth(), 3);
            assert_eq!(tree.count(), 4);
            assert!(Node::new("solo").is_leaf());
            assert_eq!(Node::new("solo").depth(), 1);
        }

        #[test]
        fn very_deep_trees_fold_and_drop_without_recursion() {
            let tree = chain(200_000);
            assert_eq!(tree.depth(), 200_000);
            drop(tree);
        }
    }
}

pub mod error {
    use crate::codec::Format;
    use thiserror::Error;

    /// Everything that can go wrong turning text into a tree or a tree into text.
    #[derive(Debug, Clone, PartialEq, Eq, Error)]
    pub enum CodecError {
        /// The input is not JSON/XML/YAML at all.
        #[error("{format} syntax error: {message}")]
        Syntax { format: Format, message: String },

        /// Well-formed input whose shape does not describe a topic tree.
        #[error("{format} decode error at {path}: {message}")]
        Decode {
            format: Format,
            path: String,
            message: String,
        },

        /// Plain text that breaks the indentation grammar.
        #[error("text format error on line {line}: {message}")]
        Format { line: usize, message: String },

        /// Decoded value that is not a usable tree (wrong top-level kind, too deep).
        #[error("{format} validation error: {message}")]
        Validation { format: Format, message: String },

        #[error("{format} encode error: {message}")]
        Encode { format: Format, message: String },
    }

    impl CodecError {
        /// The encoding the failing input was read as.
        pub fn format(&self) -> Format {
            match self {
                CodecError::Syntax { format, .. }
                | CodecError::Decode { format, .. }
                | CodecError::Validation { format, .. }
                | CodecError::Encode { format, .. } => *format,
                CodecError::Format { .. } => Format::Text,
            }
        }
    }
}

pub mod codec {
    //! Closed set of encodings, each dispatched to a pair of plain functions.

    use crate::core::{DEFAULT_MAX_DEPTH, Node};
    use crate::error::CodecError;
    use crate::{json, text, xml, yaml};
    use std::{fmt, path::Path, str::FromStr};
    use thiserror::Error;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Format {
        Json,
        Xml,
        Yaml,
        Text,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Error)]
    #[error("unknown format {0:?} (expected one of json, xml, yaml, text)")]
    pub struct UnknownFormat(pub String);

    /// Limits applied while decoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DecodeOptions {
        pub max_depth: usize,
    }

    impl Default for DecodeOptions {
        fn default() -> Self {
            Self {
                max_depth: DEFAULT_MAX_DEPTH,
            }
        }
    }

    impl DecodeOptions {
        /// Fails once a tree being decoded reaches `depth` levels beyond the limit.
        pub fn check_depth(&self, format: Format, depth: usize) -> Result<(), CodecError> {
            if depth > self.max_depth {
                return Err(CodecError::Validation {
                    format,
                    message: format!("tree is deeper than {} levels", self.max_depth),
                });
            }
            Ok(())
        }
    }

    impl Format {
        pub const ALL: [Format; 4] = [Format::Json, Format::Xml, Format::Yaml, Format::Text];

        pub fn as_str(self) -> &'static str {
            match self {
                Format::Json => "json",
                Format::Xml => "xml",
                Format::Yaml => "yaml",
                Format::Text => "text",
            }
        }

        /// Guess the encoding from a file extension.
        pub fn from_path(path: &Path) -> Option<Format> {
            let ext = path.extension()?.to_str()?.to_ascii_lowercase();
            match ext.as_str() {
                "json" => Some(Format::Json),
                "xml" => Some(Format::Xml),
                "yaml" | "yml" => Some(Format::Yaml),
                "txt" | "text" => Some(Format::Text),
                _ => None,
            }
        }

        pub fn decode(self, input: &str) -> Result<Node, CodecError> {
            self.decode_with(input, &DecodeOptions::default())
        }

        pub fn decode_with(self, input: &str, opts: &DecodeOptions) -> Result<Node, CodecError> {
            match self {
                Format::Json => json::decode(input, opts),
                Format::Xml => xml::decode(input, opts),
                Format::Yaml => yaml::decode(input, opts),
                Format::Text => text::decode(input, opts),
            }
        }

        /// Encode a tree. `pretty` only changes layout, never content; YAML and
        /// plain text have a single layout and ignore it.
        pub fn encode(self, node: &Node, pretty: bool) -> Result<String, CodecError> {
            match self {
                Format::Json => json::encode(node, pretty),
                Format::Xml => xml::encode(node, pretty),
                Format::Yaml => yaml::encode(node),
                Format::Text => Ok(text::encode(node)),
            }
        }
    }

    impl fmt::Display for Format {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    impl FromStr for Format {
        type Err = UnknownFormat;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.trim().to_ascii_lowercase().as_str() {
                "json" => Ok(Format::Json),
                "xml" => Ok(Format::Xml),
                "yaml" | "yml" => Ok(Format::Yaml),
                "text" | "txt" => Ok(Format::Text),
                _ => Err(UnknownFormat(s.to_string())),
            }
        }
    }

}

pub mod shape {
    //! Normalizes a generic `{name, children}` value into a `Node`.
    //! Shared by the JSON and YAML decoders; unknown keys are ignored.

    use crate::codec::{DecodeOptions, Format};
    use crate::core::Node;
    use crate::error::CodecError;
    use serde_json::{Map, Value};

    struct Frame<'v> {
        title: String,
        path: String,
        items: &'v [Value],
        next: usize,
        children: Vec<Node>,
    }

    pub fn node_from_value(
        format: Format,
        value: &Value,
        opts: &DecodeOptions,
    ) -> Result<Node, CodecError> {
        let Value::Object(root) = value else {
            return Err(CodecError::Validation {
                format,
                message: format!("top-level value is {}, expected a mapping", kind(value)),
            });
        };
        opts.check_depth(format, 1)?;

        let mut stack = vec![open(format, root, "$".to_string())?];
        while let Some(mut frame) = stack.pop() {
            if let Some(item) = frame.items.get(frame.next) {
                let path = format!("{}.children[{}]", frame.path, frame.next);
                frame.next += 1;
                let Value::Object(map) = item else {
                    return Err(CodecError::Decode {
                        format,
                        path,
                        message: format!("expected a mapping, found {}", kind(item)),
                    });
                };
                let child = open(format, map, path)?;
                stack.push(frame);
                opts.check_depth(format, stack.len() + 1)?;
                stack.push(child);
                continue;
            }
            let node = Node::with_children(frame.title, frame.children);
            match stack.last_mut() {
                Some(parent) => parent.children.push(node),
                None => return Ok(node),
            }
        }
        unreachable!("the root frame yields the result before the stack empties")
    }

    fn open<'v>(
        format: Format,
        map: &'v Map<String, Value>,
        path: String,
    ) -> Result<Frame<'v>, CodecError> {
        let title = match map.get("name") {
            Some(Value::String(title)) => title.clone(),
            Some(other) => {
                return Err(CodecError::Decode {
                    format,
                    path: format!("{path}.name"),
                    message: format!("expected a string, found {}", kind(other)),
                });
            }
            None => {
                return Err(CodecError::Decode {
                    format,
                    path,
                    message: "missing `name` key".to_string(),
                });
            }
        };
        let items: &[Value] = match map.get("children") {
            None | Some(Value::Null) => &[],
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(CodecError::Decode {
                    format,
                    path: format!("{path}.children"),
                    message: format!("expected an array, found {}", kind(other)),
                });
            }
        };
        Ok(Frame {
            title,
            path,
            items,
            next: 0,
            children: Vec::with_capacity(items.len()),
        })
    }

    /// Drop a parsed document one container at a time instead of recursively.
    pub fn release(value: Value) {
        let mut pending = vec![value];
        while let Some(value) = pending.pop() {
            match value {
                Value::Array(items) => pending.extend(items),
                Value::Object(map) => pending.extend(map.into_iter().map(|(_, v)| v)),
                _ => {}
            }
        }
    }

    fn kind(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "a boolean",
            Value::Number(_) => "a number",
            Value::String(_) => "a string",
            Value::Array(_) => "an array",
            Value::Object(_) => "a mapping",
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use serde_json::json;

        fn decode(value: Value) -> Result<Node, CodecError> {
            node_from_value(Format::Json, &value, &DecodeOptions::default())
        }

        #[test]
        fn ignores_unknown_keys_and_null_children() {
            let node = decode(json!({
                "id": 7,
                "name": "root",
                "children": [{"name": "a", "children": null, "style": "bold"}]
            }))
            .expect("decode");
            assert_eq!(node, Node::with_children("root", vec![Node::new("a")]));
        }

        #[test]
        fn reports_key_paths() {
            let err = decode(json!({"name": "r", "children": [{"name": "a"}, {"name": 3}]}))
                .expect_err("bad name");
            assert_eq!(
                err,
                CodecError::Decode {
                    format: Format::Json,
                    path: "$.children[1].name".into(),
                    message: "expected a string, found a number".into(),
                }
            );

            let err = decode(json!({"name": "r", "children": [{"title": "a"}]}))
                .expect_err("missing name");
            assert!(
                matches!(&err, CodecError::Decode { path, .. } if path == "$.children[0]"),
                "{err:?}"
            );

            let err = decode(json!({"name": "r", "children": {"name": "a"}}))
                .expect_err("children not an array");
            assert!(
                matches!(&err, CodecError::Decode { path, .. } if path == "$.children"),
                "{err:?}"
            );

            let err = decode(json!({"name": "r", "children": ["a"]})).expect_err("string child");
            assert!(matches!(err, CodecError::Decode { .. }), "{err:?}");
        }

        #[test]
        fn top_level_must_be_a_mapping() {
            let err = decode(json!(["root"])).expect_err("array");
            assert!(matches!(err, CodecError::Validation { .. }), "{err:?}");
        }

        #[test]
        fn release_takes_deep_values_apart() {
            let mut value = json!({"name": "leaf"});
            for _ in 0..200_000 {
                let mut map = Map::new();
                map.insert("children".to_string(), Value::Array(vec![value]));
                value = Value::Object(map);
            }
            release(value);
        }
    }
}

pub mod json {
    //! `{"name": .., "children": [..]}`. Pretty output matches `serde_json`'s
    //! two-space layout.
    //!
    //! The writer walks the tree with an explicit step stack and only asks `serde_json` to
    //! quote titles. The reader measures bracket nesting before parsing, so `max_depth`
    //! bounds how deep `serde_json` is ever asked to go.

    use crate::codec::{DecodeOptions, Format};
    use crate::core::Node;
    use crate::error::CodecError;
    use crate::shape::{node_from_value, release};
    use serde::Deserialize;
    use serde_json::Value;

    enum Step<'a> {
        Node(&'a Node, usize),
        Raw(String),
    }

    pub fn encode(node: &Node, pretty: bool) -> Result<String, CodecError> {
        let mut out = String::new();
        let mut steps = vec![Step::Node(node, 0)];
        while let Some(step) = steps.pop() {
            let (node, level) = match step {
                Step::Raw(raw) => {
                    out.push_str(&raw);
                    continue;
                }
                Step::Node(node, level) => (node, level),
            };
            let title = quote(&node.title)?;

            if !pretty {
                out.push_str("{\"name\":");
                out.push_str(&title);
                if node.is_leaf() {
                    out.push('}');
                    continue;
                }
                out.push_str(",\"children\":[");
                steps.push(Step::Raw("]}".to_string()));
                for (idx, child) in node.children.iter().enumerate().rev() {
                    steps.push(Step::Node(child, level + 1));
                    if idx > 0 {
                        steps.push(Step::Raw(",".to_string()));
                    }
                }
                continue;
            }

            let field_pad = pad(level + 1);
            out.push_str("{\n");
            out.push_str(&field_pad);
            out.push_str("\"name\": ");
            out.push_str(&title);
            if node.is_leaf() {
                out.push('\n');
                out.push_str(&pad(level));
                out.push('}');
                continue;
            }
            out.push_str(",\n");
            out.push_str(&field_pad);
            out.push_str("\"children\": [\n");

            let item_pad = pad(level + 2);
            steps.push(Step::Raw(format!("\n{field_pad}]\n{}}}", pad(level))));
            for (idx, child) in node.children.iter().enumerate().rev() {
                steps.push(Step::Node(child, level + 2));
                if idx > 0 {
                    steps.push(Step::Raw(format!(",\n{item_pad}")));
                } else {
                    steps.push(Step::Raw(item_pad.clone()));
                }
            }
        }
        Ok(out)
    }

    pub fn decode(input: &str, opts: &DecodeOptions) -> Result<Node, CodecError> {
        // A tree of depth d nests 2d - 1 brackets deep.
        opts.check_depth(Format::Json, (nesting(input) + 1) / 2)?;

        let mut de = serde_json::Deserializer::from_str(input);
        de.disable_recursion_limit();
        let value = Value::deserialize(serde_stacker::Deserializer::new(&mut de))
            .map_err(syntax_error)?;
        de.end().map_err(syntax_error)?;
        let node = node_from_value(Format::Json, &value, opts);
        release(value);
        node
    }

    fn quote(title: &str) -> Result<String, CodecError> {
        serde_json::to_string(title).map_err(|e| CodecError::Encode {
            format: Format::Json,
            message: e.to_string(),
        })
    }

    fn pad(level: usize) -> String {
        "  ".repeat(level)
    }

    fn syntax_error(e: serde_json::Error) -> CodecError {
        CodecError::Syntax {
            format: Format::Json,
            message: e.to_string(),
        }
    }

    /// Deepest bracket nesting outside string literals.
    fn nesting(input: &str) -> usize {
        let (mut depth, mut deepest) = (0usize, 0usize);
        let (mut in_string, mut escaped) = (false, false);
        for byte in input.bytes() {
            if in_string {
                match byte {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match byte {
                b'"' => in_string = true,
                b'{' | b'[' => {
                    depth += 1;
                    deepest = deepest.max(depth);
                }
                b'}' | b']' => depth = depth.saturating_sub(1),
                _ => {}
            }
        }
        deepest
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn decodes_compact_document() {
            let input = r#"{"name":"root","children":[{"name":"a"},{"name":"b"}]}"#;
            let node = decode(input, &DecodeOptions::default()).expect("decode");
            assert_eq!(
                node,
                Node::with_children("root", vec![Node::new("a"), Node::new("b")])
            );
        }

        #[test]
        fn compact_and_pretty_layouts() {
            let tree = Node::with_children("root", vec![Node::new("a")]);
            assert_eq!(
                encode(&tree, false).expect("compact"),
                r#"{"name":"root","children":[{"name":"a"}]}"#
            );
            let expected = r#"{
  "name": "root",
  "children": [
    {
      "name": "a"
    }
  ]
}"#;
            assert_eq!(encode(&tree, true).expect("pretty"), expected);
        }

        #[test]
        fn layouts_match_serde_json() {
            let tree = Node::with_children(
                "r \"q\" \\ \n\t",
                vec![
                    Node::with_children("a", vec![Node::new("a1"), Node::new("")]),
                    Node::new("b"),
                    Node::with_children("c", vec![Node::new("c1")]),
                ],
            );
            assert_eq!(
                encode(&tree, false).expect("compact"),
                serde_json::to_string(&tree).expect("serde compact")
            );
            assert_eq!(
                encode(&tree, true).expect("pretty"),
                serde_json::to_string_pretty(&tree).expect("serde pretty")
            );
        }

        #[test]
        fn nesting_ignores_brackets_in_strings() {
            assert_eq!(nesting(r#"{"name":"[[{{\"]]"}"#), 1);
            assert_eq!(nesting(r#"{"name":"r","children":[{"name":"a"}]}"#), 3);
            assert_eq!(nesting("true"), 0);
        }

        #[test]
        fn malformed_json_is_a_syntax_error() {
            let err = decode(r#"{"name": "root""#, &DecodeOptions::default()).expect_err("eof");
            assert!(matches!(err, CodecError::Syntax { format: Format::Json, .. }), "{err:?}");
            let err = decode(r#"{"name": "root"} trailing"#, &DecodeOptions::default())
                .expect_err("trailing");
            assert!(matches!(err, CodecError::Syntax { .. }), "{err:?}");
        }

        #[test]
        fn top_level_string_is_rejected() {
            let err = decode(r#""root""#, &DecodeOptions::default()).expect_err("string");
            assert!(matches!(err, CodecError::Validation { .. }), "{err:?}");
        }
    }
}

pub mod yaml {
    //! Block-style YAML with `name` before `children` at every level:
    //!
    //! ```text
    //! name: root
    //! children:
    //! - name: a
    //!   children:
    //!   - name: a1
    //! ```
    //!
    //! `serde_yaml` reads at most 128 levels of nesting, and each tree level costs two.
    //! The writer refuses trees deeper than [`MAX_DEPTH`] so that whatever it writes can
    //! be read back.

    use crate::codec::{DecodeOptions, Format};
    use crate::core::Node;
    use crate::error::CodecError;
    use crate::shape::{node_from_value, release};
    use serde_json::Value;

    /// Deepest tree the YAML codec round-trips.
    pub const MAX_DEPTH: usize = 60;

    pub fn encode(node: &Node) -> Result<String, CodecError> {
        let depth = node.depth();
        if depth > MAX_DEPTH {
            return Err(encode_error(format!(
                "tree is {depth} levels deep; YAML output is limited to {MAX_DEPTH}"
            )));
        }

        let mut out = String::new();
        // (node, column of its keys, whether it is a list item)
        let mut stack = vec![(node, 0usize, false)];
        while let Some((node, column, is_item)) = stack.pop() {
            if is_item {
                out.push_str(&" ".repeat(column - 2));
                out.push_str("- ");
            } else {
                out.push_str(&" ".repeat(column));
            }
            out.push_str("name: ");
            out.push_str(&scalar(&node.title)?);
            out.push('\n');
            if !node.is_leaf() {
                out.push_str(&" ".repeat(column));
                out.push_str("children:\n");
                stack.extend(node.children.iter().rev().map(|child| (child, column + 2, true)));
            }
        }
        Ok(out)
    }

    pub fn decode(input: &str, opts: &DecodeOptions) -> Result<Node, CodecError> {
        let value: Value = serde_yaml::from_str(input).map_err(|e| CodecError::Syntax {
            format: Format::Yaml,
            message: e.to_string(),
        })?;
        let node = node_from_value(Format::Yaml, &value, opts);
        release(value);
        node
    }

    /// A title as a single-line YAML scalar. Multi-line titles fall back to a
    /// double-quoted JSON string, which YAML reads the same way.
    fn scalar(title: &str) -> Result<String, CodecError> {
        let plain = serde_yaml::to_string(title).map_err(|e| encode_error(e.to_string()))?;
        let plain = plain.strip_suffix('\n').unwrap_or(&plain);
        if !plain.contains('\n') {
            return Ok(plain.to_string());
        }
        serde_json::to_string(title).map_err(|e| encode_error(e.to_string()))
    }

    fn encode_error(message: String) -> CodecError {
        CodecError::Encode {
            format: Format::Yaml,
            message,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn name_precedes_children() {
            let tree = Node::with_children("root", vec![Node::new("a")]);
            let out = encode(&tree).expect("encode");
            assert_eq!(out, "name: root\nchildren:\n- name: a\n");
        }

        #[test]
        fn nested_items_indent_under_their_dash() {
            let tree = Node::with_children(
                "root",
                vec![
                    Node::with_children("a", vec![Node::new("a1")]),
                    Node::new("b"),
                ],
            );
            let out = encode(&tree).expect("encode");
            assert_eq!(
                out,
                "name: root\nchildren:\n- name: a\n  children:\n  - name: a1\n- name: b\n"
            );
            assert_eq!(decode(&out, &DecodeOptions::default()).expect("decode"), tree);
        }

        #[test]
        fn awkward_titles_are_quoted() {
            let tree = Node::with_children(
                "line one\nline two",
                vec![
                    Node::new("- dash"),
                    Node::new("key: value"),
                    Node::new("#hash"),
                    Node::new("null"),
                    Node::new(" padded "),
                    Node::new("tab\there"),
                ],
            );
            let out = encode(&tree).expect("encode");
            assert_eq!(decode(&out, &DecodeOptions::default()).expect("decode"), tree);
        }

        #[test]
        fn refuses_trees_it_could_not_read_back() {
            let mut node = Node::new("leaf");
            for level in 1..=MAX_DEPTH {
                node = Node::with_children(format!("l{level}"), vec![node]);
            }
            let err = encode(&node).expect_err("one level too deep");
            assert!(matches!(err, CodecError::Encode { format: Format::Yaml, .. }), "{err:?}");
        }

        #[test]
        fn decodes_hand_written_yaml() {
            let input = "\
# outline
name: Trip
children:
  - name: Packing
    children:
      - name: socks
  - name: Route
    notes: ignored
";
            let node = decode(input, &DecodeOptions::default()).expect("decode");
            assert_eq!(
                node,
                Node::with_children(
                    "Trip",
                    vec![
                        Node::with_children("Packing", vec![Node::new("socks")]),
                        Node::new("Route"),
                    ]
                )
            );
        }

        #[test]
        fn unquoted_number_title_is_rejected() {
            let err = decode("name: 42\n", &DecodeOptions::default()).expect_err("number");
            assert!(
                matches!(&err, CodecError::Decode { format: Format::Yaml, path, .. } if path == "$.name"),
                "{err:?}"
            );
        }

        #[test]
        fn scalar_document_is_rejected() {
            let err = decode("just text\n", &DecodeOptions::default()).expect_err("scalar");
            assert!(matches!(err, CodecError::Validation { .. }), "{err:?}");
        }
    }
}

pub mod text {
    //! Indentation-based plain text: one title per line, two spaces per level.
    //!
    //! Decoding keeps the chain of currently open topics (root, its last child, that
    //! child's last child, ...). Each line either closes part of that chain and starts a
    //! new child at its level, or is rejected. Lines are never revisited, so depth costs
    //! heap, not stack.
    //!
    //! Titles must be single lines that do not start with whitespace. `encode` writes
    //! other titles as they are, and they do not decode back to the same tree: a leading
    //! space shifts the indentation and a line break starts a new line.

    use crate::codec::{DecodeOptions, Format};
    use crate::core::{INDENT_WIDTH, Node};
    use crate::error::CodecError;
    use nom::{
        IResult,
        bytes::complete::take_while,
        character::complete::satisfy,
        combinator::{not, rest},
        error::VerboseError,
        sequence::{pair, terminated},
    };
    use tracing::trace;

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    pub fn encode(node: &Node) -> String {
        let mut out = String::new();
        let mut stack = vec![(node, 0usize)];
        while let Some((node, depth)) = stack.pop() {
            out.push_str(&" ".repeat(depth * INDENT_WIDTH));
            out.push_str(&node.title);
            out.push('\n');
            stack.extend(node.children.iter().rev().map(|child| (child, depth + 1)));
        }
        out
    }

    pub fn decode(input: &str, opts: &DecodeOptions) -> Result<Node, CodecError> {
        let mut lines = input.lines().enumerate().map(|(idx, line)| (idx + 1, line));

        let Some((_, first)) = lines.next() else {
            return Err(format_error(1, "input is empty"));
        };
        let (indent, title) = split_line(first, 1)?;
        if indent != 0 {
            return Err(format_error(
                1,
                format!("the root line must not be indented (found {indent} spaces)"),
            ));
        }
        opts.check_depth(Format::Text, 1)?;

        // open[i] sits at indentation i * INDENT_WIDTH.
        let mut open = vec![Node::new(title)];
        for (number, line) in lines {
            if line.is_empty() {
                continue;
            }
            let (indent, title) = split_line(line, number)?;
            let deepest = (open.len() - 1) * INDENT_WIDTH;

            if indent == 0 {
                return Err(format_error(
                    number,
                    "a second unindented line; the text must hold exactly one root",
                ));
            }
            if indent % INDENT_WIDTH != 0 {
                let message = if indent < deepest {
                    format!(
                        "unexpected dedent to {indent} spaces, between levels {} and {}",
                        indent - indent % INDENT_WIDTH,
                        indent - indent % INDENT_WIDTH + INDENT_WIDTH
                    )
                } else {
                    format!(
                        "indentation of {indent} spaces is not a multiple of {INDENT_WIDTH}"
                    )
                };
                return Err(format_error(number, message));
            }
            if indent > deepest + INDENT_WIDTH {
                return Err(format_error(
                    number,
                    format!(
                        "indented {indent} spaces under a topic at {deepest}; expected at most {}",
                        deepest + INDENT_WIDTH
                    ),
                ));
            }

            let level = indent / INDENT_WIDTH;
            close_to(&mut open, level);
            trace!(line = number, level, "child topic");
            open.push(Node::new(title));
            opts.check_depth(Format::Text, open.len())?;
        }

        close_to(&mut open, 1);
        match open.pop() {
            Some(root) => Ok(root),
            None => Err(format_error(1, "input is empty")),
        }
    }

    /// Fold finished topics into their parents until `len` remain open.
    fn close_to(open: &mut Vec<Node>, len: usize) {
        while open.len() > len {
            let Some(done) = open.pop() else { break };
            if let Some(parent) = open.last_mut() {
                parent.children.push(done);
            }
        }
    }

    fn split_line(line: &str, number: usize) -> Result<(usize, &str), CodecError> {
        let (_, (lead, title)) = indented(line).map_err(|_| {
            let bad = line.trim_start_matches(' ').chars().next().unwrap_or(' ');
            format_error(
                number,
                format!("indentation must use spaces only, found {bad:?}"),
            )
        })?;
        Ok((lead.len(), title))
    }

    /// Leading spaces, then the title. Any other whitespace inside the indentation fails.
    fn indented(i: &str) -> PResult<'_, (&str, &str)> {
        pair(
            terminated(take_while(|c: char| c == ' '), not(satisfy(char::is_whitespace))),
            rest,
        )(i)
    }

    fn format_error(line: usize, message: impl Into<String>) -> CodecError {
        CodecError::Format {
            line,
            message: message.into(),
        }
    }

}

pub mod xml {
    //! XML mirror of the `{name, children}` mapping:
    //!
    //! ```text
    //! <?xml version="1.0" encoding="UTF-8"?>
    //! <root><name>..</name><children><item>..</item>..</children></root>
    //! ```
    //!
    //! Decoding expects exactly this wrapping (any document element name is accepted and
    //! attributes are ignored). It is not a general XML-to-tree reader.

    use crate::codec::{DecodeOptions, Format};
    use crate::core::Node;
    use crate::error::CodecError;
    use indexmap::IndexMap;
    use quick_xml::{
        Reader, Writer,
        events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
    };
    use std::io::Write;

    const ROOT: &str = "root";
    const NAME: &str = "name";
    const CHILDREN: &str = "children";
    const ITEM: &str = "item";

    /* ------------------------------ Encoding ------------------------------ */

    enum Step<'a> {
        Open(&'static str),
        Close(&'static str),
        Fields(&'a Node),
    }

    pub fn encode(node: &Node, pretty: bool) -> Result<String, CodecError> {
        let encode_error = |message: String| CodecError::Encode {
            format: Format::Xml,
            message,
        };
        let mut writer = if pretty {
            Writer::new_with_indent(Vec::new(), b' ', 2)
        } else {
            Writer::new(Vec::new())
        };
        write_document(&mut writer, node).map_err(|e| encode_error(format!("{e:#}")))?;
        let mut bytes = writer.into_inner();
        if pretty {
            bytes.push(b'\n');
        }
        String::from_utf8(bytes).map_err(|e| encode_error(e.to_string()))
    }

    fn write_document<W: Write>(writer: &mut Writer<W>, node: &Node) -> anyhow::Result<()> {
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        let mut steps = vec![Step::Close(ROOT), Step::Fields(node), Step::Open(ROOT)];
        while let Some(step) = steps.pop() {
            match step {
                Step::Open(tag) => writer.write_event(Event::Start(BytesStart::new(tag)))?,
                Step::Close(tag) => writer.write_event(Event::End(BytesEnd::new(tag)))?,
                Step::Fields(node) => {
                    writer.write_event(Event::Start(BytesStart::new(NAME)))?;
                    writer.write_event(Event::Text(BytesText::new(&node.title)))?;
                    writer.write_event(Event::End(BytesEnd::new(NAME)))?;
                    if !node.children.is_empty() {
                        steps.push(Step::Close(CHILDREN));
                        for child in node.children.iter().rev() {
                            steps.push(Step::Close(ITEM));
                            steps.push(Step::Fields(child));
                            steps.push(Step::Open(ITEM));
                        }
                        steps.push(Step::Open(CHILDREN));
                    }
                }
            }
        }
        Ok(())
    }

    /* ------------------------------ Decoding ------------------------------ */

    /// Attribute-free element tree, as read off the event stream.
    #[derive(Debug, Default)]
    struct Element {
        name: String,
        text: String,
        children: Vec<Element>,
    }

    struct Frame<'e> {
        title: String,
        path: String,
        items: Vec<&'e Element>,
        next: usize,
        children: Vec<Node>,
    }

    pub fn decode(input: &str, opts: &DecodeOptions) -> Result<Node, CodecError> {
        let document = read_elements(input, opts)?;
        if document.children.is_empty() {
            return Err(CodecError::Validation {
                format: Format::Xml,
                message: format!(
                    "document element <{}> holds no fields, expected a mapping",
                    document.name
                ),
            });
        }
        opts.check_depth(Format::Xml, 1)?;

        let mut stack = vec![open_mapping(&document, format!("/{}", document.name))?];
        while let Some(mut frame) = stack.pop() {
            if let Some(item) = frame.items.get(frame.next).copied() {
                let path = format!("{}/{CHILDREN}/{ITEM}[{}]", frame.path, frame.next);
                frame.next += 1;
                if item.children.is_empty() {
                    return Err(decode_error(path, "expected a mapping with a <name> field"));
                }
                let child = open_mapping(item, path)?;
                stack.push(frame);
                opts.check_depth(Format::Xml, stack.len() + 1)?;
                stack.push(child);
                continue;
            }
            let node = Node::with_children(frame.title, frame.children);
            match stack.last_mut() {
                Some(parent) => parent.children.push(node),
                None => return Ok(node),
            }
        }
        unreachable!("the root frame yields the result before the stack empties")
    }

    /// Strip one mapping element down to its title and the `<item>`s of its children wrapper.
    fn open_mapping(element: &Element, path: String) -> Result<Frame<'_>, CodecError> {
        let mut fields: IndexMap<&str, Vec<&Element>> = IndexMap::new();
        for child in &element.children {
            fields.entry(child.name.as_str()).or_default().push(child);
        }

        let title = match fields.get(NAME).map(Vec::as_slice) {
            None | Some([]) => return Err(decode_error(path, "missing <name> element")),
            Some([name]) => {
                if let Some(nested) = name.children.first() {
                    return Err(decode_error(
                        format!("{path}/{NAME}"),
                        format!("expected text, found element <{}>", nested.name),
                    ));
                }
                name.text.clone()
            }
            Some(_) => return Err(decode_error(path, "more than one <name> element")),
        };

        let items = match fields.get(CHILDREN).map(Vec::as_slice) {
            None | Some([]) => vec![],
            Some([wrapper]) => {
                let wrapper_path = format!("{path}/{CHILDREN}");
                if wrapper.children.is_empty() {
                    return Err(decode_error(wrapper_path, "expected a list of <item> elements"));
                }
                let mut items = Vec::with_capacity(wrapper.children.len());
                for child in &wrapper.children {
                    if child.name != ITEM {
                        return Err(decode_error(
                            wrapper_path,
                            format!("expected <{ITEM}>, found <{}>", child.name),
                        ));
                    }
                    items.push(child);
                }
                items
            }
            Some(_) => return Err(decode_error(path, "more than one <children> element")),
        };

        Ok(Frame {
            title,
            path,
            next: 0,
            children: Vec::with_capacity(items.len()),
            items,
        })
    }

    fn read_elements(input: &str, opts: &DecodeOptions) -> Result<Element, CodecError> {
        let mut reader = Reader::from_str(input);
        reader.config_mut().trim_text(false);
        reader.config_mut().expand_empty_elements = true;

        // Each tree level costs an <item> and a <children> element.
        let max_nesting = opts.max_depth.saturating_mul(2).saturating_add(2);
        let mut open: Vec<Element> = Vec::new();
        let mut document: Option<Element> = None;
        loop {
            let event = reader.read_event().map_err(|e| {
                syntax_error(format!("{e} (near byte {})", reader.buffer_position()))
            })?;
            match event {
                Event::Start(start) => {
                    if document.is_some() {
                        return Err(syntax_error("more than one document element"));
                    }
                    if open.len() >= max_nesting {
                        return Err(CodecError::Validation {
                            format: Format::Xml,
                            message: format!("tree is deeper than {} levels", opts.max_depth),
                        });
                    }
                    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
                    open.push(Element {
                        name,
                        ..Element::default()
                    });
                }
                Event::End(_) => {
                    let Some(done) = open.pop() else {
                        return Err(syntax_error("closing tag without an opening tag"));
                    };
                    match open.last_mut() {
                        Some(parent) => parent.children.push(done),
                        None => document = Some(done),
                    }
                }
                Event::Text(text) => {
                    let text = text
                        .unescape()
                        .map_err(|e| syntax_error(format!("bad escape: {e}")))?;
                    match open.last_mut() {
                        Some(element) => element.text.push_str(&text),
                        None if text.trim().is_empty() => {}
                        None => return Err(syntax_error("text outside the document element")),
                    }
                }
                Event::CData(data) => {
                    if let Some(element) = open.last_mut() {
                        element
                            .text
                            .push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if let Some(unclosed) = open.last() {
            return Err(syntax_error(format!("element <{}> is never closed", unclosed.name)));
        }
        document.ok_or_else(|| syntax_error("no document element"))
    }

    fn syntax_error(message: impl Into<String>) -> CodecError {
        CodecError::Syntax {
            format: Format::Xml,
            message: message.into(),
        }
    }

    fn decode_error(path: String, message: impl Into<String>) -> CodecError {
        CodecError::Decode {
            format: Format::Xml,
            path,
            message: message.into(),
        }
    }

}

pub mod document {
    //! The mind-map document the pipelines read from and write to: a workbook of sheets,
    //! each holding one root topic.
    //!
    //! Sheets are persisted as a flat pre-order list of topics with parent indexes, so a
    //! stored document never nests deeper than the record list itself.

    use crate::core::{Tree, fold};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct WorkbookId(pub Uuid);

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct SheetId(pub Uuid);

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TopicId(pub Uuid);

    impl TopicId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl Default for TopicId {
        fn default() -> Self {
            Self::new()
        }
    }

    /* ------------------------------ Aggregate ------------------------------ */

    /// Aggregate root: one mind-map document.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Workbook {
        pub id: WorkbookId,
        pub created: DateTime<Utc>,
        pub modified: DateTime<Utc>,
        #[serde(default)]
        pub sheets: Vec<Sheet>,
    }

    impl Workbook {
        /// A workbook with one blank sheet.
        pub fn new() -> Self {
            let now = Utc::now();
            Self {
                id: WorkbookId(Uuid::new_v4()),
                created: now,
                modified: now,
                sheets: vec![Sheet::new("")],
            }
        }

        pub fn primary_sheet(&self) -> Option<&Sheet> {
            self.sheets.first()
        }

        pub fn primary_sheet_mut(&mut self) -> Option<&mut Sheet> {
            self.sheets.first_mut()
        }

        pub fn touch(&mut self) {
            self.modified = Utc::now();
        }
    }

    impl Default for Workbook {
        fn default() -> Self {
            Self::new()
        }
    }

    /* ------------------------------ Entities ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
    #[serde(try_from = "SheetRecord")]
    pub struct Sheet {
        pub id: SheetId,
        title: String,
        root: Topic,
    }

    impl Sheet {
        pub fn new(title: impl Into<String>) -> Self {
            Self {
                id: SheetId(Uuid::new_v4()),
                title: title.into(),
                root: Topic::new(""),
            }
        }

        pub fn title(&self) -> &str {
            &self.title
        }

        pub fn set_title(&mut self, title: impl Into<String>) {
            self.title = title.into();
        }

        pub fn root_topic(&self) -> &Topic {
            &self.root
        }

        pub fn root_topic_mut(&mut self) -> &mut Topic {
            &mut self.root
        }
    }

    /// One topic with its ordered sub-topics.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Topic {
        pub id: TopicId,
        title: String,
        sub_topics: Vec<Topic>,
    }

    impl Topic {
        pub fn new(title: impl Into<String>) -> Self {
            Self {
                id: TopicId::new(),
                title: title.into(),
                sub_topics: vec![],
            }
        }

        pub fn title(&self) -> &str {
            &self.title
        }

        pub fn set_title(&mut self, title: impl Into<String>) {
            self.title = title.into();
        }

        pub fn sub_topics(&self) -> &[Topic] {
            &self.sub_topics
        }

        /// Append an empty sub-topic and hand it back for filling in.
        pub fn add_sub_topic(&mut self) -> &mut Topic {
            self.sub_topics.push(Topic::new(""));
            let last = self.sub_topics.len() - 1;
            &mut self.sub_topics[last]
        }

        pub fn last_sub_topic_mut(&mut self) -> Option<&mut Topic> {
            self.sub_topics.last_mut()
        }
    }

    impl Tree for Topic {
        fn branches(&self) -> &[Self] {
            &self.sub_topics
        }
    }

    impl Drop for Topic {
        fn drop(&mut self) {
            let mut pending = std::mem::take(&mut self.sub_topics);
            while let Some(mut topic) = pending.pop() {
                pending.append(&mut topic.sub_topics);
            }
        }
    }

    /* --------------------------- Stored layout --------------------------- */

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct SheetRecord {
        id: SheetId,
        title: String,
        /// Pre-order; the first record is the root topic.
        topics: Vec<TopicRecord>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TopicRecord {
        id: TopicId,
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<usize>,
    }

    impl Serialize for Sheet {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            SheetRecord::from(self).serialize(serializer)
        }
    }

    impl From<&Sheet> for SheetRecord {
        fn from(sheet: &Sheet) -> Self {
            let mut topics = Vec::new();
            let mut stack = vec![(&sheet.root, None)];
            while let Some((topic, parent)) = stack.pop() {
                let index = topics.len();
                topics.push(TopicRecord {
                    id: topic.id,
                    title: topic.title.clone(),
                    parent,
                });
                stack.extend(topic.sub_topics.iter().rev().map(|sub| (sub, Some(index))));
            }
            SheetRecord {
                id: sheet.id,
                title: sheet.title.clone(),
                topics,
            }
        }
    }

    impl TryFrom<SheetRecord> for Sheet {
        type Error = String;

        fn try_from(record: SheetRecord) -> Result<Self, Self::Error> {
            let count = record.topics.len();
            if count == 0 {
                return Err(format!("sheet {:?} has no root topic", record.title));
            }

            let mut sub_indexes: Vec<Vec<usize>> = vec![Vec::new(); count];
            for (index, topic) in record.topics.iter().enumerate() {
                match (index, topic.parent) {
                    (0, None) => {}
                    (0, Some(_)) => return Err("the root topic cannot have a parent".into()),
                    (_, None) => return Err(format!("topic {index} has no parent")),
                    (_, Some(parent)) if parent >= index => {
                        return Err(format!(
                            "topic {index} names parent {parent}, which does not precede it"
                        ));
                    }
                    (_, Some(parent)) => sub_indexes[parent].push(index),
                }
            }

            // Parents precede their sub-topics, so building back to front always finds
            // every sub-topic finished.
            let mut built: Vec<Option<Topic>> = Vec::with_capacity(count);
            built.resize_with(count, || None);
            for (index, record_topic) in record.topics.iter().enumerate().rev() {
                let mut topic = Topic {
                    id: record_topic.id,
                    title: record_topic.title.clone(),
                    sub_topics: Vec::with_capacity(sub_indexes[index].len()),
                };
                for &sub in &sub_indexes[index] {
                    if let Some(done) = built[sub].take() {
                        topic.sub_topics.push(done);
                    }
                }
                built[index] = Some(topic);
            }

            let root = built[0].take().ok_or("root topic went missing")?;
            Ok(Sheet {
                id: record.id,
                title: record.title,
                root,
            })
        }
    }

    /// Total number of topics under (and including) `topic`.
    pub fn topic_count(topic: &Topic) -> usize {
        fold(topic, |_, below: Vec<usize>| 1 + below.into_iter().sum::<usize>())
    }

}

pub mod storage {
    use super::document::Workbook;
    use anyhow::{Context, Result};
    use std::{fs, path::Path};

    /// Loads and saves whole documents; pipelines never touch the container directly.
    pub trait DocumentStore {
        fn load(&self, path: &Path) -> Result<Workbook>;

        /// Persist `workbook` at `path` in one write.
        fn save(&self, workbook: &Workbook, path: &Path) -> Result<()>;
    }

    /// Stores a workbook as a JSON file.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct JsonWorkbookStore;

    impl DocumentStore for JsonWorkbookStore {
        fn load(&self, path: &Path) -> Result<Workbook> {
            let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            serde_json::from_str(&text).with_context(|| format!("parsing document {:?}", path))
        }

        fn save(&self, workbook: &Workbook, path: &Path) -> Result<()> {
            let json = serde_json::to_string_pretty(workbook)
                .with_context(|| format!("serializing document for {:?}", path))?;
            fs::write(path, json.as_bytes()).with_context(|| format!("writing {:?}", path))
        }
    }

}

pub mod pipeline {
    //! Extraction: document -> tree -> text. Construction: text -> tree -> document.

    use crate::codec::{DecodeOptions, Format};
    use crate::core::{Node, fold};
    use crate::document::{Topic, Workbook};
    use crate::storage::DocumentStore;
    use anyhow::{Context, Result, anyhow};
    use std::path::Path;
    use tracing::debug;

    pub fn node_from_topic(topic: &Topic) -> Node {
        fold(topic, |topic, children| Node::with_children(topic.title(), children))
    }

    /// Give `root` the title of `node` and grow its sub-topics to match, one
    /// `add_sub_topic` per child. A topic with children of its own is moved onto the
    /// stack while it is filled and put back into its slot afterwards.
    pub fn populate(root: &mut Topic, node: &Node) {
        struct Frame<'a> {
            node: &'a Node,
            next: usize,
            topic: Topic,
        }

        let mut topic = std::mem::replace(root, Topic::new(""));
        topic.set_title(node.title.as_str());
        let mut stack = vec![Frame {
            node,
            next: 0,
            topic,
        }];

        while let Some(frame) = stack.last_mut() {
            let parent = frame.node;
            if let Some(child) = parent.children.get(frame.next) {
                frame.next += 1;
                let sub = frame.topic.add_sub_topic();
                sub.set_title(child.title.as_str());
                if !child.is_leaf() {
                    let topic = std::mem::replace(sub, Topic::new(""));
                    stack.push(Frame {
                        node: child,
                        next: 0,
                        topic,
                    });
                }
                continue;
            }

            let Some(done) = stack.pop() else { break };
            match stack.last_mut() {
                Some(frame) => {
                    if let Some(slot) = frame.topic.last_sub_topic_mut() {
                        *slot = done.topic;
                    }
                }
                None => *root = done.topic,
            }
        }
    }

    /// Read the primary sheet's topic tree out of a stored document.
    pub fn extract(store: &impl DocumentStore, document: &Path) -> Result<Node> {
        let workbook = store.load(document)?;
        let sheet = workbook
            .primary_sheet()
            .ok_or_else(|| anyhow!("document {:?} has no sheets", document))?;
        let node = node_from_topic(sheet.root_topic());
        debug!(
            document = %document.display(),
            topics = node.count(),
            depth = node.depth(),
            "extracted topic tree"
        );
        Ok(node)
    }

    pub fn extract_text(
        store: &impl DocumentStore,
        document: &Path,
        format: Format,
        pretty: bool,
    ) -> Result<String> {
        let node = extract(store, document)?;
        let text = format
            .encode(&node, pretty)
            .with_context(|| format!("encoding {:?} as {format}", document))?;
        debug!(%format, pretty, bytes = text.len(), "encoded topic tree");
        Ok(text)
    }

    /// A fresh workbook whose primary sheet holds `node`; the sheet takes the root's title.
    pub fn build_workbook(node: &Node) -> Workbook {
        let mut workbook = Workbook::new();
        if let Some(sheet) = workbook.primary_sheet_mut() {
            sheet.set_title(node.title.as_str());
            populate(sheet.root_topic_mut(), node);
        }
        workbook
    }

    /// Decode `source` completely, then write a new document at `document`.
    /// Nothing is written when decoding fails.
    pub fn construct(
        store: &impl DocumentStore,
        source: &str,
        format: Format,
        opts: &DecodeOptions,
        document: &Path,
    ) -> Result<Workbook> {
        let node = format
            .decode_with(source, opts)
            .with_context(|| format!("decoding {format} source"))?;
        debug!(%format, topics = node.count(), depth = node.depth(), "decoded topic tree");

        let mut workbook = build_workbook(&node);
        workbook.touch();
        store.save(&workbook, document)?;
        debug!(document = %document.display(), "saved document");
        Ok(workbook)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::error::CodecError;
        use crate::storage::JsonWorkbookStore;
        use pretty_assertions::assert_eq;
        use rstest::rstest;

        fn sample() -> Node {
            Node::with_children(
                "Launch",
                vec![
                    Node::with_children("Design", vec![Node::new("mockups"), Node::new("review")]),
                    Node::new("Ship"),
                ],
            )
        }

        #[test]
        fn topics_and_nodes_convert_both_ways() {
            let mut topic = Topic::new("");
            let id = topic.id;
            populate(&mut topic, &sample());
            assert_eq!(topic.id, id);
            assert_eq!(topic.title(), "Launch");
            assert_eq!(topic.sub_topics()[0].sub_topics()[1].title(), "review");
            assert_eq!(node_from_topic(&topic), sample());
        }

        #[test]
        fn populate_appends_after_existing_sub_topics() {
            let mut topic = Topic::new("old");
            topic.add_sub_topic().set_title("kept");
            populate(&mut topic, &Node::with_children("new", vec![Node::new("added")]));
            assert_eq!(topic.title(), "new");
            let titles: Vec<_> = topic.sub_topics().iter().map(Topic::title).collect();
            assert_eq!(titles, ["kept", "added"]);
        }

        #[test]
        fn populate_builds_deep_chains() {
            let mut node = Node::new("leaf");
            for level in (0..2_000).rev() {
                node = Node::with_children(format!("level {level}"), vec![node]);
            }
            let mut topic = Topic::new("");
            populate(&mut topic, &node);
            assert_eq!(crate::document::topic_count(&topic), 2_001);
            assert_eq!(node_from_topic(&topic), node);
        }

        #[rstest]
        #[case(Format::Json)]
        #[case(Format::Xml)]
        #[case(Format::Yaml)]
        #[case(Format::Text)]
        fn construct_then_extract(#[case] format: Format) {
            let tmp = tempfile::tempdir().expect("tempdir");
            let document = tmp.path().join("launch.mindmap");
            let source = format.encode(&sample(), true).expect("encode");

            let workbook = construct(
                &JsonWorkbookStore,
                &source,
                format,
                &DecodeOptions::default(),
                &document,
            )
            .expect("construct");
            assert_eq!(workbook.primary_sheet().expect("sheet").title(), "Launch");

            assert_eq!(extract(&JsonWorkbookStore, &document).expect("extract"), sample());
            let text = extract_text(&JsonWorkbookStore, &document, format, false).expect("text");
            assert_eq!(format.decode(&text).expect("decode"), sample());
        }

        #[test]
        fn failed_decode_writes_nothing() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let document = tmp.path().join("never.mindmap");
            let err = construct(
                &JsonWorkbookStore,
                "root\n  child\n bad\n",
                Format::Text,
                &DecodeOptions::default(),
                &document,
            )
            .expect_err("bad indentation");
            assert!(matches!(
                err.downcast_ref::<CodecError>(),
                Some(CodecError::Format { line: 3, .. })
            ));
            assert!(!document.exists());
        }

        #[test]
        fn extract_requires_a_sheet() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let document = tmp.path().join("empty.mindmap");
            let mut workbook = Workbook::new();
            workbook.sheets.clear();
            JsonWorkbookStore.save(&workbook, &document).expect("save");
            let err = extract(&JsonWorkbookStore, &document).expect_err("no sheets");
            assert!(err.to_string().contains("no sheets"), "{err}");
        }

        #[test]
        fn deep_documents_extract_without_recursion() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let document = tmp.path().join("deep.mindmap");
            let mut node = Node::new("bottom");
            for level in 0..2_000 {
                node = Node::with_children(format!("l{level}"), vec![node]);
            }
            let workbook = build_workbook(&node);
            JsonWorkbookStore.save(&workbook, &document).expect("save");
            let extracted = extract(&JsonWorkbookStore, &document).expect("extract");
            assert_eq!(extracted.depth(), 2_001);
            let text = extract_text(&JsonWorkbookStore, &document, Format::Text, false)
                .expect("text");
            assert_eq!(text.lines().count(), 2_001);
        }
    }
}

pub use crate::codec::{DecodeOptions, Format};
pub use crate::core::Node;
pub use crate::error::CodecError;
