//! Outline-to-graph conversion for Roam and Logseq style exports.
//! A run takes a parsed block tree, builds one node per block depth-first,
//! resolves every link in a second pass and emits the intermediate node graph.

use nom::{IResult, error::VerboseError};

type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

pub mod core {
    use crate::tif::{NodeType, TifAttribute, TifNode, TodoState};
    use chrono::NaiveDate;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{
        collections::{BTreeMap, HashMap},
        fmt,
    };
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    /// Globally unique identifier of an output node.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct NodeUid(pub String);

    impl NodeUid {
        pub fn new() -> Self {
            Self(Uuid::new_v4().simple().to_string())
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl fmt::Display for NodeUid {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /// Position of a node inside a [`NodeArena`]. Only the arena mints these.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct NodeId(usize);

    /* ------------------------------ Input ------------------------------ */

    /// A raw unit of source content, as produced by a format reader.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Block {
        /// Opaque source identifier, the target of `((id))` references.
        pub id: String,
        pub text: String,
        #[serde(default)]
        pub children: Vec<Block>,
        /// Milliseconds since the epoch, when the source export carries it.
        #[serde(default)]
        pub created_at: Option<i64>,
        #[serde(default)]
        pub edited_at: Option<i64>,
    }

    impl Block {
        pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
            Self {
                id: id.into(),
                text: text.into(),
                children: vec![],
                created_at: None,
                edited_at: None,
            }
        }

        pub fn with_children(mut self, children: Vec<Block>) -> Self {
            self.children = children;
            self
        }

        pub fn with_times(mut self, created_at: Option<i64>, edited_at: Option<i64>) -> Self {
            self.created_at = created_at;
            self.edited_at = edited_at;
            self
        }
    }

    /// One exported document. Its top-level blocks are pages.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Document {
        #[serde(default)]
        pub pages: Vec<Block>,
    }

    impl Document {
        pub fn new(pages: Vec<Block>) -> Self {
            Self { pages }
        }

        pub fn block_count(&self) -> usize {
            fn rec(blocks: &[Block]) -> usize {
                blocks.iter().map(|b| 1 + rec(&b.children)).sum()
            }
            rec(&self.pages)
        }
    }

    /* ------------------------------ Node arena ------------------------------ */

    /// A node while the graph is being built and resolved.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct NodeData {
        pub uid: NodeUid,
        pub name: String,
        pub node_type: NodeType,
        pub children: Vec<NodeId>,
        /// Weak references: lookup keys into the same node set, never handles.
        pub refs: Vec<NodeUid>,
        pub todo_state: Option<TodoState>,
        pub media_url: Option<String>,
        pub code_language: Option<String>,
        pub created_at: i64,
        pub edited_at: i64,
        /// Calendar day of a `date` node.
        pub date: Option<NaiveDate>,
        /// Synthesized for a reference whose target did not exist.
        pub placeholder: bool,
    }

    impl NodeData {
        pub fn new(node_type: NodeType, name: impl Into<String>, timestamp: i64) -> Self {
            Self {
                uid: NodeUid::new(),
                name: name.into(),
                node_type,
                children: vec![],
                refs: vec![],
                todo_state: None,
                media_url: None,
                code_language: None,
                created_at: timestamp,
                edited_at: timestamp,
                date: None,
                placeholder: false,
            }
        }
    }

    /// Flat node storage keyed by position; the forest shape lives in `roots`
    /// and each node's `children`. Appending never invalidates existing ids.
    #[derive(Debug, Clone, Default)]
    pub struct NodeArena {
        nodes: Vec<NodeData>,
        roots: Vec<NodeId>,
    }

    impl NodeArena {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&mut self, node: NodeData) -> NodeId {
            self.nodes.push(node);
            NodeId(self.nodes.len() - 1)
        }

        /// Append a node at the document's top level.
        pub fn push_root(&mut self, node: NodeData) -> NodeId {
            let id = self.push(node);
            self.roots.push(id);
            id
        }

        pub fn add_root(&mut self, id: NodeId) {
            self.roots.push(id);
        }

        pub fn get(&self, id: NodeId) -> &NodeData {
            &self.nodes[id.0]
        }

        pub fn get_mut(&mut self, id: NodeId) -> &mut NodeData {
            &mut self.nodes[id.0]
        }

        pub fn id_at(&self, index: usize) -> Option<NodeId> {
            (index < self.nodes.len()).then_some(NodeId(index))
        }

        pub fn len(&self) -> usize {
            self.nodes.len()
        }

        pub fn is_empty(&self) -> bool {
            self.nodes.is_empty()
        }

        pub fn roots(&self) -> &[NodeId] {
            &self.roots
        }

        pub fn iter(&self) -> impl Iterator<Item = &NodeData> {
            self.nodes.iter()
        }

        pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NodeData> {
            self.nodes.iter_mut()
        }

        /// Depth-first, pre-order walk over every node reachable from a root.
        pub fn walk(&self, mut visit: impl FnMut(&NodeData)) {
            let mut stack: Vec<NodeId> = self.roots.iter().rev().copied().collect();
            while let Some(id) = stack.pop() {
                let node = self.get(id);
                visit(node);
                stack.extend(node.children.iter().rev().copied());
            }
        }

        /// Materialize the owned output forest.
        pub fn to_forest(&self) -> Vec<TifNode> {
            self.roots.iter().map(|id| self.to_tif(*id)).collect()
        }

        fn to_tif(&self, id: NodeId) -> TifNode {
            let node = self.get(id);
            let children: Vec<TifNode> = node.children.iter().map(|c| self.to_tif(*c)).collect();
            TifNode {
                uid: node.uid.0.clone(),
                name: node.name.clone(),
                description: None,
                children: (!children.is_empty()).then_some(children),
                refs: (!node.refs.is_empty())
                    .then(|| node.refs.iter().map(|u| u.0.clone()).collect()),
                created_at: node.created_at,
                edited_at: node.edited_at,
                node_type: node.node_type,
                media_url: node.media_url.clone(),
                code_language: node.code_language.clone(),
                todo_state: node.todo_state,
            }
        }
    }

    /* ------------------------------ Name index ------------------------------ */

    /// Lookup tables from authored names, source block ids and calendar days
    /// to node uids. First writer wins on every table.
    #[derive(Debug, Clone, Default)]
    pub struct NameIndex {
        by_name: IndexMap<String, NodeUid>,
        by_folded_name: HashMap<String, NodeUid>,
        by_block: HashMap<String, NodeUid>,
        by_date: BTreeMap<NaiveDate, NodeUid>,
    }

    impl NameIndex {
        pub fn new() -> Self {
            Self::default()
        }

        /// Returns `false` when the name already points at a canonical node.
        pub fn insert_name(&mut self, name: &str, uid: &NodeUid) -> bool {
            if name.is_empty() || self.by_name.contains_key(name) {
                return false;
            }
            self.by_name.insert(name.to_string(), uid.clone());
            self.by_folded_name
                .entry(name.to_lowercase())
                .or_insert_with(|| uid.clone());
            true
        }

        pub fn name(&self, name: &str) -> Option<&NodeUid> {
            self.by_name.get(name)
        }

        /// Exact match first, then a case-insensitive one.
        pub fn name_folded(&self, name: &str) -> Option<&NodeUid> {
            self.by_name
                .get(name)
                .or_else(|| self.by_folded_name.get(&name.to_lowercase()))
        }

        pub fn insert_block(&mut self, id: &str, uid: &NodeUid) -> bool {
            if id.is_empty() || self.by_block.contains_key(id) {
                return false;
            }
            self.by_block.insert(id.to_string(), uid.clone());
            true
        }

        pub fn block(&self, id: &str) -> Option<&NodeUid> {
            self.by_block.get(id)
        }

        pub fn insert_date(&mut self, date: NaiveDate, uid: &NodeUid) -> bool {
            if self.by_date.contains_key(&date) {
                return false;
            }
            self.by_date.insert(date, uid.clone());
            true
        }

        pub fn date(&self, date: NaiveDate) -> Option<&NodeUid> {
            self.by_date.get(&date)
        }
    }

    /* ---------------------------- Attribute index ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct AttributeStats {
        /// Distinct raw values in first-seen order.
        pub values: Vec<String>,
        /// Every occurrence of the key, duplicates included.
        pub count: usize,
    }

    /// Document-wide statistics of every `key::value` seen during a run.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct AttributeIndex {
        entries: IndexMap<String, AttributeStats>,
    }

    impl AttributeIndex {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn record(&mut self, key: &str, values: &[String]) {
            let stats = self.entries.entry(key.to_string()).or_default();
            stats.count += 1;
            for value in values {
                if !value.is_empty() && !stats.values.contains(value) {
                    stats.values.push(value.clone());
                }
            }
        }

        pub fn get(&self, key: &str) -> Option<&AttributeStats> {
            self.entries.get(key)
        }

        pub fn len(&self) -> usize {
            self.entries.len()
        }

        pub fn is_empty(&self) -> bool {
            self.entries.is_empty()
        }

        /// Consume the index into the output attribute list.
        pub fn finalize(self) -> Vec<TifAttribute> {
            self.entries
                .into_iter()
                .map(|(name, stats)| TifAttribute {
                    name,
                    values: stats.values,
                    count: stats.count,
                })
                .collect()
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum ConvertError {
        #[error("cannot decode {format} export: {source}")]
        Decode {
            format: &'static str,
            #[source]
            source: serde_json::Error,
        },
        #[error("malformed block tree: {0}")]
        Structure(String),
        #[error("invalid options file: {0}")]
        Config(#[from] toml::de::Error),
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn name_index_keeps_first_writer() {
            let mut index = NameIndex::new();
            let first = NodeUid::new();
            let second = NodeUid::new();
            assert!(index.insert_name("Reading List", &first));
            assert!(!index.insert_name("Reading List", &second));
            assert_eq!(index.name("Reading List"), Some(&first));
            assert_eq!(index.name("reading list"), None);
            assert_eq!(index.name_folded("reading list"), Some(&first));
        }

        #[test]
        fn name_index_ignores_empty_keys() {
            let mut index = NameIndex::new();
            assert!(!index.insert_name("", &NodeUid::new()));
            assert!(!index.insert_block("", &NodeUid::new()));
        }

        #[test]
        fn attribute_index_counts_occurrences_and_dedupes_values() {
            let mut index = AttributeIndex::new();
            index.record("type", &["book".to_string()]);
            index.record("type", &["book".to_string()]);
            index.record("type", &["paper".to_string()]);
            index.record("rating", &[]);

            let attrs = index.finalize();
            assert_eq!(attrs.len(), 2);
            assert_eq!(attrs[0].name, "type");
            assert_eq!(attrs[0].values, vec!["book", "paper"]);
            assert_eq!(attrs[0].count, 3);
            assert_eq!(attrs[1].name, "rating");
            assert!(attrs[1].values.is_empty());
            assert_eq!(attrs[1].count, 1);
        }

        #[test]
        fn arena_forest_omits_empty_lists() {
            let mut arena = NodeArena::new();
            let child = arena.push(NodeData::new(NodeType::Node, "leaf", 7));
            let root = arena.push_root(NodeData::new(NodeType::Node, "root", 7));
            arena.get_mut(root).children.push(child);

            let forest = arena.to_forest();
            assert_eq!(forest.len(), 1);
            assert_eq!(forest[0].name, "root");
            let kids = forest[0].children.as_ref().expect("children");
            assert_eq!(kids[0].name, "leaf");
            assert!(kids[0].children.is_none());
            assert!(kids[0].refs.is_none());
            assert_eq!(kids[0].created_at, 7);
        }

        #[test]
        fn walk_visits_only_reachable_nodes_in_preorder() {
            let mut arena = NodeArena::new();
            let a = arena.push_root(NodeData::new(NodeType::Node, "a", 0));
            let b = arena.push(NodeData::new(NodeType::Node, "b", 0));
            let c = arena.push(NodeData::new(NodeType::Node, "c", 0));
            arena.push(NodeData::new(NodeType::Node, "orphan", 0));
            arena.get_mut(a).children = vec![b, c];

            let mut seen = Vec::new();
            arena.walk(|n| seen.push(n.name.clone()));
            assert_eq!(seen, vec!["a", "b", "c"]);
        }

        #[test]
        fn document_counts_nested_blocks() {
            let doc = Document::new(vec![
                Block::new("p", "Page")
                    .with_children(vec![Block::new("a", "A").with_children(vec![Block::new("b", "B")])]),
            ]);
            assert_eq!(doc.block_count(), 3);
        }
    }
}

pub mod tif {
    //! The persisted intermediate file. Field names and enum spellings are a
    //! compatibility surface for other tooling.

    use crate::core::ConvertError;
    use serde::{Deserialize, Serialize};
    use serde_with::skip_serializing_none;

    pub const TIF_VERSION: &str = "TanaIntermediateFile V0.1";

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum NodeType {
        Node,
        Field,
        Image,
        Codeblock,
        Date,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum TodoState {
        Todo,
        Done,
    }

    #[skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct TifNode {
        pub uid: String,
        pub name: String,
        pub description: Option<String>,
        pub children: Option<Vec<TifNode>>,
        pub refs: Option<Vec<String>>,
        pub created_at: i64,
        pub edited_at: i64,
        #[serde(rename = "type")]
        pub node_type: NodeType,
        pub media_url: Option<String>,
        pub code_language: Option<String>,
        pub todo_state: Option<TodoState>,
    }

    impl TifNode {
        pub fn children(&self) -> &[TifNode] {
            self.children.as_deref().unwrap_or_default()
        }

        pub fn refs(&self) -> &[String] {
            self.refs.as_deref().unwrap_or_default()
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct TifSummary {
        pub leaf_nodes: usize,
        pub top_level_nodes: usize,
        pub total_nodes: usize,
        pub calendar_nodes: usize,
        pub fields: usize,
        pub broken_refs: usize,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TifAttribute {
        pub name: String,
        pub values: Vec<String>,
        pub count: usize,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TifSupertag {
        pub uid: String,
        pub name: String,
    }

    #[skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TifFile {
        pub version: String,
        pub summary: TifSummary,
        pub nodes: Vec<TifNode>,
        pub attributes: Option<Vec<TifAttribute>>,
        pub supertags: Option<Vec<TifSupertag>>,
    }

    impl TifFile {
        pub fn new(summary: TifSummary, nodes: Vec<TifNode>, attributes: Vec<TifAttribute>) -> Self {
            Self {
                version: TIF_VERSION.to_string(),
                summary,
                nodes,
                attributes: (!attributes.is_empty()).then_some(attributes),
                supertags: None,
            }
        }

        pub fn from_json(input: &str) -> Result<Self, ConvertError> {
            serde_json::from_str(input).map_err(|source| ConvertError::Decode {
                format: "intermediate",
                source,
            })
        }

        pub fn to_json(&self, pretty: bool) -> Result<String, serde_json::Error> {
            if pretty {
                serde_json::to_string_pretty(self)
            } else {
                serde_json::to_string(self)
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use serde_json::{Value, json};

        fn sample_node() -> TifNode {
            TifNode {
                uid: "abc".into(),
                name: "06-01-2021".into(),
                description: None,
                children: None,
                refs: None,
                created_at: 1,
                edited_at: 2,
                node_type: NodeType::Date,
                media_url: None,
                code_language: None,
                todo_state: Some(TodoState::Done),
            }
        }

        #[test]
        fn node_serializes_with_schema_spelling() {
            let value = serde_json::to_value(sample_node()).expect("serialize");
            assert_eq!(
                value,
                json!({
                    "uid": "abc",
                    "name": "06-01-2021",
                    "createdAt": 1,
                    "editedAt": 2,
                    "type": "date",
                    "todoState": "done"
                })
            );
        }

        #[test]
        fn file_reads_optional_sections() {
            let input = r#"{
                "version": "TanaIntermediateFile V0.1",
                "summary": {"leafNodes": 1, "topLevelNodes": 1, "totalNodes": 1,
                            "calendarNodes": 0, "fields": 0, "brokenRefs": 0},
                "nodes": [{"uid": "n1", "name": "hello", "createdAt": 0, "editedAt": 0,
                           "type": "codeblock", "codeLanguage": "rust"}],
                "supertags": [{"uid": "t1", "name": "book"}]
            }"#;
            let file = TifFile::from_json(input).expect("parse");
            assert_eq!(file.nodes[0].node_type, NodeType::Codeblock);
            assert_eq!(file.nodes[0].code_language.as_deref(), Some("rust"));
            assert!(file.attributes.is_none());
            assert_eq!(file.supertags.as_ref().map(Vec::len), Some(1));
        }

        #[test]
        fn empty_attribute_list_is_omitted() {
            let file = TifFile::new(TifSummary::default(), vec![], vec![]);
            let value: Value = serde_json::from_str(&file.to_json(false).expect("json")).expect("value");
            assert!(value.get("attributes").is_none());
            assert!(value.get("supertags").is_none());
            assert_eq!(value["version"], TIF_VERSION);
        }

        #[test]
        fn garbage_is_a_decode_error() {
            let err = TifFile::from_json("{not json").unwrap_err();
            assert!(matches!(err, ConvertError::Decode { format: "intermediate", .. }));
        }
    }
}

pub mod dialect {
    //! Per-format syntax tables. Everything format-specific the converter
    //! needs lives here so the pipeline stays a single code path.

    use crate::tif::TodoState;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum SourceFormat {
        #[default]
        Roam,
        Logseq,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TodoMarker {
        pub token: &'static str,
        pub state: TodoState,
    }

    /// A paired inline marker and the tag it becomes, e.g. `**` to `b`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MarkupRule {
        pub token: &'static str,
        pub tag: &'static str,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Dialect {
        pub format: SourceFormat,
        pub todo_markers: &'static [TodoMarker],
        pub markup: &'static [MarkupRule],
        pub case_insensitive_names: bool,
        /// Attribute keys dropped without producing a field.
        pub ignored_attributes: &'static [&'static str],
        /// Attribute key that declares the block's own reference id.
        pub block_id_attribute: Option<&'static str>,
        /// Attribute keys whose values are always comma-separated lists.
        pub list_attributes: &'static [&'static str],
    }

    const fn todo(token: &'static str) -> TodoMarker {
        TodoMarker { token, state: TodoState::Todo }
    }

    const fn done(token: &'static str) -> TodoMarker {
        TodoMarker { token, state: TodoState::Done }
    }

    const ROAM_TODO: &[TodoMarker] = &[
        todo("{{[[TODO]]}}"),
        done("{{[[DONE]]}}"),
        todo("{{TODO}}"),
        done("{{DONE}}"),
        todo("[[TODO]]"),
        done("[[DONE]]"),
    ];

    const LOGSEQ_TODO: &[TodoMarker] = &[
        todo("TODO"),
        todo("DOING"),
        todo("LATER"),
        todo("NOW"),
        todo("WAITING"),
        done("DONE"),
        done("CANCELED"),
        done("CANCELLED"),
    ];

    const ROAM_MARKUP: &[MarkupRule] = &[
        MarkupRule { token: "**", tag: "b" },
        MarkupRule { token: "__", tag: "i" },
        MarkupRule { token: "^^", tag: "mark" },
        MarkupRule { token: "~~", tag: "strike" },
    ];

    const LOGSEQ_MARKUP: &[MarkupRule] = &[
        MarkupRule { token: "**", tag: "b" },
        MarkupRule { token: "==", tag: "mark" },
        MarkupRule { token: "~~", tag: "strike" },
    ];

    impl Dialect {
        pub fn roam() -> Self {
            Self {
                format: SourceFormat::Roam,
                todo_markers: ROAM_TODO,
                markup: ROAM_MARKUP,
                case_insensitive_names: false,
                ignored_attributes: &[],
                block_id_attribute: None,
                list_attributes: &[],
            }
        }

        pub fn logseq() -> Self {
            Self {
                format: SourceFormat::Logseq,
                todo_markers: LOGSEQ_TODO,
                markup: LOGSEQ_MARKUP,
                case_insensitive_names: true,
                ignored_attributes: &["collapsed"],
                block_id_attribute: Some("id"),
                list_attributes: &["tags", "alias"],
            }
        }

        pub fn for_format(format: SourceFormat) -> Self {
            match format {
                SourceFormat::Roam => Self::roam(),
                SourceFormat::Logseq => Self::logseq(),
            }
        }

        /// Split a leading todo marker off `text`. Bare word markers only
        /// count when followed by whitespace or the end of the text.
        pub fn strip_todo<'a>(&self, text: &'a str) -> (Option<TodoState>, &'a str) {
            let trimmed = text.trim_start();
            for marker in self.todo_markers {
                let Some(rest) = trimmed.strip_prefix(marker.token) else {
                    continue;
                };
                let word = marker.token.ends_with(|c: char| c.is_ascii_alphabetic());
                if word && !(rest.is_empty() || rest.starts_with(char::is_whitespace)) {
                    continue;
                }
                return (Some(marker.state), rest.trim_start());
            }
            (None, text)
        }

        pub fn is_ignored_attribute(&self, key: &str) -> bool {
            self.ignored_attributes.contains(&key)
        }

        pub fn is_list_attribute(&self, key: &str) -> bool {
            self.list_attributes.contains(&key)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn roam_macro_markers() {
            let roam = Dialect::roam();
            assert_eq!(roam.strip_todo("{{[[TODO]]}} buy milk"), (Some(TodoState::Todo), "buy milk"));
            assert_eq!(roam.strip_todo("{{DONE}} shipped"), (Some(TodoState::Done), "shipped"));
            assert_eq!(roam.strip_todo("[[DONE]]"), (Some(TodoState::Done), ""));
            assert_eq!(roam.strip_todo("TODO not a roam marker"), (None, "TODO not a roam marker"));
        }

        #[test]
        fn logseq_word_markers_need_a_boundary() {
            let logseq = Dialect::logseq();
            assert_eq!(logseq.strip_todo("LATER call back"), (Some(TodoState::Todo), "call back"));
            assert_eq!(logseq.strip_todo("CANCELED trip"), (Some(TodoState::Done), "trip"));
            assert_eq!(logseq.strip_todo("NOW"), (Some(TodoState::Todo), ""));
            assert_eq!(logseq.strip_todo("TODOS for today"), (None, "TODOS for today"));
            assert_eq!(logseq.strip_todo("NOWHERE"), (None, "NOWHERE"));
        }

        #[test]
        fn attribute_tables() {
            let logseq = Dialect::for_format(SourceFormat::Logseq);
            assert!(logseq.is_ignored_attribute("collapsed"));
            assert!(logseq.is_list_attribute("tags"));
            assert_eq!(logseq.block_id_attribute, Some("id"));

            let roam = Dialect::for_format(SourceFormat::Roam);
            assert!(!roam.is_ignored_attribute("collapsed"));
            assert!(!roam.case_insensitive_names);
        }
    }
}

pub mod annotate {
    //! Inline syntax: code spans, bracket links, block references, embeds,
    //! hashtags and markup. Code spans are opaque to every other rule.

    use crate::{PResult, dialect::Dialect, tif::TodoState};
    use nom::{
        branch::alt,
        bytes::complete::{tag, take_until},
        character::complete::space0,
        combinator::{map, recognize},
        error::{VerboseError, VerboseErrorKind},
        sequence::{delimited, tuple},
    };
    use std::ops::Range;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum RefKind {
        Page,
        Block,
    }

    /// A reference found in node text.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct FoundRef {
        /// Page name or block id the reference points at.
        pub display_name: String,
        /// Visible text of a `[alias]([[target]])` reference.
        pub alias_text: Option<String>,
        /// Outermost references are rewritten; nested ones are only resolved.
        pub is_direct: bool,
        pub kind: RefKind,
        /// Bytes covered by the whole reference syntax, alias wrapper included.
        pub span: Range<usize>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Annotated {
        pub text: String,
        pub refs: Vec<FoundRef>,
        pub todo: Option<TodoState>,
    }

    /* ---------------------------- Pipeline ---------------------------- */

    /// Normalize one block's text: todo marker, embeds, hashtags, markup, in
    /// that order, then collect the references left in the result.
    pub fn annotate(raw: &str, dialect: &Dialect) -> Annotated {
        let (todo, body) = dialect.strip_todo(raw);
        let text = normalize_embeds(body);
        let text = normalize_hashtags(&text);
        let text = apply_markup(&text, dialect);
        let text = text.trim().to_string();
        let refs = scan_references(&text);
        Annotated { text, refs, todo }
    }

    /// Every bracket link target in `text`, innermost first. With
    /// `skip_if_not_direct` only outermost links are returned.
    pub fn bracket_links(text: &str, skip_if_not_direct: bool) -> Vec<String> {
        let code = code_spans(text);
        link_spans(text, &code)
            .into_iter()
            .filter(|l| l.direct || !skip_if_not_direct)
            .map(|l| text[l.inner].to_string())
            .collect()
    }

    /// Page links and block references in `text`, ordered by where they end
    /// so an inner reference always precedes the one enclosing it.
    pub fn scan_references(text: &str) -> Vec<FoundRef> {
        let code = code_spans(text);
        let links = link_spans(text, &code);
        let mut refs: Vec<FoundRef> = links
            .iter()
            .map(|l| FoundRef {
                display_name: text[l.inner.clone()].to_string(),
                alias_text: None,
                is_direct: l.direct,
                kind: RefKind::Page,
                span: l.range.clone(),
            })
            .collect();

        for span in block_ref_spans(text, &code) {
            let nested = links
                .iter()
                .any(|l| l.range.start < span.start && span.end <= l.range.end);
            refs.push(FoundRef {
                display_name: text[span.start + 2..span.end - 2].to_string(),
                alias_text: None,
                is_direct: !nested,
                kind: RefKind::Block,
                span,
            });
        }

        for found in refs.iter_mut().filter(|r| r.is_direct) {
            if let Some((start, alias)) = alias_wrapper(text, &found.span) {
                found.alias_text = Some(alias.to_string());
                found.span = start..found.span.end + 1;
            }
        }

        refs.sort_by_key(|r| r.span.end);
        refs
    }

    /* ---------------------------- Spans ---------------------------- */

    /// Byte ranges of inline and fenced code. Triple backticks pair first;
    /// an unterminated run is literal text.
    pub fn code_spans(text: &str) -> Vec<Range<usize>> {
        let mut spans = Vec::new();
        let mut i = 0;
        while let Some(found) = text[i..].find('`') {
            let start = i + found;
            let fence = if text[start..].starts_with("```") { "```" } else { "`" };
            let body = start + fence.len();
            match text[body..].find(fence) {
                Some(close) => {
                    let end = body + close + fence.len();
                    spans.push(start..end);
                    i = end;
                }
                None => i = body,
            }
        }
        spans
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct LinkSpan {
        range: Range<usize>,
        inner: Range<usize>,
        direct: bool,
    }

    fn in_any(spans: &[Range<usize>], at: usize) -> bool {
        spans.iter().any(|r| r.contains(&at))
    }

    /// Balanced `[[ ]]` pairs outside code. Closed in order, so inner links
    /// come before the link containing them.
    fn link_spans(text: &str, code: &[Range<usize>]) -> Vec<LinkSpan> {
        let bytes = text.as_bytes();
        let mut open: Vec<usize> = Vec::new();
        let mut out = Vec::new();
        let mut i = 0;
        while i + 1 < bytes.len() {
            if let Some(skip) = code.iter().find(|r| r.contains(&i)) {
                i = skip.end;
                continue;
            }
            match (bytes[i], bytes[i + 1]) {
                (b'[', b'[') => {
                    open.push(i);
                    i += 2;
                }
                (b']', b']') if !open.is_empty() => {
                    if let Some(start) = open.pop() {
                        out.push(LinkSpan {
                            range: start..i + 2,
                            inner: start + 2..i,
                            direct: open.is_empty(),
                        });
                    }
                    i += 2;
                }
                _ => i += 1,
            }
        }
        out
    }

    fn is_block_id_byte(b: u8) -> bool {
        b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
    }

    fn block_ref_spans(text: &str, code: &[Range<usize>]) -> Vec<Range<usize>> {
        let bytes = text.as_bytes();
        let mut out = Vec::new();
        let mut i = 0;
        while i + 1 < bytes.len() {
            if let Some(skip) = code.iter().find(|r| r.contains(&i)) {
                i = skip.end;
                continue;
            }
            if bytes[i] == b'(' && bytes[i + 1] == b'(' {
                let mut j = i + 2;
                while j < bytes.len() && is_block_id_byte(bytes[j]) {
                    j += 1;
                }
                if j > i + 2 && bytes[j..].starts_with(b"))") {
                    out.push(i..j + 2);
                    i = j + 2;
                    continue;
                }
            }
            i += 1;
        }
        out
    }

    /// `[alias](` immediately before and `)` immediately after `span`.
    fn alias_wrapper<'t>(text: &'t str, span: &Range<usize>) -> Option<(usize, &'t str)> {
        let head = text[..span.start].strip_suffix("](")?;
        if !text[span.end..].starts_with(')') {
            return None;
        }
        let open = head.rfind('[')?;
        let alias = &head[open + 1..];
        if alias.is_empty() || alias.contains(']') || head[..open].ends_with('[') {
            return None;
        }
        Some((open, alias))
    }

    /* ---------------------------- Embeds ---------------------------- */

    fn page_link_token(i: &str) -> PResult<'_, &str> {
        let code: Vec<Range<usize>> = Vec::new();
        match link_spans(i, &code).into_iter().find(|l| l.direct && l.range.start == 0) {
            Some(link) => Ok((&i[link.range.end..], &i[..link.range.end])),
            None => Err(nom::Err::Error(VerboseError {
                errors: vec![(i, VerboseErrorKind::Context("page link"))],
            })),
        }
    }

    fn block_ref_token(i: &str) -> PResult<'_, &str> {
        recognize(delimited(tag("(("), take_until("))"), tag("))")))(i)
    }

    fn embed_keyword(i: &str) -> PResult<'_, &str> {
        alt((tag("[[embed]]:"), tag("embed:"), tag("embed")))(i)
    }

    /// `{{embed: ((id))}}`, `{{[[embed]]: [[page]]}}` and the Logseq
    /// `{{embed [[page]]}}` all collapse to their bare target.
    fn embed_macro(i: &str) -> PResult<'_, &str> {
        map(
            tuple((
                tag("{{"),
                space0,
                embed_keyword,
                space0,
                alt((block_ref_token, page_link_token)),
                space0,
                tag("}}"),
            )),
            |(_, _, _, _, target, _, _)| target,
        )(i)
    }

    fn normalize_embeds(text: &str) -> String {
        let code = code_spans(text);
        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        let mut search = 0;
        while let Some(found) = text[search..].find("{{") {
            let at = search + found;
            if in_any(&code, at) {
                search = at + 2;
                continue;
            }
            match embed_macro(&text[at..]) {
                Ok((after, target)) => {
                    out.push_str(&text[cursor..at]);
                    out.push_str(target);
                    cursor = text.len() - after.len();
                    search = cursor;
                }
                Err(_) => search = at + 2,
            }
        }
        out.push_str(&text[cursor..]);
        out
    }

    /* ---------------------------- Hashtags ---------------------------- */

    fn is_tag_char(c: char) -> bool {
        c.is_alphanumeric() || matches!(c, '-' | '_' | '/')
    }

    /// `#word` and `#[[Multi Word]]` become plain bracket links.
    fn normalize_hashtags(text: &str) -> String {
        let code = code_spans(text);
        let links = link_spans(text, &code);
        let protected = |at: usize| in_any(&code, at) || links.iter().any(|l| l.range.contains(&at));

        let mut out = String::with_capacity(text.len() + 8);
        let mut cursor = 0;
        for (at, _) in text.match_indices('#') {
            if at < cursor || protected(at) {
                continue;
            }
            let boundary = text[..at]
                .chars()
                .next_back()
                .is_none_or(|c| c.is_whitespace() || c == '(');
            if !boundary {
                continue;
            }
            let after = &text[at + 1..];
            if after.starts_with("[[") {
                out.push_str(&text[cursor..at]);
                cursor = at + 1;
                continue;
            }
            let len: usize = after
                .chars()
                .take_while(|c| is_tag_char(*c))
                .map(char::len_utf8)
                .sum();
            if len == 0 {
                continue;
            }
            out.push_str(&text[cursor..at]);
            out.push_str("[[");
            out.push_str(&after[..len]);
            out.push_str("]]");
            cursor = at + 1 + len;
        }
        out.push_str(&text[cursor..]);
        out
    }

    /* ---------------------------- Markup ---------------------------- */

    fn apply_markup(text: &str, dialect: &Dialect) -> String {
        let mut current = text.to_string();
        for rule in dialect.markup {
            current = replace_marker_pairs(&current, rule.token, rule.tag);
        }
        current
    }

    fn find_unprotected(
        text: &str,
        token: &str,
        from: usize,
        protected: &impl Fn(usize) -> bool,
    ) -> Option<usize> {
        let mut search = from;
        while let Some(found) = text.get(search..)?.find(token) {
            let at = search + found;
            if !protected(at) {
                return Some(at);
            }
            search = at + token.len();
        }
        None
    }

    /// Pair up `token` occurrences outside code and links. A trailing
    /// unpaired token stays literal.
    fn replace_marker_pairs(text: &str, token: &str, tag: &str) -> String {
        let code = code_spans(text);
        let links = link_spans(text, &code);
        let protected = |at: usize| in_any(&code, at) || links.iter().any(|l| l.range.contains(&at));

        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        while let Some(open) = find_unprotected(text, token, cursor, &protected) {
            let inner = open + token.len();
            let Some(close) = find_unprotected(text, token, inner, &protected) else {
                break;
            };
            if close == inner {
                out.push_str(&text[cursor..close + token.len()]);
                cursor = close + token.len();
                continue;
            }
            out.push_str(&text[cursor..open]);
            out.push_str(&format!("<{tag}>{}</{tag}>", &text[inner..close]));
            cursor = close + token.len();
        }
        out.push_str(&text[cursor..]);
        out
    }

}

pub mod attributes {
    //! `key::value` lines. Keys may be bare or bracketed; both spellings
    //! produce the same attribute.

    use crate::{
        PResult,
        annotate::{RefKind, scan_references},
        core::AttributeIndex,
        dialect::Dialect,
    };
    use nom::{
        branch::alt,
        bytes::complete::{tag, take_until, take_while1},
        combinator::{map, rest},
        sequence::{delimited, tuple},
    };

    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct ExtractedAttribute {
        pub key: String,
        pub values: Vec<String>,
    }

    /// What attribute extraction found in one block's text.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct Extraction {
        /// One entry per distinct key, in first-seen order.
        pub attributes: Vec<ExtractedAttribute>,
        /// The text with attribute lines removed.
        pub remaining: String,
        /// Ids the block declares for itself through an attribute.
        pub block_ids: Vec<String>,
    }

    impl Extraction {
        /// Only attribute lines, no other content.
        pub fn is_meta_only(&self) -> bool {
            !self.attributes.is_empty() && self.remaining.trim().is_empty()
        }
    }

    fn attribute_line(i: &str) -> PResult<'_, (&str, &str)> {
        let bracketed = delimited(tag("[["), take_until("]]"), tag("]]"));
        let plain = take_while1(|c: char| !matches!(c, ':' | '[' | ']' | '`'));
        map(
            tuple((alt((bracketed, plain)), tag("::"), rest)),
            |(key, _, value): (&str, &str, &str)| (key.trim(), value.trim()),
        )(i)
    }

    pub fn parse_attribute_line(line: &str) -> Option<(&str, &str)> {
        match attribute_line(line.trim()) {
            Ok((_, (key, value))) if !key.is_empty() => Some((key, value)),
            _ => None,
        }
    }

    fn is_single_link(part: &str) -> bool {
        scan_references(part)
            .iter()
            .any(|r| r.is_direct && r.kind == RefKind::Page && r.span == (0..part.len()))
    }

    fn split_values(key: &str, value: &str, dialect: &Dialect) -> Vec<String> {
        if value.is_empty() {
            return vec![];
        }
        let parts: Vec<&str> = value
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        let all_links = parts.len() > 1 && parts.iter().all(|p| is_single_link(p));
        if dialect.is_list_attribute(key) || all_links {
            parts.into_iter().map(String::from).collect()
        } else {
            vec![value.to_string()]
        }
    }

    /// Pull attribute lines out of `text`, recording each occurrence in the
    /// document-wide `index`. Lines inside fenced code are left alone.
    pub fn extract(text: &str, dialect: &Dialect, index: &mut AttributeIndex) -> Extraction {
        let mut extraction = Extraction::default();
        let mut kept: Vec<&str> = Vec::new();
        let mut in_fence = false;

        for line in text.lines() {
            let trimmed = line.trim();
            if in_fence || trimmed.starts_with("```") {
                if trimmed.matches("```").count() % 2 == 1 {
                    in_fence = !in_fence;
                }
                kept.push(line);
                continue;
            }
            let Some((key, value)) = parse_attribute_line(trimmed) else {
                kept.push(line);
                continue;
            };
            if dialect.block_id_attribute == Some(key) {
                if !value.is_empty() {
                    extraction.block_ids.push(value.to_string());
                }
                continue;
            }
            if dialect.is_ignored_attribute(key) {
                continue;
            }

            let values = split_values(key, value, dialect);
            index.record(key, &values);
            match extraction.attributes.iter_mut().find(|a| a.key == key) {
                Some(existing) => existing.values.extend(values),
                None => extraction.attributes.push(ExtractedAttribute {
                    key: key.to_string(),
                    values,
                }),
            }
        }

        extraction.remaining = kept.join("\n");
        extraction
    }

}

pub mod calendar {
    use crate::{PResult, core::NodeArena, tif::NodeType};
    use chrono::NaiveDate;
    use nom::{
        branch::alt,
        bytes::complete::tag,
        character::complete::{alpha1, char, digit1, space1},
        combinator::{eof, map, opt},
        sequence::tuple,
    };
    use serde::{Deserialize, Serialize};
    use tracing::debug;

    /// Spelling of calendar node names in the output.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum DateFormat {
        /// `MM-DD-YYYY`
        #[default]
        MonthDayYear,
        /// `YYYY-MM-DD`
        Iso,
    }

    const NUMERIC_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%m-%d-%Y", "%Y_%m_%d"];

    fn long_date(i: &str) -> PResult<'_, (&str, &str, &str)> {
        map(
            tuple((
                alpha1,
                space1,
                digit1,
                opt(alt((tag("st"), tag("nd"), tag("rd"), tag("th")))),
                char(','),
                space1,
                digit1,
                eof,
            )),
            |(month, _, day, _, _, _, year, _)| (month, day, year),
        )(i)
    }

    /// Three all-digit groups, two short ones and a four digit year at
    /// either end.
    fn numeric_shape(text: &str) -> bool {
        let groups: Vec<&str> = text.split(['-', '/', '_']).collect();
        groups.len() == 3
            && groups
                .iter()
                .all(|g| !g.is_empty() && g.bytes().all(|b| b.is_ascii_digit()))
            && (groups[0].len() == 4 || groups[2].len() == 4)
            && groups.iter().filter(|g| g.len() <= 2).count() == 2
    }

    /// Recognize a whole string as a calendar day: `June 1st, 2021`,
    /// `Jun 1st, 2021` or one of the numeric forms.
    pub fn parse_date(text: &str) -> Option<NaiveDate> {
        let text = text.trim();
        if text.is_empty() || text.len() > 32 {
            return None;
        }
        if let Ok((_, (month, day, year))) = long_date(text) {
            return NaiveDate::parse_from_str(&format!("{month} {day} {year}"), "%B %d %Y").ok();
        }
        if !numeric_shape(text) {
            return None;
        }
        NUMERIC_FORMATS
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
    }

    pub fn format_date(date: NaiveDate, format: DateFormat) -> String {
        match format {
            DateFormat::MonthDayYear => date.format("%m-%d-%Y").to_string(),
            DateFormat::Iso => date.format("%Y-%m-%d").to_string(),
        }
    }

    /// Rename every date node to the configured spelling. Runs after
    /// resolution so synthesized calendar nodes are included.
    pub fn normalize_calendar(arena: &mut NodeArena, format: DateFormat) -> usize {
        let mut renamed = 0;
        for node in arena.iter_mut() {
            if node.node_type != NodeType::Date {
                continue;
            }
            let Some(date) = node.date else { continue };
            let name = format_date(date, format);
            if node.name != name {
                debug!(from = %node.name, to = %name, "normalizing calendar node");
                node.name = name;
                renamed += 1;
            }
        }
        renamed
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::NodeData;

        fn day(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
        }

        #[test]
        fn long_forms() {
            assert_eq!(parse_date("June 1st, 2021"), Some(day(2021, 6, 1)));
            assert_eq!(parse_date("Jun 2nd, 2021"), Some(day(2021, 6, 2)));
            assert_eq!(parse_date("August 23rd, 2020"), Some(day(2020, 8, 23)));
            assert_eq!(parse_date("March 4, 2019"), Some(day(2019, 3, 4)));
        }

        #[test]
        fn numeric_forms() {
            assert_eq!(parse_date("06/01/2021"), Some(day(2021, 6, 1)));
            assert_eq!(parse_date("2021-06-01"), Some(day(2021, 6, 1)));
            assert_eq!(parse_date("06-01-2021"), Some(day(2021, 6, 1)));
            assert_eq!(parse_date("2021_06_01"), Some(day(2021, 6, 1)));
        }

        #[test]
        fn rejects_non_dates() {
            for text in ["June 31st, 2021", "Jum 1st, 2021", "1-2-3", "June 1st 2021", "", "Meeting notes", "2021-13-01"] {
                assert_eq!(parse_date(text), None, "{text}");
            }
        }

        #[test]
        fn formats() {
            assert_eq!(format_date(day(2021, 6, 1), DateFormat::MonthDayYear), "06-01-2021");
            assert_eq!(format_date(day(2021, 6, 1), DateFormat::Iso), "2021-06-01");
        }

        #[test]
        fn normalization_only_touches_dated_nodes() {
            let mut arena = NodeArena::new();
            let mut dated = NodeData::new(NodeType::Date, "June 1st, 2021", 0);
            dated.date = Some(day(2021, 6, 1));
            let dated = arena.push_root(dated);
            let plain = arena.push_root(NodeData::new(NodeType::Node, "June 1st, 2021", 0));

            assert_eq!(normalize_calendar(&mut arena, DateFormat::Iso), 1);
            assert_eq!(arena.get(dated).name, "2021-06-01");
            assert_eq!(arena.get(plain).name, "June 1st, 2021");
        }
    }
}

pub mod builder {
    //! First pass: one node per kept block, depth-first, with the name index
    //! filled in as nodes are created. Links are left as written.

    use crate::{
        PResult,
        annotate::annotate,
        attributes::{self, ExtractedAttribute, Extraction},
        calendar::parse_date,
        convert::ConvertOptions,
        core::{AttributeIndex, Block, Document, NameIndex, NodeArena, NodeData, NodeId, NodeUid},
        dialect::Dialect,
        tif::NodeType,
    };
    use chrono::NaiveDate;
    use nom::{
        bytes::complete::{tag, take_until},
        character::complete::char,
        combinator::{eof, map, opt, recognize},
        sequence::{delimited, tuple},
    };
    use tracing::{debug, warn};

    /* ---------------------------- Classification ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ContentKind {
        Image { alt: String, url: String },
        Codeblock { language: Option<String>, code: String },
        /// A page whose title is a calendar day.
        Date(NaiveDate),
        /// A non-page block whose whole content is a calendar day.
        DateRef,
        Node,
    }

    type Matcher = fn(&str, bool) -> Option<ContentKind>;

    /// Tried in order; the first match wins.
    const MATCHERS: &[Matcher] = &[match_image, match_codeblock, match_date];

    pub fn classify(text: &str, is_page: bool) -> ContentKind {
        let text = text.trim();
        MATCHERS
            .iter()
            .find_map(|matcher| matcher(text, is_page))
            .unwrap_or(ContentKind::Node)
    }

    fn size_suffix(i: &str) -> PResult<'_, &str> {
        recognize(delimited(char('{'), take_until("}"), char('}')))(i)
    }

    fn image_markdown(i: &str) -> PResult<'_, (&str, &str)> {
        map(
            tuple((
                tag("!["),
                take_until("]("),
                tag("]("),
                take_until(")"),
                char(')'),
                opt(size_suffix),
                eof,
            )),
            |(_, alt_text, _, url, _, _, _)| (alt_text, url),
        )(i)
    }

    fn match_image(text: &str, _is_page: bool) -> Option<ContentKind> {
        let (_, (alt, url)) = image_markdown(text).ok()?;
        Some(ContentKind::Image {
            alt: alt.trim().to_string(),
            url: url.trim().to_string(),
        })
    }

    fn is_language_tag(s: &str) -> bool {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '#' | '_' | '.'))
    }

    fn match_codeblock(text: &str, _is_page: bool) -> Option<ContentKind> {
        let body = text.strip_prefix("```")?.strip_suffix("```")?;
        if body.contains("```") {
            return None;
        }
        let (language, code) = match body.split_once('\n') {
            Some((first, rest)) if is_language_tag(first.trim()) => {
                (Some(first.trim().to_string()), rest)
            }
            Some((first, rest)) if first.trim().is_empty() => (None, rest),
            _ => (None, body),
        };
        Some(ContentKind::Codeblock {
            language,
            code: code.trim_matches('\n').to_string(),
        })
    }

    fn match_date(text: &str, is_page: bool) -> Option<ContentKind> {
        let date = parse_date(text)?;
        Some(if is_page {
            ContentKind::Date(date)
        } else {
            ContentKind::DateRef
        })
    }

    /* ---------------------------- Builder ---------------------------- */

    #[derive(Debug)]
    pub struct BuildOutput {
        pub arena: NodeArena,
        pub names: NameIndex,
        pub attributes: AttributeIndex,
    }

    /// How a child block ends up under its parent.
    enum Attach {
        Node(NodeId),
        /// A metadata-only block folded into the parent: its fields, plus
        /// whatever its single child became.
        Hoisted {
            fields: Vec<ExtractedAttribute>,
            nodes: Vec<NodeId>,
        },
    }

    pub struct NodeBuilder<'a> {
        dialect: &'a Dialect,
        options: &'a ConvertOptions,
        timestamp: i64,
        arena: NodeArena,
        names: NameIndex,
        /// Body block names, indexed only after every page title.
        body_names: Vec<(String, NodeUid)>,
        attributes: AttributeIndex,
    }

    impl<'a> NodeBuilder<'a> {
        pub fn new(dialect: &'a Dialect, options: &'a ConvertOptions, timestamp: i64) -> Self {
            Self {
                dialect,
                options,
                timestamp,
                arena: NodeArena::new(),
                names: NameIndex::new(),
                body_names: Vec::new(),
                attributes: AttributeIndex::new(),
            }
        }

        pub fn build(mut self, document: &Document) -> BuildOutput {
            for page in &document.pages {
                if page.text.trim().is_empty() {
                    warn!(block = %page.id, "page without a title");
                }
                let extraction = attributes::extract(&page.text, self.dialect, &mut self.attributes);
                let id = self.build_node(page, extraction, true);
                self.arena.add_root(id);
            }
            for (name, uid) in std::mem::take(&mut self.body_names) {
                self.names.insert_name(&name, &uid);
            }
            debug!(nodes = self.arena.len(), pages = document.pages.len(), "built node tree");
            BuildOutput {
                arena: self.arena,
                names: self.names,
                attributes: self.attributes,
            }
        }

        fn build_child(&mut self, block: &Block, parent: &NodeUid) -> Option<Attach> {
            let extraction = attributes::extract(&block.text, self.dialect, &mut self.attributes);
            let leaf = block.children.is_empty();
            let blank = extraction.attributes.is_empty() && extraction.remaining.trim().is_empty();

            if leaf && blank && self.options.skip_empty_blocks {
                self.register_block_ids(block, &extraction.block_ids, parent);
                debug!(block = %block.id, "skipping empty block");
                return None;
            }
            if block.children.len() <= 1 && self.options.collapse_meta_nodes && extraction.is_meta_only() {
                self.register_block_ids(block, &extraction.block_ids, parent);
                debug!(block = %block.id, "collapsing meta node into parent");
                let mut fields = extraction.attributes;
                let mut nodes = Vec::new();
                if let Some(child) = block.children.first() {
                    match self.build_child(child, parent) {
                        Some(Attach::Node(id)) => nodes.push(id),
                        Some(Attach::Hoisted { fields: inner, nodes: inner_nodes }) => {
                            merge_fields(&mut fields, inner);
                            nodes.extend(inner_nodes);
                        }
                        None => {}
                    }
                }
                return Some(Attach::Hoisted { fields, nodes });
            }
            Some(Attach::Node(self.build_node(block, extraction, false)))
        }

        fn build_node(&mut self, block: &Block, extraction: Extraction, is_page: bool) -> NodeId {
            let created = block.created_at.unwrap_or(self.timestamp);
            let content = extraction.remaining.trim();
            let kind = classify(content, is_page);
            let indexed = !matches!(kind, ContentKind::Codeblock { .. } | ContentKind::DateRef);

            let mut node = match kind {
                ContentKind::Image { alt, url } => {
                    let name = if alt.is_empty() { "image".to_string() } else { alt };
                    let mut node = NodeData::new(NodeType::Image, name, created);
                    node.media_url = Some(url);
                    node
                }
                ContentKind::Codeblock { language, code } => {
                    let mut node = NodeData::new(NodeType::Codeblock, code, created);
                    node.code_language = language;
                    node
                }
                ContentKind::Date(date) => {
                    let mut node = NodeData::new(NodeType::Date, content, created);
                    node.date = Some(date);
                    node
                }
                ContentKind::DateRef => NodeData::new(NodeType::Node, format!("[[{content}]]"), created),
                ContentKind::Node => {
                    let annotated = annotate(content, self.dialect);
                    let mut node = NodeData::new(NodeType::Node, annotated.text, created);
                    node.todo_state = annotated.todo;
                    node
                }
            };
            node.edited_at = block.edited_at.unwrap_or(created);

            let uid = node.uid.clone();
            let date = node.date;
            let id = self.arena.push(node);
            if indexed && !content.is_empty() {
                if !is_page {
                    self.body_names.push((content.to_string(), uid.clone()));
                } else if !self.names.insert_name(content, &uid) {
                    debug!(name = content, "page title already claimed by an earlier page");
                }
            }
            if let Some(date) = date {
                self.names.insert_date(date, &uid);
            }
            self.register_block_ids(block, &extraction.block_ids, &uid);

            let mut fields = extraction.attributes;
            let mut structural = Vec::new();
            for child in &block.children {
                match self.build_child(child, &uid) {
                    Some(Attach::Node(child_id)) => structural.push(child_id),
                    Some(Attach::Hoisted { fields: hoisted, nodes }) => {
                        merge_fields(&mut fields, hoisted);
                        structural.extend(nodes);
                    }
                    None => {}
                }
            }

            let mut children: Vec<NodeId> = fields
                .into_iter()
                .map(|attribute| self.build_field(attribute, created))
                .collect();
            children.extend(structural);
            self.arena.get_mut(id).children = children;
            id
        }

        fn build_field(&mut self, attribute: ExtractedAttribute, timestamp: i64) -> NodeId {
            let mut field = NodeData::new(NodeType::Field, attribute.key, timestamp);
            for value in &attribute.values {
                let text = if parse_date(value).is_some() {
                    format!("[[{}]]", value.trim())
                } else {
                    annotate(value, self.dialect).text
                };
                let child = self.arena.push(NodeData::new(NodeType::Node, text, timestamp));
                field.children.push(child);
            }
            self.arena.push(field)
        }

        fn register_block_ids(&mut self, block: &Block, declared: &[String], uid: &NodeUid) {
            let ids = std::iter::once(block.id.as_str()).chain(declared.iter().map(String::as_str));
            for id in ids {
                if id.is_empty() || self.names.block(id) == Some(uid) {
                    continue;
                }
                if !self.names.insert_block(id, uid) {
                    warn!(block = id, "duplicate block id, keeping the first");
                }
            }
        }
    }

    fn merge_fields(fields: &mut Vec<ExtractedAttribute>, hoisted: Vec<ExtractedAttribute>) {
        for attribute in hoisted {
            match fields.iter_mut().find(|f| f.key == attribute.key) {
                Some(existing) => existing.values.extend(attribute.values),
                None => fields.push(attribute),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn build(pages: Vec<Block>) -> BuildOutput {
            build_with(pages, &ConvertOptions::default())
        }

        fn build_with(pages: Vec<Block>, options: &ConvertOptions) -> BuildOutput {
            let dialect = Dialect::for_format(options.format);
            NodeBuilder::new(&dialect, options, 42).build(&Document::new(pages))
        }

        fn child_names(out: &BuildOutput, id: NodeId) -> Vec<String> {
            out.arena
                .get(id)
                .children
                .iter()
                .map(|c| out.arena.get(*c).name.clone())
                .collect()
        }

        #[test]
        fn classification_priority() {
            assert_eq!(
                classify("![cat](http://x/c.png)", false),
                ContentKind::Image { alt: "cat".into(), url: "http://x/c.png".into() }
            );
            assert!(matches!(classify("![](u){:height 20}", false), ContentKind::Image { .. }));
            assert_eq!(classify("![a](u) and more", false), ContentKind::Node);
            assert_eq!(
                classify("```js\nlet x;\n```", false),
                ContentKind::Codeblock { language: Some("js".into()), code: "let x;".into() }
            );
            assert_eq!(
                classify("```\nplain\n```", false),
                ContentKind::Codeblock { language: None, code: "plain".into() }
            );
            assert!(matches!(classify("June 1st, 2021", true), ContentKind::Date(_)));
            assert_eq!(classify("June 1st, 2021", false), ContentKind::DateRef);
            assert_eq!(classify("just text", true), ContentKind::Node);
        }

        #[test]
        fn meta_child_folds_into_parent_fields() {
            let out = build(vec![
                Block::new("p", "Dune").with_children(vec![
                    Block::new("c1", "Great read"),
                    Block::new("c2", "type:: book"),
                ]),
            ]);
            let page = out.arena.roots()[0];
            assert_eq!(child_names(&out, page), vec!["type", "Great read"]);
            let field = out.arena.get(page).children[0];
            assert_eq!(out.arena.get(field).node_type, NodeType::Field);
            assert_eq!(child_names(&out, field), vec!["book"]);
            assert_eq!(out.names.block("c2"), Some(&out.arena.get(page).uid));
            assert_eq!(out.attributes.get("type").map(|s| s.count), Some(1));
        }

        #[test]
        fn collapse_can_be_disabled() {
            let options = ConvertOptions {
                collapse_meta_nodes: false,
                ..ConvertOptions::default()
            };
            let out = build_with(
                vec![Block::new("p", "Dune").with_children(vec![Block::new("c", "type:: book")])],
                &options,
            );
            let page = out.arena.roots()[0];
            let meta = out.arena.get(page).children[0];
            assert_eq!(out.arena.get(meta).name, "");
            assert_eq!(child_names(&out, meta), vec!["type"]);
        }

        #[test]
        fn own_fields_precede_children() {
            let out = build(vec![
                Block::new("p", "Dune\nauthor:: [[Frank Herbert]]")
                    .with_children(vec![Block::new("c", "note")]),
            ]);
            let page = out.arena.roots()[0];
            assert_eq!(out.arena.get(page).name, "Dune");
            assert_eq!(child_names(&out, page), vec!["author", "note"]);
        }

        #[test]
        fn empty_leaves_are_skipped() {
            let out = build(vec![Block::new("p", "Page").with_children(vec![
                Block::new("e1", ""),
                Block::new("e2", "   "),
                Block::new("e3", "").with_children(vec![Block::new("x", "kept")]),
            ])]);
            let page = out.arena.roots()[0];
            assert_eq!(child_names(&out, page), vec![""]);
            assert_eq!(out.arena.len(), 3);
        }

        #[test]
        fn special_content() {
            let out = build(vec![Block::new("p", "Media").with_children(vec![
                Block::new("i", "![](https://img/x.png)"),
                Block::new("c", "```python\nprint(1)\n```"),
                Block::new("d", "June 1st, 2021"),
            ])]);
            let page = out.arena.roots()[0];
            let kids: Vec<&NodeData> = out.arena.get(page).children.iter().map(|c| out.arena.get(*c)).collect();
            assert_eq!(kids[0].node_type, NodeType::Image);
            assert_eq!(kids[0].name, "image");
            assert_eq!(kids[0].media_url.as_deref(), Some("https://img/x.png"));
            assert_eq!(kids[1].node_type, NodeType::Codeblock);
            assert_eq!(kids[1].code_language.as_deref(), Some("python"));
            assert_eq!(kids[1].name, "print(1)");
            assert_eq!(kids[2].node_type, NodeType::Node);
            assert_eq!(kids[2].name, "[[June 1st, 2021]]");
        }

        #[test]
        fn first_page_keeps_the_name() {
            let out = build(vec![Block::new("a", "Same"), Block::new("b", "Same")]);
            let first = out.arena.get(out.arena.roots()[0]).uid.clone();
            assert_eq!(out.names.name("Same"), Some(&first));
            assert_eq!(out.arena.roots().len(), 2);
        }

        #[test]
        fn timestamps_fall_back() {
            let out = build(vec![
                Block::new("a", "timed").with_times(Some(100), None),
                Block::new("b", "untimed"),
            ]);
            let timed = out.arena.get(out.arena.roots()[0]);
            assert_eq!((timed.created_at, timed.edited_at), (100, 100));
            let untimed = out.arena.get(out.arena.roots()[1]);
            assert_eq!((untimed.created_at, untimed.edited_at), (42, 42));
        }

        #[test]
        fn meta_block_with_one_child_is_collapsed() {
            let out = build(vec![Block::new("p", "Dune").with_children(vec![
                Block::new("m", "type:: book").with_children(vec![Block::new("k", "kid")]),
            ])]);
            let page = out.arena.roots()[0];
            assert_eq!(child_names(&out, page), vec!["type", "kid"]);
            assert_eq!(out.names.block("m"), Some(&out.arena.get(page).uid));
        }

        #[test]
        fn nested_meta_blocks_hoist_to_the_first_real_parent() {
            let out = build(vec![Block::new("p", "Dune").with_children(vec![
                Block::new("m1", "type:: book").with_children(vec![
                    Block::new("m2", "year:: 1965\ntype:: novel").with_children(vec![Block::new("k", "kid")]),
                ]),
            ])]);
            let page = out.arena.roots()[0];
            assert_eq!(child_names(&out, page), vec!["type", "year", "kid"]);
            let type_field = out.arena.get(page).children[0];
            assert_eq!(child_names(&out, type_field), vec!["book", "novel"]);
        }

        #[test]
        fn meta_block_with_several_children_stays() {
            let out = build(vec![Block::new("p", "Dune").with_children(vec![
                Block::new("m", "type:: book")
                    .with_children(vec![Block::new("a", "one"), Block::new("b", "two")]),
            ])]);
            let page = out.arena.roots()[0];
            assert_eq!(child_names(&out, page), vec![""]);
            let wrapper = out.arena.get(page).children[0];
            assert_eq!(child_names(&out, wrapper), vec!["type", "one", "two"]);
        }

        #[test]
        fn page_titles_outrank_body_blocks() {
            let out = build(vec![
                Block::new("a", "Notes").with_children(vec![
                    Block::new("a1", "Dune"),
                    Block::new("a2", "June 1st, 2021"),
                ]),
                Block::new("d", "Dune"),
            ]);
            let page = out.arena.get(out.arena.roots()[1]).uid.clone();
            assert_eq!(out.names.name("Dune"), Some(&page));
            assert_eq!(out.names.name("June 1st, 2021"), None);
        }

        #[test]
        fn todo_state_is_lifted() {
            let out = build(vec![Block::new("p", "Tasks").with_children(vec![Block::new("t", "{{[[DONE]]}} write")])]);
            let task = out.arena.get(out.arena.get(out.arena.roots()[0]).children[0]);
            assert_eq!(task.name, "write");
            assert_eq!(task.todo_state, Some(crate::tif::TodoState::Done));
        }
    }
}

pub mod resolve {
    //! Second pass over the complete node set. Every direct reference is
    //! rewritten to its target uid; a missing target gets a placeholder node
    //! at the top level, itself resolved later in the same loop.
    //!
    //! Only outermost links are rewritten. A link nested inside another one,
    //! like `foo` in `[[see [[foo]]]]`, disappears with the enclosing link's
    //! text and is reached only through that link's target: an existing
    //! node named `see [[foo]]`, or the placeholder of that name, whose own
    //! text is resolved in turn.

    use crate::{
        annotate::{FoundRef, RefKind, scan_references},
        builder::BuildOutput,
        calendar::parse_date,
        core::{AttributeIndex, NameIndex, NodeArena, NodeData, NodeId, NodeUid},
        dialect::Dialect,
        tif::NodeType,
    };
    use chrono::NaiveDate;
    use std::collections::HashSet;
    use tracing::debug;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResolveStats {
        /// Nodes whose text changed.
        pub rewritten: usize,
        pub broken_refs: usize,
        /// Calendar nodes created for dates nobody wrote a page for.
        pub calendar_nodes: usize,
    }

    #[derive(Debug)]
    pub struct Resolved {
        pub arena: NodeArena,
        pub names: NameIndex,
        pub attributes: AttributeIndex,
        pub stats: ResolveStats,
    }

    struct Resolver<'a> {
        arena: NodeArena,
        names: NameIndex,
        known: HashSet<String>,
        dialect: &'a Dialect,
        timestamp: i64,
        stats: ResolveStats,
    }

    pub fn resolve(built: BuildOutput, dialect: &Dialect, timestamp: i64) -> Resolved {
        let BuildOutput { arena, names, attributes } = built;
        let known = arena.iter().map(|n| n.uid.0.clone()).collect();
        let mut resolver = Resolver {
            arena,
            names,
            known,
            dialect,
            timestamp,
            stats: ResolveStats::default(),
        };

        // Placeholders are appended while iterating and get resolved too.
        let mut index = 0;
        while let Some(id) = resolver.arena.id_at(index) {
            resolver.resolve_node(id);
            index += 1;
        }

        Resolved {
            arena: resolver.arena,
            names: resolver.names,
            attributes,
            stats: resolver.stats,
        }
    }

    impl Resolver<'_> {
        fn resolve_node(&mut self, id: NodeId) {
            let node = self.arena.get(id);
            if node.node_type == NodeType::Codeblock {
                return;
            }
            let name = node.name.clone();
            let refs = scan_references(&name);
            if refs.is_empty() {
                return;
            }

            let mut rewritten = String::with_capacity(name.len());
            let mut uids: Vec<NodeUid> = Vec::new();
            let mut cursor = 0;
            for found in refs.iter().filter(|r| r.is_direct) {
                if found.span.start < cursor {
                    continue;
                }
                let uid = self.target_for(found);
                rewritten.push_str(&name[cursor..found.span.start]);
                match &found.alias_text {
                    Some(alias) => rewritten.push_str(&format!("[{alias}]([[{uid}]])")),
                    None => rewritten.push_str(&format!("[[{uid}]]")),
                }
                cursor = found.span.end;
                if !uids.contains(&uid) {
                    uids.push(uid);
                }
            }
            rewritten.push_str(&name[cursor..]);

            let node = self.arena.get_mut(id);
            if node.name != rewritten {
                self.stats.rewritten += 1;
            }
            node.name = rewritten;
            node.refs = uids;
        }

        fn target_for(&mut self, found: &FoundRef) -> NodeUid {
            let key = found.display_name.as_str();
            if self.known.contains(key) {
                return NodeUid(key.to_string());
            }
            match found.kind {
                RefKind::Block => match self.names.block(key) {
                    Some(uid) => uid.clone(),
                    None => {
                        let uid = self.placeholder(key);
                        self.names.insert_block(key, &uid);
                        uid
                    }
                },
                RefKind::Page => {
                    if let Some(uid) = self.lookup_name(key) {
                        return uid;
                    }
                    if let Some(date) = parse_date(key) {
                        return self.calendar_node(date, key);
                    }
                    let uid = self.placeholder(key);
                    self.names.insert_name(key, &uid);
                    uid
                }
            }
        }

        fn lookup_name(&self, name: &str) -> Option<NodeUid> {
            let found = if self.dialect.case_insensitive_names {
                self.names.name_folded(name)
            } else {
                self.names.name(name)
            };
            found.cloned()
        }

        fn calendar_node(&mut self, date: NaiveDate, display: &str) -> NodeUid {
            if let Some(uid) = self.names.date(date) {
                return uid.clone();
            }
            let mut node = NodeData::new(NodeType::Date, display, self.timestamp);
            node.date = Some(date);
            let uid = self.push_root(node);
            self.names.insert_date(date, &uid);
            self.names.insert_name(display, &uid);
            self.stats.calendar_nodes += 1;
            debug!(%date, "synthesized calendar node");
            uid
        }

        fn placeholder(&mut self, name: &str) -> NodeUid {
            let mut node = NodeData::new(NodeType::Node, name, self.timestamp);
            node.placeholder = true;
            self.stats.broken_refs += 1;
            debug!(name, "unresolved reference, adding placeholder node");
            self.push_root(node)
        }

        fn push_root(&mut self, node: NodeData) -> NodeUid {
            let uid = node.uid.clone();
            self.known.insert(uid.0.clone());
            self.arena.push_root(node);
            uid
        }
    }

}

pub mod summary {
    use crate::{
        core::NodeArena,
        tif::{NodeType, TifNode, TifSummary},
    };

    fn tally(summary: &mut TifSummary, node_type: NodeType, leaf: bool) {
        summary.total_nodes += 1;
        if leaf {
            summary.leaf_nodes += 1;
        }
        match node_type {
            NodeType::Date => summary.calendar_nodes += 1,
            NodeType::Field => summary.fields += 1,
            _ => {}
        }
    }

    /// Count the finished tree. Every reachable node is counted once.
    pub fn summarize(arena: &NodeArena) -> TifSummary {
        let mut summary = TifSummary {
            top_level_nodes: arena.roots().len(),
            ..TifSummary::default()
        };
        arena.walk(|node| {
            tally(&mut summary, node.node_type, node.children.is_empty());
            if node.placeholder {
                summary.broken_refs += 1;
            }
        });
        summary
    }

    /// Recount an already written forest. Placeholders are not marked in
    /// the file, so `broken_refs` stays zero.
    pub fn summarize_forest(nodes: &[TifNode]) -> TifSummary {
        let mut summary = TifSummary {
            top_level_nodes: nodes.len(),
            ..TifSummary::default()
        };
        let mut stack: Vec<&TifNode> = nodes.iter().collect();
        while let Some(node) = stack.pop() {
            tally(&mut summary, node.node_type, node.children().is_empty());
            stack.extend(node.children());
        }
        summary
    }

    /// `(field, stored, counted)` for every count that disagrees.
    pub fn mismatches(stored: &TifSummary, counted: &TifSummary) -> Vec<(&'static str, usize, usize)> {
        [
            ("leafNodes", stored.leaf_nodes, counted.leaf_nodes),
            ("topLevelNodes", stored.top_level_nodes, counted.top_level_nodes),
            ("totalNodes", stored.total_nodes, counted.total_nodes),
            ("calendarNodes", stored.calendar_nodes, counted.calendar_nodes),
            ("fields", stored.fields, counted.fields),
        ]
        .into_iter()
        .filter(|(_, a, b)| a != b)
        .collect()
    }

}

pub mod source {
    //! Format readers. Each turns one export file into a [`Document`].

    use crate::core::{Block, ConvertError, Document};
    use serde::Deserialize;

    pub trait BlockSource {
        fn read_document(&self, input: &str) -> Result<Document, ConvertError>;
    }

    /* ---------------------------- Roam ---------------------------- */

    /// Roam's JSON export: an array of pages with nested `children`.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct RoamJson;

    #[derive(Debug, Deserialize)]
    struct RoamPage {
        title: String,
        #[serde(default)]
        uid: Option<String>,
        #[serde(default)]
        children: Vec<RoamBlock>,
        #[serde(rename = "create-time", default)]
        create_time: Option<i64>,
        #[serde(rename = "edit-time", default)]
        edit_time: Option<i64>,
    }

    #[derive(Debug, Deserialize)]
    struct RoamBlock {
        #[serde(default)]
        string: String,
        uid: String,
        #[serde(default)]
        children: Vec<RoamBlock>,
        #[serde(rename = "create-time", default)]
        create_time: Option<i64>,
        #[serde(rename = "edit-time", default)]
        edit_time: Option<i64>,
    }

    impl From<RoamBlock> for Block {
        fn from(block: RoamBlock) -> Self {
            Block::new(block.uid, block.string)
                .with_children(block.children.into_iter().map(Block::from).collect())
                .with_times(block.create_time, block.edit_time)
        }
    }

    impl From<RoamPage> for Block {
        fn from(page: RoamPage) -> Self {
            let id = page.uid.unwrap_or_else(|| page.title.clone());
            Block::new(id, page.title)
                .with_children(page.children.into_iter().map(Block::from).collect())
                .with_times(page.create_time, page.edit_time)
        }
    }

    impl BlockSource for RoamJson {
        fn read_document(&self, input: &str) -> Result<Document, ConvertError> {
            let pages: Vec<RoamPage> = serde_json::from_str(input)
                .map_err(|source| ConvertError::Decode { format: "Roam", source })?;
            Ok(Document::new(pages.into_iter().map(Block::from).collect()))
        }
    }

    /* ---------------------------- Logseq ---------------------------- */

    /// Logseq's JSON export: `{"blocks": [...]}`, pages carrying `page-name`.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct LogseqJson;

    #[derive(Debug, Deserialize)]
    struct LogseqExport {
        blocks: Vec<LogseqBlock>,
    }

    #[derive(Debug, Deserialize)]
    struct LogseqBlock {
        #[serde(default)]
        id: Option<String>,
        #[serde(rename = "page-name", default)]
        page_name: Option<String>,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        children: Vec<LogseqBlock>,
    }

    impl LogseqBlock {
        fn into_block(self, is_page: bool) -> Result<Block, ConvertError> {
            let LogseqBlock { id, page_name, content, children } = self;
            let text = if is_page {
                page_name.or(content)
            } else {
                content.or(page_name)
            };
            let text = text.ok_or_else(|| {
                ConvertError::Structure(format!(
                    "block {} has neither page-name nor content",
                    id.as_deref().unwrap_or("<no id>")
                ))
            })?;
            let children = children
                .into_iter()
                .map(|c| c.into_block(false))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Block::new(id.unwrap_or_default(), text).with_children(children))
        }
    }

    impl BlockSource for LogseqJson {
        fn read_document(&self, input: &str) -> Result<Document, ConvertError> {
            let export: LogseqExport = serde_json::from_str(input)
                .map_err(|source| ConvertError::Decode { format: "Logseq", source })?;
            let pages = export
                .blocks
                .into_iter()
                .map(|b| b.into_block(true))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Document::new(pages))
        }
    }

}

pub mod convert {
    //! Pipeline entry points: build, resolve, normalize calendar names,
    //! summarize.

    use crate::{
        builder::NodeBuilder,
        calendar::{DateFormat, normalize_calendar},
        core::{ConvertError, Document},
        dialect::{Dialect, SourceFormat},
        resolve::resolve,
        source::{BlockSource, LogseqJson, RoamJson},
        summary::summarize,
        tif::TifFile,
    };
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use tracing::{debug, info, warn};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default, rename_all = "kebab-case")]
    pub struct ConvertOptions {
        pub format: SourceFormat,
        pub calendar_format: DateFormat,
        /// Fold metadata-only leaf blocks into their parent's fields.
        pub collapse_meta_nodes: bool,
        pub skip_empty_blocks: bool,
        /// Milliseconds stamped on nodes without source times. Now if unset.
        pub timestamp: Option<i64>,
    }

    impl Default for ConvertOptions {
        fn default() -> Self {
            Self {
                format: SourceFormat::Roam,
                calendar_format: DateFormat::MonthDayYear,
                collapse_meta_nodes: true,
                skip_empty_blocks: true,
                timestamp: None,
            }
        }
    }

    impl ConvertOptions {
        pub fn from_toml_str(input: &str) -> Result<Self, ConvertError> {
            Ok(toml::from_str(input)?)
        }

        pub fn dialect(&self) -> Dialect {
            Dialect::for_format(self.format)
        }
    }

    /// Convert an already parsed document. Never fails: broken references
    /// become placeholder nodes.
    pub fn convert_document(document: &Document, options: &ConvertOptions) -> TifFile {
        let dialect = options.dialect();
        let timestamp = options
            .timestamp
            .unwrap_or_else(|| Utc::now().timestamp_millis());

        let built = NodeBuilder::new(&dialect, options, timestamp).build(document);
        let mut resolved = resolve(built, &dialect, timestamp);
        let renamed = normalize_calendar(&mut resolved.arena, options.calendar_format);
        debug!(renamed, rewritten = resolved.stats.rewritten, "resolved references");

        let summary = summarize(&resolved.arena);
        if summary.broken_refs > 0 {
            warn!(broken_refs = summary.broken_refs, "references without a target");
        }
        info!(
            total = summary.total_nodes,
            top_level = summary.top_level_nodes,
            calendar = summary.calendar_nodes,
            fields = summary.fields,
            "converted document"
        );
        TifFile::new(summary, resolved.arena.to_forest(), resolved.attributes.finalize())
    }

    /// Decode `input` with the reader for `options.format`, then convert.
    pub fn convert_str(input: &str, options: &ConvertOptions) -> Result<TifFile, ConvertError> {
        let document = match options.format {
            SourceFormat::Roam => RoamJson.read_document(input)?,
            SourceFormat::Logseq => LogseqJson.read_document(input)?,
        };
        debug!(blocks = document.block_count(), "decoded export");
        Ok(convert_document(&document, options))
    }

}
