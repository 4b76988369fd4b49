//! Inline artifact marker grammar.
//!
//! Two markers are recognized in model output:
//!
//! ```text
//! <artifact:ref id="hits" tool="call_1" />
//! <artifact:create id="hits" tool="call_1" type="doc" base="results[0]" details='{"title":"meta.name"}' />
//! <artifact:create id="hits" tool="call_1" type="doc" base="results[0]"></artifact:create>
//! ```
//!
//! Attribute values are `"double"`, `'single'` or `{json}`. Opening tokens
//! are matched with a [`PrefixTrie`], so a chunk that ends partway through
//! `<artifact:cre` is recognized as a possible marker and withheld instead
//! of being flushed as text.

use crate::artifact::ArtifactRequest;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::LazyLock;

pub const REF_OPEN: &str = "<artifact:ref";
pub const CREATE_OPEN: &str = "<artifact:create";
pub const CREATE_CLOSE: &str = "</artifact:create>";

/// Bytes after a create opening tag searched for its closing tag. An opening
/// tag with no closing tag within this window stands alone.
pub const BLOCK_BODY_WINDOW: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Reference,
    Create,
}

// ── Prefix trie ───────────────────────────────────────────────────

#[derive(Debug, Default)]
struct TrieNode {
    children: Vec<(u8, usize)>,
    terminal: Option<MarkerKind>,
}

/// Byte trie over the marker opening tokens.
#[derive(Debug)]
pub struct PrefixTrie {
    nodes: Vec<TrieNode>,
}

/// Result of walking the trie from a `<`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrieWalk {
    /// The input diverges from every opening token.
    NoMatch,
    /// The input ran out while still matching some opening token.
    Prefix,
    /// A complete opening token of `len` bytes.
    Token { kind: MarkerKind, len: usize },
}

impl PrefixTrie {
    pub fn new(tokens: &[(&str, MarkerKind)]) -> Self {
        let mut nodes = vec![TrieNode::default()];
        for (token, kind) in tokens {
            let mut node = 0;
            for &byte in token.as_bytes() {
                node = match nodes[node].children.iter().find(|(b, _)| *b == byte) {
                    Some(&(_, next)) => next,
                    None => {
                        nodes.push(TrieNode::default());
                        let next = nodes.len() - 1;
                        nodes[node].children.push((byte, next));
                        next
                    }
                };
            }
            nodes[node].terminal = Some(*kind);
        }
        Self { nodes }
    }

    pub fn walk(&self, input: &[u8]) -> TrieWalk {
        let mut node = 0;
        for (i, byte) in input.iter().enumerate() {
            if let Some(kind) = self.nodes[node].terminal {
                return TrieWalk::Token { kind, len: i };
            }
            match self.nodes[node].children.iter().find(|(b, _)| b == byte) {
                Some(&(_, next)) => node = next,
                None => return TrieWalk::NoMatch,
            }
        }
        match self.nodes[node].terminal {
            Some(kind) => TrieWalk::Token {
                kind,
                len: input.len(),
            },
            None => TrieWalk::Prefix,
        }
    }
}

static OPENINGS: LazyLock<PrefixTrie> = LazyLock::new(|| {
    PrefixTrie::new(&[
        (REF_OPEN, MarkerKind::Reference),
        (CREATE_OPEN, MarkerKind::Create),
    ])
});

// ── Attributes ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Text(String),
    Json(Value),
}

/// Parsed marker attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes(BTreeMap<String, AttrValue>);

impl Attributes {
    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.0.get(name)
    }

    /// A text attribute, or a JSON attribute holding a string. Blank values
    /// count as absent.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        let value = match self.0.get(name)? {
            AttrValue::Text(s) => s.as_str(),
            AttrValue::Json(Value::String(s)) => s.as_str(),
            AttrValue::Json(_) => return None,
        };
        (!value.trim().is_empty()).then_some(value)
    }

    /// A JSON-object attribute as a field → selector map. Accepts both
    /// `details={...}` and `details='{...}'`; non-string values are skipped.
    pub fn get_selector_map(&self, name: &str) -> Option<HashMap<String, String>> {
        let object = match self.0.get(name)? {
            AttrValue::Json(v) => v.clone(),
            AttrValue::Text(s) => serde_json::from_str(s).ok()?,
        };
        let map = object.as_object()?;
        Some(
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn insert(&mut self, name: String, value: AttrValue) {
        self.0.insert(name, value);
    }
}

// ── Markers ───────────────────────────────────────────────────────

/// A complete marker found in text.
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub kind: MarkerKind,
    /// Byte range of the whole marker, including a block's closing tag.
    pub span: Range<usize>,
    pub attributes: Attributes,
}

/// A marker reference: the key of an existing artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceDirective {
    pub artifact_id: String,
    pub tool_call_id: String,
}

impl Marker {
    /// The create request this marker describes, or the names of the
    /// required attributes it lacks.
    pub fn create_request(&self) -> Result<ArtifactRequest, Vec<&'static str>> {
        let a = &self.attributes;
        let (id, tool, ty, base) = (
            a.get_str("id"),
            a.get_str("tool"),
            a.get_str("type"),
            a.get_str("base"),
        );
        match (id, tool, ty, base) {
            (Some(id), Some(tool), Some(ty), Some(base)) => Ok(ArtifactRequest {
                artifact_id: id.to_string(),
                tool_call_id: tool.to_string(),
                artifact_type: ty.to_string(),
                base_selector: base.to_string(),
                details_selector: a.get_selector_map("details").unwrap_or_default(),
            }),
            _ => Err([("id", id), ("tool", tool), ("type", ty), ("base", base)]
                .into_iter()
                .filter(|(_, v)| v.is_none())
                .map(|(name, _)| name)
                .collect()),
        }
    }

    pub fn reference(&self) -> Result<ReferenceDirective, Vec<&'static str>> {
        let a = &self.attributes;
        match (a.get_str("id"), a.get_str("tool")) {
            (Some(id), Some(tool)) => Ok(ReferenceDirective {
                artifact_id: id.to_string(),
                tool_call_id: tool.to_string(),
            }),
            (id, tool) => Err([("id", id), ("tool", tool)]
                .into_iter()
                .filter(|(_, v)| v.is_none())
                .map(|(name, _)| name)
                .collect()),
        }
    }
}

/// Where an unfinished marker starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Incomplete {
    pub from: usize,
    /// Whether a full opening token was seen (as opposed to a bare prefix
    /// such as `<arti`).
    pub opened: bool,
}

/// Every complete marker in a text, plus the unfinished tail if any.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scan {
    pub markers: Vec<Marker>,
    pub incomplete: Option<Incomplete>,
}

impl Scan {
    /// Offset before which no marker is partially present.
    pub fn safe_boundary(&self, text_len: usize) -> usize {
        self.incomplete.map_or(text_len, |i| i.from)
    }
}

/// Scan `text` for markers in document order, treating it as a stream
/// prefix that more text may follow.
///
/// Scanning stops at the first unfinished marker; everything from there on
/// belongs to [`Scan::incomplete`]. A create opening tag whose closing tag
/// has not arrived yet counts as unfinished until [`BLOCK_BODY_WINDOW`]
/// bytes follow it. A `<artifact:...` opening whose attributes are
/// malformed is not a marker and stays plain text.
pub fn scan(text: &str) -> Scan {
    scan_with(text, false)
}

/// Scan a finished text. A create opening tag without a closing tag is a
/// marker on its own and the text after it is kept.
pub fn scan_complete(text: &str) -> Scan {
    scan_with(text, true)
}

fn scan_with(text: &str, complete: bool) -> Scan {
    let bytes = text.as_bytes();
    let mut markers = Vec::new();
    let mut pos = 0;

    while let Some(offset) = bytes.get(pos..).and_then(|rest| rest.iter().position(|&b| b == b'<')) {
        let start = pos + offset;
        let (kind, len) = match OPENINGS.walk(&bytes[start..]) {
            TrieWalk::NoMatch => {
                pos = start + 1;
                continue;
            }
            TrieWalk::Prefix => return cut(markers, start, false),
            TrieWalk::Token { kind, len } => (kind, len),
        };
        let after = start + len;
        match bytes.get(after) {
            None => return cut(markers, start, false),
            Some(b) if b.is_ascii_whitespace() || *b == b'/' || *b == b'>' => {}
            Some(_) => {
                pos = start + 1;
                continue;
            }
        }
        match scan_tag(text, after) {
            TagScan::Incomplete => return cut(markers, start, true),
            TagScan::Malformed => pos = start + 1,
            TagScan::Complete {
                attributes,
                end,
                self_closing,
            } => {
                let end = if kind == MarkerKind::Create && !self_closing {
                    match block_end(text, end, complete) {
                        Some(end) => end,
                        None => return cut(markers, start, true),
                    }
                } else {
                    end
                };
                markers.push(Marker {
                    kind,
                    span: start..end,
                    attributes,
                });
                pos = end;
            }
        }
    }

    Scan {
        markers,
        incomplete: None,
    }
}

/// End of a create marker whose opening tag ends at `tag_end`: past the
/// closing tag when one starts within the body window, else the opening tag
/// alone. `None` while a closing tag could still arrive.
fn block_end(text: &str, tag_end: usize, complete: bool) -> Option<usize> {
    let rest = text.get(tag_end..).unwrap_or_default();
    match rest.find(CREATE_CLOSE) {
        Some(i) if i <= BLOCK_BODY_WINDOW => Some(tag_end + i + CREATE_CLOSE.len()),
        Some(_) => Some(tag_end),
        None if !complete && rest.len() < BLOCK_BODY_WINDOW + CREATE_CLOSE.len() => None,
        None => Some(tag_end),
    }
}

fn cut(markers: Vec<Marker>, from: usize, opened: bool) -> Scan {
    Scan {
        markers,
        incomplete: Some(Incomplete { from, opened }),
    }
}

// ── Tag scanner ───────────────────────────────────────────────────

enum TagScan {
    Complete {
        attributes: Attributes,
        end: usize,
        self_closing: bool,
    },
    Incomplete,
    Malformed,
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b':')
}

/// Parse `key=value` attributes from `pos` up to `/>` or `>`.
fn scan_tag(text: &str, mut pos: usize) -> TagScan {
    let bytes = text.as_bytes();
    let mut attributes = Attributes::default();
    let skip_ws = |mut p: usize| {
        while bytes.get(p).is_some_and(u8::is_ascii_whitespace) {
            p += 1;
        }
        p
    };

    loop {
        pos = skip_ws(pos);
        let Some(&b) = bytes.get(pos) else {
            return TagScan::Incomplete;
        };
        match b {
            b'/' => {
                return match bytes.get(pos + 1) {
                    None => TagScan::Incomplete,
                    Some(b'>') => TagScan::Complete {
                        attributes,
                        end: pos + 2,
                        self_closing: true,
                    },
                    Some(_) => TagScan::Malformed,
                };
            }
            b'>' => {
                return TagScan::Complete {
                    attributes,
                    end: pos + 1,
                    self_closing: false,
                };
            }
            b if is_name_byte(b) => {
                let name_start = pos;
                while bytes.get(pos).copied().is_some_and(is_name_byte) {
                    pos += 1;
                }
                let name = text.get(name_start..pos).unwrap_or_default().to_string();
                pos = skip_ws(pos);
                match bytes.get(pos) {
                    None => return TagScan::Incomplete,
                    Some(b'=') => {}
                    Some(_) => {
                        attributes.insert(name, AttrValue::Text(String::new()));
                        continue;
                    }
                }
                pos = skip_ws(pos + 1);
                let value = match bytes.get(pos) {
                    None => return TagScan::Incomplete,
                    Some(&quote) if quote == b'"' || quote == b'\'' => {
                        let Some(len) = bytes
                            .get(pos + 1..)
                            .and_then(|rest| rest.iter().position(|&c| c == quote))
                        else {
                            return TagScan::Incomplete;
                        };
                        let raw = text.get(pos + 1..pos + 1 + len).unwrap_or_default();
                        pos += len + 2;
                        AttrValue::Text(raw.to_string())
                    }
                    Some(b'{') => {
                        let Some(close) = matching_brace(bytes, pos) else {
                            return TagScan::Incomplete;
                        };
                        let raw = text.get(pos..=close).unwrap_or_default();
                        pos = close + 1;
                        match serde_json::from_str(raw) {
                            Ok(v) => AttrValue::Json(v),
                            Err(_) => AttrValue::Text(raw.to_string()),
                        }
                    }
                    Some(_) => {
                        let start = pos;
                        while bytes
                            .get(pos)
                            .is_some_and(|c| !c.is_ascii_whitespace() && *c != b'/' && *c != b'>')
                        {
                            pos += 1;
                        }
                        if pos >= bytes.len() {
                            return TagScan::Incomplete;
                        }
                        AttrValue::Text(text.get(start..pos).unwrap_or_default().to_string())
                    }
                };
                attributes.insert(name, value);
            }
            _ => return TagScan::Malformed,
        }
    }
}

/// Index of the `}` closing the `{` at `open`, skipping JSON strings.
fn matching_brace(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trie_walk() {
        let t = &*OPENINGS;
        assert_eq!(t.walk(b"<"), TrieWalk::Prefix);
        assert_eq!(t.walk(b"<artifact:c"), TrieWalk::Prefix);
        assert_eq!(t.walk(b"<b>"), TrieWalk::NoMatch);
        assert_eq!(t.walk(b"<artifact:x"), TrieWalk::NoMatch);
        assert_eq!(
            t.walk(b"<artifact:ref id"),
            TrieWalk::Token {
                kind: MarkerKind::Reference,
                len: REF_OPEN.len()
            }
        );
        assert_eq!(
            t.walk(CREATE_OPEN.as_bytes()),
            TrieWalk::Token {
                kind: MarkerKind::Create,
                len: CREATE_OPEN.len()
            }
        );
    }

    #[test]
    fn scans_reference_marker() {
        let text = r#"See <artifact:ref id="a1" tool="c1" /> above."#;
        let s = scan(text);
        assert!(s.incomplete.is_none());
        assert_eq!(s.markers.len(), 1);
        let m = &s.markers[0];
        assert_eq!(m.kind, MarkerKind::Reference);
        assert_eq!(text.get(m.span.clone()).unwrap(), r#"<artifact:ref id="a1" tool="c1" />"#);
        assert_eq!(
            m.reference().unwrap(),
            ReferenceDirective {
                artifact_id: "a1".into(),
                tool_call_id: "c1".into()
            }
        );
    }

    #[test]
    fn attribute_grammar() {
        let text = r#"<artifact:create id='a1' tool="c1" type=doc base="items[?x == 'y']" details={"title": "meta.name", "n": 1} />"#;
        let s = scan(text);
        let req = s.markers[0].create_request().unwrap();
        assert_eq!(req.artifact_id, "a1");
        assert_eq!(req.artifact_type, "doc");
        assert_eq!(req.base_selector, "items[?x == 'y']");
        assert_eq!(req.details_selector.len(), 1);
        assert_eq!(req.details_selector["title"], "meta.name");
        assert_eq!(
            s.markers[0].attributes.get("details"),
            Some(&AttrValue::Json(json!({"title": "meta.name", "n": 1})))
        );
    }

    #[test]
    fn details_as_quoted_json() {
        let text = r#"<artifact:create id="a" tool="c" type="t" base="@" details='{"url":"links[0]"}' />"#;
        let req = scan(text).markers[0].create_request().unwrap();
        assert_eq!(req.details_selector["url"], "links[0]");
    }

    #[test]
    fn missing_attributes_are_reported() {
        let text = r#"<artifact:create id="a" type="t" />"#;
        let err = scan(text).markers[0].create_request().unwrap_err();
        assert_eq!(err, vec!["tool", "base"]);
    }

    #[test]
    fn block_create_spans_closing_tag() {
        let text = r#"x<artifact:create id="a" tool="c" type="t" base="@">ignored</artifact:create>y"#;
        let s = scan(text);
        assert_eq!(s.markers.len(), 1);
        assert_eq!(s.markers[0].span.end, text.len() - 1);
    }

    #[test]
    fn unfinished_markers_are_incomplete() {
        for text in [
            "hello <",
            "hello <artifact:re",
            r#"hello <artifact:ref id="a"#,
            r#"hello <artifact:ref id="a" tool="c" /"#,
            r#"hello <artifact:create id="a" tool="c" type="t" base="@">body"#,
            r#"hello <artifact:create details={"a": "}"#,
        ] {
            let s = scan(text);
            assert_eq!(s.safe_boundary(text.len()), 6, "{text}");
        }
        let s = scan("hello <artifact:re");
        assert!(!s.incomplete.unwrap().opened);
        let s = scan(r#"hello <artifact:ref id="a"#);
        assert!(s.incomplete.unwrap().opened);
    }

    #[test]
    fn unclosed_create_stands_alone_in_finished_text() {
        let tag = r#"<artifact:create id="a" tool="c" type="t" base="@">"#;
        let text = format!("hello {tag} and the rest of the answer");
        let s = scan_complete(&text);
        assert!(s.incomplete.is_none());
        assert_eq!(s.markers.len(), 1);
        assert_eq!(s.markers[0].span, 6..6 + tag.len());
    }

    #[test]
    fn unclosed_create_stops_waiting_past_the_window() {
        let tag = r#"<artifact:create id="a" tool="c" type="t" base="@">"#;
        let short = format!("{tag}{}", "x".repeat(BLOCK_BODY_WINDOW));
        assert!(scan(&short).incomplete.is_some());

        let long = format!("{tag}{}", "x".repeat(BLOCK_BODY_WINDOW + CREATE_CLOSE.len()));
        let s = scan(&long);
        assert!(s.incomplete.is_none());
        assert_eq!(s.markers[0].span, 0..tag.len());
    }

    #[test]
    fn distant_closing_tag_is_not_a_block() {
        let tag = r#"<artifact:create id="a" tool="c" type="t" base="@">"#;
        let text = format!("{tag}{}{CREATE_CLOSE}", "x".repeat(BLOCK_BODY_WINDOW + 1));
        for s in [scan(&text), scan_complete(&text)] {
            assert_eq!(s.markers.len(), 1);
            assert_eq!(s.markers[0].span, 0..tag.len());
        }
    }

    #[test]
    fn non_markers_stay_text() {
        for text in [
            "a < b and <b>bold</b>",
            "<artifact:created>",
            r#"<artifact:ref id="a" <oops"#,
        ] {
            let s = scan(text);
            assert!(s.markers.is_empty(), "{text}");
            assert!(s.incomplete.is_none(), "{text}");
        }
    }

    #[test]
    fn multiple_markers_in_order() {
        let text = r#"<artifact:create id="a" tool="c" type="t" base="@"/> mid <artifact:ref id="a" tool="c"/>"#;
        let s = scan(text);
        let kinds: Vec<_> = s.markers.iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![MarkerKind::Create, MarkerKind::Reference]);
    }
}
