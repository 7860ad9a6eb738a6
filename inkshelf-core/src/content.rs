use anyhow::{bail, Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Tag used for highlight wrapper elements inserted by [`apply_mark`].
pub const MARK_TAG: &str = "mark";

/// Child-index path from the tree root down to a node.
pub type NodeAddress = Vec<usize>;

#[derive(Debug, Clone, PartialEq)]
pub enum ContentNode {
    Element(ElementNode),
    Text(String),
}

impl ContentNode {
    pub fn is_text(&self) -> bool {
        matches!(self, ContentNode::Text(_))
    }

    fn text_len(&self) -> Option<usize> {
        match self {
            ContentNode::Text(text) => Some(text.chars().count()),
            ContentNode::Element(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementNode {
    pub tag: String,
    /// Highlight id when this element is a wrapper inserted by `apply_mark`.
    pub mark: Option<Uuid>,
    pub children: Vec<ContentNode>,
}

impl ElementNode {
    fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            mark: None,
            children: Vec::new(),
        }
    }
}

/// An ordered tree of text-bearing nodes, the content region highlights are
/// anchored against. Parsed from chapter markup; the root element is
/// synthetic and never appears in locator paths.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentTree {
    root: ElementNode,
}

/// A resolved selection between two text-node boundaries, the tree analog of
/// a rendered-text range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeRange {
    pub start: NodeAddress,
    pub start_offset: usize,
    pub end: NodeAddress,
    pub end_offset: usize,
}

impl TreeRange {
    pub fn is_collapsed(&self) -> bool {
        self.start == self.end && self.start_offset == self.end_offset
    }
}

/// Structural path-based description of where a text range sits within a
/// content tree. Valid only against a tree with the same rendered shape;
/// resolution against a diverged tree fails silently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    pub start_path: String,
    pub start_offset: usize,
    pub end_path: String,
    pub end_offset: usize,
}

impl ContentTree {
    /// Parses chapter markup into a content tree. Whitespace-only text runs
    /// between elements are dropped so that re-parsing identical markup
    /// always yields an identical tree shape.
    pub fn parse(markup: &str) -> Result<Self> {
        let mut reader = Reader::from_str(markup);

        let mut root = ElementNode::new("root");
        let mut stack: Vec<ElementNode> = Vec::new();

        loop {
            let event = reader
                .read_event()
                .context("malformed content markup")?;
            match event {
                Event::Start(start) => {
                    let tag = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                    stack.push(ElementNode::new(tag));
                }
                Event::Empty(start) => {
                    let tag = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                    let node = ContentNode::Element(ElementNode::new(tag));
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => root.children.push(node),
                    }
                }
                Event::End(_) => {
                    let Some(finished) = stack.pop() else {
                        bail!("unbalanced closing tag in content markup");
                    };
                    let node = ContentNode::Element(finished);
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => root.children.push(node),
                    }
                }
                Event::Text(text) => {
                    let value = text
                        .unescape()
                        .context("invalid text escape in content markup")?
                        .into_owned();
                    if value.trim().is_empty() {
                        continue;
                    }
                    let node = ContentNode::Text(value);
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => root.children.push(node),
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            bail!("unterminated element in content markup");
        }

        Ok(Self { root })
    }

    /// Builds a tree directly from an already-parsed element, which becomes
    /// the sole child of a fresh synthetic root.
    pub fn from_element(element: ElementNode) -> Self {
        let mut root = ElementNode::new("root");
        root.children.push(ContentNode::Element(element));
        Self { root }
    }

    pub fn root(&self) -> &ElementNode {
        &self.root
    }

    pub fn node(&self, address: &[usize]) -> Option<&ContentNode> {
        let mut children: &[ContentNode] = &self.root.children;
        let mut found: Option<&ContentNode> = None;
        for &index in address {
            let node = children.get(index)?;
            match node {
                ContentNode::Element(el) => {
                    children = &el.children;
                }
                ContentNode::Text(_) => {
                    // A text node must be the final step of an address.
                    children = EMPTY_CHILDREN;
                }
            }
            found = Some(node);
        }
        found
    }

    /// Flat concatenation of every text node in document order.
    pub fn text(&self) -> String {
        let mut out = String::new();
        collect_text(&self.root, &mut out);
        out
    }

    /// Flat text with marked spans wrapped in the given delimiters, for
    /// rendering highlights in a plain-text surface.
    pub fn annotated_text(&self, open: &str, close: &str) -> String {
        let mut out = String::new();
        collect_annotated(&self.root, open, close, &mut out);
        out
    }

    /// Addresses and char lengths of every text node, in document order.
    pub fn text_nodes(&self) -> Vec<(NodeAddress, usize)> {
        let mut out = Vec::new();
        let mut prefix = Vec::new();
        collect_text_nodes(&self.root.children, &mut prefix, &mut out);
        out
    }

    /// Maps a flat character-offset selection onto tree boundaries. Returns
    /// `None` for collapsed selections or selections that fall outside the
    /// tree's text.
    pub fn capture_selection(&self, start: usize, len: usize) -> Option<TreeRange> {
        if len == 0 {
            return None;
        }
        let end = start.checked_add(len)?;

        let mut range_start: Option<(NodeAddress, usize)> = None;
        let mut range_end: Option<(NodeAddress, usize)> = None;
        let mut cursor = 0usize;
        for (address, node_len) in self.text_nodes() {
            if node_len == 0 {
                continue;
            }
            if range_start.is_none() && start >= cursor && start < cursor + node_len {
                range_start = Some((address.clone(), start - cursor));
            }
            if range_end.is_none() && end > cursor && end <= cursor + node_len {
                range_end = Some((address, end - cursor));
            }
            cursor += node_len;
            if range_start.is_some() && range_end.is_some() {
                break;
            }
        }

        let (start_addr, start_offset) = range_start?;
        let (end_addr, end_offset) = range_end?;
        Some(TreeRange {
            start: start_addr,
            start_offset,
            end: end_addr,
            end_offset,
        })
    }
}

static EMPTY_CHILDREN: &[ContentNode] = &[];

fn collect_text(element: &ElementNode, out: &mut String) {
    for child in &element.children {
        match child {
            ContentNode::Text(text) => out.push_str(text),
            ContentNode::Element(el) => collect_text(el, out),
        }
    }
}

fn collect_annotated(element: &ElementNode, open: &str, close: &str, out: &mut String) {
    for child in &element.children {
        match child {
            ContentNode::Text(text) => out.push_str(text),
            ContentNode::Element(el) => {
                if el.mark.is_some() {
                    out.push_str(open);
                    collect_annotated(el, open, close, out);
                    out.push_str(close);
                } else {
                    collect_annotated(el, open, close, out);
                }
            }
        }
    }
}

fn collect_text_nodes(
    children: &[ContentNode],
    prefix: &mut NodeAddress,
    out: &mut Vec<(NodeAddress, usize)>,
) {
    for (index, child) in children.iter().enumerate() {
        prefix.push(index);
        match child {
            ContentNode::Text(text) => out.push((prefix.clone(), text.chars().count())),
            ContentNode::Element(el) => collect_text_nodes(&el.children, prefix, out),
        }
        prefix.pop();
    }
}

/// Serializes a range into a structural locator. Returns `None` for collapsed
/// ranges or ranges whose endpoints are not text nodes inside the tree.
pub fn serialize_range(tree: &ContentTree, range: &TreeRange) -> Option<Locator> {
    if range.is_collapsed() {
        return None;
    }

    let start_len = tree.node(&range.start)?.text_len()?;
    let end_len = tree.node(&range.end)?.text_len()?;
    if range.start_offset > start_len || range.end_offset > end_len {
        return None;
    }

    Some(Locator {
        start_path: path_for(tree, &range.start)?,
        start_offset: range.start_offset,
        end_path: path_for(tree, &range.end)?,
        end_offset: range.end_offset,
    })
}

/// Resolves a locator back into a range against the current tree shape.
/// Any unresolved segment or out-of-range offset yields `None`; callers skip
/// the highlight for this render.
pub fn deserialize_range(tree: &ContentTree, locator: &Locator) -> Option<TreeRange> {
    let start = resolve_path(tree, &locator.start_path)?;
    let end = resolve_path(tree, &locator.end_path)?;

    let start_len = tree.node(&start)?.text_len()?;
    let end_len = tree.node(&end)?.text_len()?;
    if locator.start_offset > start_len || locator.end_offset > end_len {
        return None;
    }

    Some(TreeRange {
        start,
        start_offset: locator.start_offset,
        end,
        end_offset: locator.end_offset,
    })
}

fn path_for(tree: &ContentTree, address: &[usize]) -> Option<String> {
    if address.is_empty() {
        return None;
    }

    let mut segments = Vec::with_capacity(address.len());
    let mut children = &tree.root.children;
    for (depth, &index) in address.iter().enumerate() {
        let node = children.get(index)?;
        let segment = match node {
            ContentNode::Text(_) => {
                let nth = children[..index].iter().filter(|c| c.is_text()).count();
                format!("text()[{nth}]")
            }
            ContentNode::Element(el) => {
                let nth = children[..index]
                    .iter()
                    .filter(|c| matches!(c, ContentNode::Element(other) if other.tag == el.tag))
                    .count()
                    + 1;
                format!("{}:nth-of-type({nth})", el.tag)
            }
        };
        segments.push(segment);

        match node {
            ContentNode::Element(el) => children = &el.children,
            ContentNode::Text(_) => {
                if depth + 1 != address.len() {
                    return None;
                }
            }
        }
    }
    Some(segments.join("/"))
}

fn resolve_path(tree: &ContentTree, path: &str) -> Option<NodeAddress> {
    let mut address = NodeAddress::new();
    let mut children: &[ContentNode] = &tree.root.children;

    for segment in path.split('/') {
        let index = resolve_segment(children, segment)?;
        address.push(index);
        match &children[index] {
            ContentNode::Element(el) => children = &el.children,
            ContentNode::Text(_) => children = EMPTY_CHILDREN,
        }
    }

    if address.is_empty() {
        return None;
    }
    Some(address)
}

fn resolve_segment(children: &[ContentNode], segment: &str) -> Option<usize> {
    if let Some(rest) = segment.strip_prefix("text()[") {
        let nth: usize = rest.strip_suffix(']')?.parse().ok()?;
        let mut seen = 0usize;
        for (index, child) in children.iter().enumerate() {
            if child.is_text() {
                if seen == nth {
                    return Some(index);
                }
                seen += 1;
            }
        }
        return None;
    }

    let (tag, rest) = segment.split_once(":nth-of-type(")?;
    let nth: usize = rest.strip_suffix(')')?.parse().ok()?;
    if nth == 0 {
        return None;
    }
    let mut seen = 0usize;
    for (index, child) in children.iter().enumerate() {
        if let ContentNode::Element(el) = child {
            if el.tag == tag {
                seen += 1;
                if seen == nth {
                    return Some(index);
                }
            }
        }
    }
    None
}

/// Wraps the text covered by `range` in mark elements tagged with the
/// highlight id. The same-node case wraps a single span; the cross-node case
/// wraps each intersected text node independently, clipping offsets to each
/// node's length. Returns `false` when nothing could be wrapped.
pub fn apply_mark(tree: &mut ContentTree, range: &TreeRange, id: Uuid) -> bool {
    if range.is_collapsed() || range.start > range.end {
        return false;
    }

    let mut spans: Vec<(NodeAddress, usize, usize)> = Vec::new();
    for (address, len) in tree.text_nodes() {
        if address < range.start || address > range.end {
            continue;
        }
        let local_start = if address == range.start {
            range.start_offset.min(len)
        } else {
            0
        };
        let local_end = if address == range.end {
            range.end_offset.min(len)
        } else {
            len
        };
        if local_start < local_end {
            spans.push((address, local_start, local_end));
        }
    }

    if spans.is_empty() {
        return false;
    }

    // Wrapping splices up to three nodes in place of one, shifting the
    // indices of later siblings. Applying spans back-to-front keeps every
    // still-pending address valid.
    let mut wrapped = false;
    for (address, local_start, local_end) in spans.into_iter().rev() {
        if wrap_text_span(tree, &address, local_start, local_end, id) {
            wrapped = true;
        }
    }
    wrapped
}

fn wrap_text_span(
    tree: &mut ContentTree,
    address: &[usize],
    start: usize,
    end: usize,
    id: Uuid,
) -> bool {
    let Some((&last, parent_path)) = address.split_last() else {
        return false;
    };
    let Some(children) = children_mut(&mut tree.root, parent_path) else {
        return false;
    };
    let Some(ContentNode::Text(text)) = children.get(last) else {
        return false;
    };

    let chars: Vec<char> = text.chars().collect();
    let end = end.min(chars.len());
    let start = start.min(end);
    if start == end {
        return false;
    }

    let before: String = chars[..start].iter().collect();
    let selected: String = chars[start..end].iter().collect();
    let after: String = chars[end..].iter().collect();

    let mut wrapper = ElementNode::new(MARK_TAG);
    wrapper.mark = Some(id);
    wrapper.children.push(ContentNode::Text(selected));

    let mut replacement = Vec::with_capacity(3);
    if !before.is_empty() {
        replacement.push(ContentNode::Text(before));
    }
    replacement.push(ContentNode::Element(wrapper));
    if !after.is_empty() {
        replacement.push(ContentNode::Text(after));
    }

    children.splice(last..=last, replacement);
    true
}

fn children_mut<'a>(root: &'a mut ElementNode, path: &[usize]) -> Option<&'a mut Vec<ContentNode>> {
    let mut element = root;
    for &index in path {
        match element.children.get_mut(index)? {
            ContentNode::Element(el) => element = el,
            ContentNode::Text(_) => return None,
        }
    }
    Some(&mut element.children)
}

/// Removes every wrapper inserted for the given highlight id, merging the
/// freed text back into its neighbors so the tree returns to its pre-mark
/// shape.
pub fn remove_mark(tree: &mut ContentTree, id: Uuid) {
    unwrap_marks(&mut tree.root, id);
}

fn unwrap_marks(element: &mut ElementNode, id: Uuid) {
    let mut index = 0;
    while index < element.children.len() {
        let is_wrapper = matches!(
            &element.children[index],
            ContentNode::Element(el) if el.mark == Some(id)
        );
        if is_wrapper {
            let ContentNode::Element(wrapper) = element.children.remove(index) else {
                unreachable!("checked above");
            };
            element.children.splice(index..index, wrapper.children);
            continue;
        }
        if let ContentNode::Element(el) = &mut element.children[index] {
            unwrap_marks(el, id);
        }
        index += 1;
    }
    merge_adjacent_text(&mut element.children);
}

fn merge_adjacent_text(children: &mut Vec<ContentNode>) {
    let mut index = 0;
    while index + 1 < children.len() {
        if children[index].is_text() && children[index + 1].is_text() {
            let ContentNode::Text(next) = children.remove(index + 1) else {
                unreachable!("checked above");
            };
            if let ContentNode::Text(current) = &mut children[index] {
                current.push_str(&next);
            }
            continue;
        }
        index += 1;
    }
}

/// Resolves and applies a batch of highlights against a tree freshly parsed
/// from the unmarked source. Locators are resolved before any wrapper is
/// inserted and applied in reverse document order, so that inserting one
/// highlight never invalidates another's resolved address. Locators that no
/// longer resolve are skipped silently. Returns the number applied.
pub fn apply_highlights(tree: &mut ContentTree, highlights: &[(Uuid, Locator)]) -> usize {
    let mut resolved: Vec<(Uuid, TreeRange)> = Vec::with_capacity(highlights.len());
    for (id, locator) in highlights {
        match deserialize_range(tree, locator) {
            Some(range) => resolved.push((*id, range)),
            None => debug!(highlight = %id, "locator did not resolve, skipping"),
        }
    }

    resolved.sort_by(|a, b| (&a.1.start, a.1.start_offset).cmp(&(&b.1.start, b.1.start_offset)));

    let mut applied = 0;
    for (id, range) in resolved.into_iter().rev() {
        if apply_mark(tree, &range, id) {
            applied += 1;
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAPTER: &str =
        "<chapter><p>The obstacle <em>is</em> the way forward.</p><p>Amor fati.</p></chapter>";

    fn tree() -> ContentTree {
        ContentTree::parse(CHAPTER).unwrap()
    }

    #[test]
    fn parse_builds_expected_shape() {
        let tree = tree();
        assert_eq!(tree.text(), "The obstacle is the way forward.Amor fati.");
        // chapter -> first p -> first text node
        assert!(matches!(
            tree.node(&[0, 0, 0]),
            Some(ContentNode::Text(text)) if text == "The obstacle "
        ));
    }

    #[test]
    fn parse_rejects_malformed_markup() {
        assert!(ContentTree::parse("<p>never closed").is_err());
        assert!(ContentTree::parse("</p>").is_err());
    }

    #[test]
    fn serialize_then_deserialize_is_identity_on_unmodified_tree() {
        let tree = tree();
        let range = tree.capture_selection(4, 8).unwrap();
        let locator = serialize_range(&tree, &range).unwrap();
        let resolved = deserialize_range(&tree, &locator).unwrap();
        assert_eq!(resolved, range);
    }

    #[test]
    fn collapsed_selection_is_rejected() {
        let tree = tree();
        assert!(tree.capture_selection(4, 0).is_none());
        let range = TreeRange {
            start: vec![0, 0, 0],
            start_offset: 3,
            end: vec![0, 0, 0],
            end_offset: 3,
        };
        assert!(serialize_range(&tree, &range).is_none());
    }

    #[test]
    fn selection_outside_content_is_rejected() {
        let tree = tree();
        let total = tree.text().chars().count();
        assert!(tree.capture_selection(total, 5).is_none());
        assert!(tree.capture_selection(total - 2, 10).is_none());
    }

    #[test]
    fn locator_survives_rerender_with_identical_markup() {
        // Select entirely within the 2nd text node of a paragraph that has
        // three text-node siblings.
        let first = tree();
        let start = "The obstacle is ".chars().count();
        let range = first.capture_selection(start, 3).unwrap();
        assert_eq!(range.start, vec![0, 0, 2]);
        let locator = serialize_range(&first, &range).unwrap();

        let rerendered = ContentTree::parse(CHAPTER).unwrap();
        let resolved = deserialize_range(&rerendered, &locator).unwrap();
        assert_eq!(resolved.start, vec![0, 0, 2]);
        assert!(matches!(
            rerendered.node(&resolved.start),
            Some(ContentNode::Text(text)) if text == " the way forward."
        ));
    }

    #[test]
    fn missing_sibling_resolves_to_none() {
        let tree = tree();
        let locator = Locator {
            start_path: "chapter:nth-of-type(1)/p:nth-of-type(3)/text()[0]".into(),
            start_offset: 0,
            end_path: "chapter:nth-of-type(1)/p:nth-of-type(3)/text()[0]".into(),
            end_offset: 4,
        };
        assert!(deserialize_range(&tree, &locator).is_none());
    }

    #[test]
    fn out_of_range_offset_resolves_to_none() {
        let tree = tree();
        let range = tree.capture_selection(0, 5).unwrap();
        let mut locator = serialize_range(&tree, &range).unwrap();
        locator.end_offset = 10_000;
        assert!(deserialize_range(&tree, &locator).is_none());
    }

    #[test]
    fn mark_within_single_text_node() {
        let mut tree = tree();
        let range = tree.capture_selection(4, 8).unwrap();
        let id = Uuid::new_v4();
        assert!(apply_mark(&mut tree, &range, id));
        assert_eq!(
            tree.annotated_text("[", "]"),
            "The [obstacle] is the way forward.Amor fati."
        );
        // Wrapping must not change the flat text.
        assert_eq!(tree.text(), "The obstacle is the way forward.Amor fati.");
    }

    #[test]
    fn mark_spanning_multiple_text_nodes_wraps_each_intersection() {
        let mut tree = tree();
        // From inside "The obstacle " through the <em> into the trailing text.
        let range = tree.capture_selection(4, 19).unwrap();
        assert_ne!(range.start, range.end);
        assert!(apply_mark(&mut tree, &range, Uuid::new_v4()));
        assert_eq!(
            tree.annotated_text("[", "]"),
            "The [obstacle ][is][ the way] forward.Amor fati."
        );
    }

    #[test]
    fn mark_failure_does_not_panic() {
        let mut tree = tree();
        let range = TreeRange {
            start: vec![9, 9],
            start_offset: 0,
            end: vec![9, 9],
            end_offset: 3,
        };
        assert!(!apply_mark(&mut tree, &range, Uuid::new_v4()));
    }

    #[test]
    fn remove_mark_restores_original_shape() {
        let mut tree = tree();
        let pristine = tree.clone();
        let range = tree.capture_selection(4, 8).unwrap();
        let id = Uuid::new_v4();
        assert!(apply_mark(&mut tree, &range, id));
        assert_ne!(tree, pristine);
        remove_mark(&mut tree, id);
        assert_eq!(tree, pristine);
    }

    #[test]
    fn batch_application_keeps_every_locator_valid() {
        let clean = tree();
        let first = clean.capture_selection(0, 3).unwrap();
        let second = clean.capture_selection(20, 8).unwrap();
        let a = (Uuid::new_v4(), serialize_range(&clean, &first).unwrap());
        let b = (Uuid::new_v4(), serialize_range(&clean, &second).unwrap());

        // Order of the stored highlights must not matter.
        let mut tree = ContentTree::parse(CHAPTER).unwrap();
        assert_eq!(apply_highlights(&mut tree, &[b.clone(), a.clone()]), 2);
        assert_eq!(
            tree.annotated_text("[", "]"),
            "[The] obstacle is the [way forw]ard.Amor fati."
        );
    }

    #[test]
    fn overlapping_highlights_apply_lossily_without_error() {
        let clean = tree();
        let outer = clean.capture_selection(0, 8).unwrap();
        let inner = clean.capture_selection(4, 8).unwrap();
        let a = (Uuid::new_v4(), serialize_range(&clean, &outer).unwrap());
        let b = (Uuid::new_v4(), serialize_range(&clean, &inner).unwrap());

        let mut tree = ContentTree::parse(CHAPTER).unwrap();
        assert_eq!(apply_highlights(&mut tree, &[a, b]), 2);
        // The overlapped portion belongs to whichever mark wrapped it first;
        // the other mark is clipped to what remains, never an error.
        assert_eq!(
            tree.annotated_text("[", "]"),
            "[The ][obstacle] is the way forward.Amor fati."
        );
        assert_eq!(tree.text(), "The obstacle is the way forward.Amor fati.");
    }

    #[test]
    fn stale_locator_is_skipped_silently() {
        let clean = tree();
        let range = clean.capture_selection(0, 3).unwrap();
        let good = (Uuid::new_v4(), serialize_range(&clean, &range).unwrap());
        let stale = (
            Uuid::new_v4(),
            Locator {
                start_path: "chapter:nth-of-type(1)/h1:nth-of-type(1)/text()[0]".into(),
                start_offset: 0,
                end_path: "chapter:nth-of-type(1)/h1:nth-of-type(1)/text()[0]".into(),
                end_offset: 2,
            },
        );

        let mut tree = ContentTree::parse(CHAPTER).unwrap();
        assert_eq!(apply_highlights(&mut tree, &[good, stale]), 1);
    }
}
