//! Arena document for the sandboxed page.
//!
//! Parsing goes through kuchiki; the tree is then flattened into an arena of
//! `usize` node ids so it can be shared across tasks.

use html_escape::{encode_double_quoted_attribute, encode_text};
use kuchiki::traits::*;
use kuchiki::{parse_html, NodeData, NodeRef};
use thiserror::Error;

pub type NodeId = usize;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomError {
    #[error("missing node {0}")]
    MissingNode(NodeId),
    #[error("node {child} is not a child of {parent}")]
    NotAChild { parent: NodeId, child: NodeId },
    #[error("node {0} cannot hold children")]
    NotAContainer(NodeId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Document,
    Doctype(String),
    Element {
        name: String,
        attrs: Vec<(String, String)>,
    },
    Text(String),
    Comment(String),
}

/// Border box reported by whatever lays the page out. Headless documents only
/// carry the boxes they are given.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayoutBox {
    pub top: f64,
    pub height: f64,
    pub visible: bool,
}

impl LayoutBox {
    pub fn new(top: f64, height: f64) -> Self {
        Self {
            top,
            height,
            visible: true,
        }
    }

    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    layout: Option<LayoutBox>,
}

#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
}

impl Default for Document {
    fn default() -> Self {
        Self::parse("")
    }
}

impl Document {
    pub fn parse(html: &str) -> Self {
        let parsed = parse_html().one(html);
        let mut document = Self {
            nodes: vec![Node {
                kind: NodeKind::Document,
                parent: None,
                children: Vec::new(),
                layout: None,
            }],
        };
        for child in parsed.children() {
            document.import(&child, 0);
        }
        document
    }

    fn import(&mut self, source: &NodeRef, parent: NodeId) {
        let kind = match source.data() {
            NodeData::Element(element) => {
                let attributes = element.attributes.borrow();
                NodeKind::Element {
                    name: element.name.local.to_string(),
                    attrs: attributes
                        .map
                        .iter()
                        .map(|(name, attr)| (name.local.to_string(), attr.value.clone()))
                        .collect(),
                }
            }
            NodeData::Text(text) => NodeKind::Text(text.borrow().clone()),
            NodeData::Comment(text) => NodeKind::Comment(text.borrow().clone()),
            NodeData::Doctype(doctype) => NodeKind::Doctype(doctype.name.clone()),
            NodeData::Document(_) | NodeData::DocumentFragment => {
                for child in source.children() {
                    self.import(&child, parent);
                }
                return;
            }
            NodeData::ProcessingInstruction(_) => return,
        };
        let id = self.push(kind);
        self.nodes[id].parent = Some(parent);
        self.nodes[parent].children.push(id);
        for child in source.children() {
            self.import(&child, id);
        }
    }

    fn push(&mut self, kind: NodeKind) -> NodeId {
        self.nodes.push(Node {
            kind,
            parent: None,
            children: Vec::new(),
            layout: None,
        });
        self.nodes.len() - 1
    }

    fn node(&self, id: NodeId) -> Result<&Node, DomError> {
        self.nodes.get(id).ok_or(DomError::MissingNode(id))
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn kind(&self, id: NodeId) -> Option<&NodeKind> {
        self.nodes.get(id).map(|node| &node.kind)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id).and_then(|node| node.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(id)
            .map(|node| node.children.as_slice())
            .unwrap_or(&[])
    }

    /// Whether `id` is still reachable from the document root.
    pub fn is_connected(&self, id: NodeId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if current == self.root() {
                return true;
            }
            cursor = self.parent(current);
        }
        false
    }

    pub fn tag_name(&self, id: NodeId) -> Option<&str> {
        match self.kind(id) {
            Some(NodeKind::Element { name, .. }) => Some(name),
            _ => None,
        }
    }

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        match self.kind(id) {
            Some(NodeKind::Element { attrs, .. }) => attrs
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str()),
            _ => None,
        }
    }

    pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) -> Result<(), DomError> {
        let node = self.nodes.get_mut(id).ok_or(DomError::MissingNode(id))?;
        let NodeKind::Element { attrs, .. } = &mut node.kind else {
            return Err(DomError::NotAContainer(id));
        };
        match attrs.iter_mut().find(|(key, _)| key.eq_ignore_ascii_case(name)) {
            Some((_, existing)) => *existing = value.to_string(),
            None => attrs.push((name.to_ascii_lowercase(), value.to_string())),
        }
        Ok(())
    }

    pub fn remove_attr(&mut self, id: NodeId, name: &str) -> Result<Option<String>, DomError> {
        let node = self.nodes.get_mut(id).ok_or(DomError::MissingNode(id))?;
        let NodeKind::Element { attrs, .. } = &mut node.kind else {
            return Ok(None);
        };
        let position = attrs.iter().position(|(key, _)| key.eq_ignore_ascii_case(name));
        Ok(position.map(|index| attrs.remove(index).1))
    }

    fn child_element(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.children(parent)
            .iter()
            .copied()
            .find(|child| self.tag_name(*child) == Some(name))
    }

    pub fn document_element(&self) -> Option<NodeId> {
        self.child_element(self.root(), "html")
    }

    pub fn head(&self) -> Option<NodeId> {
        self.document_element()
            .and_then(|html| self.child_element(html, "head"))
    }

    pub fn body(&self) -> Option<NodeId> {
        self.document_element()
            .and_then(|html| self.child_element(html, "body"))
    }

    /// Every connected node under `from`, in document order.
    pub fn descendants(&self, from: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(from).iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.children(id).iter().rev().copied());
        }
        out
    }

    pub fn elements_by_tag(&self, name: &str) -> Vec<NodeId> {
        self.descendants(self.root())
            .into_iter()
            .filter(|id| self.tag_name(*id) == Some(name))
            .collect()
    }

    pub fn element_by_id(&self, element_id: &str) -> Option<NodeId> {
        self.descendants(self.root())
            .into_iter()
            .find(|id| self.attr(*id, "id") == Some(element_id))
    }

    /// `id` and its ancestors, innermost first.
    pub fn ancestors_inclusive(&self, id: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if current == self.root() {
                break;
            }
            chain.push(current);
            cursor = self.parent(current);
        }
        chain
    }

    pub fn closest_with_attr(&self, id: NodeId, attr: &str) -> Option<NodeId> {
        self.ancestors_inclusive(id)
            .into_iter()
            .find(|node| self.attr(*node, attr).is_some())
    }

    pub fn create_element(&mut self, name: &str, attrs: &[(&str, &str)]) -> NodeId {
        self.push(NodeKind::Element {
            name: name.to_ascii_lowercase(),
            attrs: attrs
                .iter()
                .map(|(key, value)| (key.to_ascii_lowercase(), value.to_string()))
                .collect(),
        })
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.push(NodeKind::Text(text.to_string()))
    }

    pub fn create_comment(&mut self, text: &str) -> NodeId {
        self.push(NodeKind::Comment(text.to_string()))
    }

    fn ensure_container(&self, id: NodeId) -> Result<(), DomError> {
        match self.node(id)?.kind {
            NodeKind::Document | NodeKind::Element { .. } => Ok(()),
            _ => Err(DomError::NotAContainer(id)),
        }
    }

    fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id].parent.take() {
            self.nodes[parent].children.retain(|child| *child != id);
        }
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        self.insert_before(parent, child, None)
    }

    pub fn insert_before(
        &mut self,
        parent: NodeId,
        child: NodeId,
        reference: Option<NodeId>,
    ) -> Result<(), DomError> {
        self.ensure_container(parent)?;
        self.node(child)?;
        if let Some(reference) = reference {
            if self.node(reference)?.parent != Some(parent) {
                return Err(DomError::NotAChild {
                    parent,
                    child: reference,
                });
            }
        }
        self.detach(child);
        let position = reference
            .and_then(|reference| {
                self.nodes[parent]
                    .children
                    .iter()
                    .position(|existing| *existing == reference)
            })
            .unwrap_or(self.nodes[parent].children.len());
        self.nodes[parent].children.insert(position, child);
        self.nodes[child].parent = Some(parent);
        Ok(())
    }

    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        if self.node(child)?.parent != Some(parent) {
            return Err(DomError::NotAChild { parent, child });
        }
        self.detach(child);
        Ok(())
    }

    /// Detach `id` from wherever it is. No-op for detached nodes.
    pub fn remove(&mut self, id: NodeId) -> Result<(), DomError> {
        self.node(id)?;
        self.detach(id);
        Ok(())
    }

    pub fn text_content(&self, id: NodeId) -> String {
        match self.kind(id) {
            Some(NodeKind::Text(text)) => text.clone(),
            Some(NodeKind::Comment(_)) | None => String::new(),
            Some(_) => self
                .descendants(id)
                .into_iter()
                .filter_map(|node| match self.kind(node) {
                    Some(NodeKind::Text(text)) => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    /// Comments and whitespace-only text do not count as content.
    pub fn is_ignorable(&self, id: NodeId) -> bool {
        match self.kind(id) {
            Some(NodeKind::Comment(_)) => true,
            Some(NodeKind::Text(text)) => text.trim().is_empty(),
            _ => false,
        }
    }

    pub fn layout(&self, id: NodeId) -> Option<LayoutBox> {
        self.nodes.get(id).and_then(|node| node.layout)
    }

    pub fn set_layout(&mut self, id: NodeId, layout: LayoutBox) -> Result<(), DomError> {
        let node = self.nodes.get_mut(id).ok_or(DomError::MissingNode(id))?;
        node.layout = Some(layout);
        Ok(())
    }

    /// A declaration from the element's inline `style` attribute.
    pub fn inline_style(&self, id: NodeId, property: &str) -> Option<String> {
        let style = self.attr(id, "style")?;
        style.split(';').find_map(|declaration| {
            let (name, value) = declaration.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case(property)
                .then(|| value.trim().to_string())
        })
    }

    pub fn serialize(&self) -> String {
        let mut output = String::new();
        self.serialize_children(self.root(), &mut output);
        output
    }

    fn serialize_children(&self, id: NodeId, output: &mut String) {
        for child in self.children(id) {
            self.serialize_node(*child, output);
        }
    }

    fn serialize_node(&self, id: NodeId, output: &mut String) {
        match &self.nodes[id].kind {
            NodeKind::Document => self.serialize_children(id, output),
            NodeKind::Doctype(name) => {
                output.push_str("<!DOCTYPE ");
                output.push_str(name);
                output.push('>');
            }
            NodeKind::Element { name, attrs } => {
                output.push('<');
                output.push_str(name);
                for (key, value) in attrs {
                    output.push(' ');
                    output.push_str(key);
                    output.push_str("=\"");
                    output.push_str(&encode_double_quoted_attribute(value));
                    output.push('"');
                }
                output.push('>');
                if is_void_element(name) {
                    return;
                }
                self.serialize_children(id, output);
                output.push_str("</");
                output.push_str(name);
                output.push('>');
            }
            NodeKind::Text(text) => output.push_str(&encode_text(text)),
            NodeKind::Comment(text) => {
                output.push_str("<!--");
                output.push_str(text);
                output.push_str("-->");
            }
        }
    }
}

fn is_void_element(name: &str) -> bool {
    matches!(
        name,
        "area" | "base" | "br" | "col" | "embed" | "hr" | "img" | "input" | "link" | "meta"
            | "source" | "track" | "wbr"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_structure() {
        let doc = Document::parse(
            "<!doctype html><html data-x=\"1\"><head><title>t</title></head><body><div id=\"root\">hi</div></body></html>",
        );
        let html = doc.document_element().unwrap();
        assert_eq!(doc.attr(html, "data-x"), Some("1"));
        let root = doc.element_by_id("root").unwrap();
        assert_eq!(doc.text_content(root), "hi");
        assert_eq!(doc.parent(root), doc.body());
        assert!(doc.head().is_some());
    }

    #[test]
    fn fragments_get_html_skeleton() {
        let doc = Document::parse("<p>only</p>");
        assert!(doc.head().is_some());
        let body = doc.body().unwrap();
        assert_eq!(doc.tag_name(doc.children(body)[0]), Some("p"));
    }

    #[test]
    fn mutations_keep_tree_consistent() {
        let mut doc = Document::parse("<body><p>a</p><p>b</p></body>");
        let body = doc.body().unwrap();
        let first = doc.children(body)[0];
        let span = doc.create_element("span", &[("class", "x")]);
        doc.insert_before(body, span, Some(first)).unwrap();
        assert_eq!(doc.children(body)[0], span);

        doc.remove_child(body, first).unwrap();
        assert!(!doc.is_connected(first));
        assert_eq!(
            doc.remove_child(body, first),
            Err(DomError::NotAChild {
                parent: body,
                child: first
            })
        );
        assert!(doc.serialize().contains("<span class=\"x\"></span><p>b</p>"));
    }

    #[test]
    fn ignorable_nodes() {
        let mut doc = Document::parse("<body> <!-- c --> </body>");
        let body = doc.body().unwrap();
        assert!(doc.children(body).iter().all(|child| doc.is_ignorable(*child)));
        let text = doc.create_text("x");
        doc.append_child(body, text).unwrap();
        assert!(!doc.is_ignorable(text));
    }

    #[test]
    fn reads_inline_style() {
        let doc = Document::parse("<body style=\"margin: 0; Background-Color: #fff\"></body>");
        let body = doc.body().unwrap();
        assert_eq!(doc.inline_style(body, "background-color").as_deref(), Some("#fff"));
        assert_eq!(doc.inline_style(body, "color"), None);
    }
}
