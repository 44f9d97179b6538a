//! Node identity and the storage collaborator contracts.
//!
//! Nodes are addressed by [`NodeId`], an opaque copyable handle into the
//! storage layer. The engine never holds borrowed node structures across
//! evaluation steps; all navigation goes through [`Storage`].
use crate::runtime::Error;
use crate::xdm::ExpandedName;
use core::cmp::Ordering;

/// Opaque node handle. The numeric value carries no document-order meaning;
/// use [`Storage::compare_order`] for ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

/// Interned element/attribute/processing-instruction name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NameId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Document,
    Element,
    Attribute,
    Text,
    Comment,
    ProcessingInstruction,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QName {
    pub prefix: Option<String>,
    pub local: String,
    pub ns_uri: Option<String>,
}

impl QName {
    pub fn local(local: impl Into<String>) -> Self {
        Self {
            prefix: None,
            local: local.into(),
            ns_uri: None,
        }
    }

    pub fn expanded(&self) -> ExpandedName {
        ExpandedName::new(self.ns_uri.clone(), self.local.clone())
    }

    pub fn matches(&self, name: &ExpandedName) -> bool {
        self.local == name.local && self.ns_uri == name.ns_uri
    }
}

/// Read-only access to the stored tree.
///
/// Implementations must be internally consistent for the duration of one
/// evaluation: the engine only mutates storage through [`StorageMut`] after
/// evaluation has finished.
pub trait Storage {
    /// The document node.
    fn root(&self) -> NodeId;
    fn kind(&self, node: NodeId) -> NodeKind;
    fn parent(&self, node: NodeId) -> Option<NodeId>;
    /// Number of nodes in the subtree rooted at `node`, attributes included.
    fn size(&self, node: NodeId) -> usize;
    fn attribute_count(&self, node: NodeId) -> usize;
    /// Value of a text, attribute, comment or processing-instruction node;
    /// empty for documents and elements.
    fn text_of(&self, node: NodeId) -> &str;
    /// Name of an element or processing instruction.
    fn tag_name_id(&self, node: NodeId) -> Option<NameId>;
    fn attribute_name_id(&self, node: NodeId) -> Option<NameId>;
    fn qname(&self, id: NameId) -> &QName;
    fn name_id(&self, name: &ExpandedName) -> Option<NameId>;
    fn children(&self, node: NodeId) -> &[NodeId];
    fn attributes(&self, node: NodeId) -> &[NodeId];
    fn compare_order(&self, a: NodeId, b: NodeId) -> Ordering;

    /// Modification counter; bumped by every applied update.
    fn version(&self) -> u64 {
        0
    }

    fn name_of(&self, node: NodeId) -> Option<&QName> {
        match self.kind(node) {
            NodeKind::Attribute => self.attribute_name_id(node).map(|id| self.qname(id)),
            NodeKind::Element | NodeKind::ProcessingInstruction => {
                self.tag_name_id(node).map(|id| self.qname(id))
            }
            _ => None,
        }
    }

    fn string_value(&self, node: NodeId) -> String {
        match self.kind(node) {
            NodeKind::Element | NodeKind::Document => {
                let mut out = String::new();
                collect_text(self, node, &mut out);
                out
            }
            _ => self.text_of(node).to_string(),
        }
    }

    /// Total number of stored nodes.
    fn node_count(&self) -> usize {
        self.size(self.root())
    }

    fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cur = self.parent(node);
        while let Some(p) = cur {
            if p == ancestor {
                return true;
            }
            cur = self.parent(p);
        }
        false
    }

    /// Detached deep copy of a node, used as insert/replace payload.
    fn copy_fragment(&self, node: NodeId) -> Fragment {
        match self.kind(node) {
            NodeKind::Element => Fragment::Element {
                name: self.name_of(node).cloned().unwrap_or_else(|| QName::local("")),
                attributes: self
                    .attributes(node)
                    .iter()
                    .map(|&a| {
                        (
                            self.name_of(a).cloned().unwrap_or_else(|| QName::local("")),
                            self.text_of(a).to_string(),
                        )
                    })
                    .collect(),
                children: self
                    .children(node)
                    .iter()
                    .map(|&c| self.copy_fragment(c))
                    .collect(),
            },
            NodeKind::Attribute => Fragment::Attribute {
                name: self.name_of(node).cloned().unwrap_or_else(|| QName::local("")),
                value: self.text_of(node).to_string(),
            },
            NodeKind::Text => Fragment::Text(self.text_of(node).to_string()),
            NodeKind::Comment => Fragment::Comment(self.text_of(node).to_string()),
            NodeKind::ProcessingInstruction => Fragment::ProcessingInstruction {
                target: self.name_of(node).map(|q| q.local.clone()).unwrap_or_default(),
                value: self.text_of(node).to_string(),
            },
            // a document contributes its children
            NodeKind::Document => Fragment::Sequence(
                self.children(node)
                    .iter()
                    .map(|&c| self.copy_fragment(c))
                    .collect(),
            ),
        }
    }
}

fn collect_text<S: Storage + ?Sized>(store: &S, node: NodeId, out: &mut String) {
    for &c in store.children(node) {
        match store.kind(c) {
            NodeKind::Text => out.push_str(store.text_of(c)),
            NodeKind::Element => collect_text(store, c, out),
            _ => {}
        }
    }
}

/// Detached subtree used as update payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Element {
        name: QName,
        attributes: Vec<(QName, String)>,
        children: Vec<Fragment>,
    },
    Attribute {
        name: QName,
        value: String,
    },
    Text(String),
    Comment(String),
    ProcessingInstruction {
        target: String,
        value: String,
    },
    /// Flattened on insertion.
    Sequence(Vec<Fragment>),
}

impl Fragment {
    pub fn is_attribute(&self) -> bool {
        matches!(self, Fragment::Attribute { .. })
    }

    /// Nested `Sequence` fragments are spliced into their parent list.
    pub fn flatten(fragments: Vec<Fragment>) -> Vec<Fragment> {
        let mut out = Vec::with_capacity(fragments.len());
        for f in fragments {
            match f {
                Fragment::Sequence(inner) => out.extend(Fragment::flatten(inner)),
                other => out.push(other),
            }
        }
        out
    }
}

/// Mutation contract used only by the deferred update application step.
pub trait StorageMut: Storage {
    /// Insert `nodes` as children of `parent`, starting at child index `index`.
    fn insert_children(&mut self, parent: NodeId, index: usize, nodes: &[Fragment])
    -> Result<(), Error>;
    fn insert_attributes(&mut self, element: NodeId, attrs: &[Fragment]) -> Result<(), Error>;
    /// Detach `node` with its subtree.
    fn delete(&mut self, node: NodeId) -> Result<(), Error>;
    fn rename(&mut self, node: NodeId, name: QName) -> Result<(), Error>;
    /// Replace the value of a text, attribute, comment or processing-instruction node.
    fn set_value(&mut self, node: NodeId, value: &str) -> Result<(), Error>;
    /// Replace all children of an element with a single text node (none if empty).
    fn replace_content(&mut self, element: NodeId, text: &str) -> Result<(), Error>;
}
