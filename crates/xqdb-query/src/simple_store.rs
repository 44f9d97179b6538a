//! Simple in-memory arena store used in tests, benchmarks and small embeddings.
//!
//! Focus:
//! - Ergonomic builder for quick test tree creation
//! - Document order kept as a pre-order number that is recomputed after every update
//! - Implements both [`Storage`] and [`StorageMut`]
//!
//! Example:
//! ```
//! use xqdb_query::simple_store::{doc, elem, text, attr};
//! use xqdb_query::model::Storage;
//!
//! // <root id="r"><child>Hello</child><child world="yes"/></root>
//! let store = doc()
//!     .child(
//!         elem("root")
//!             .attr(attr("id", "r"))
//!             .child(elem("child").child(text("Hello")))
//!             .child(elem("child").attr(attr("world", "yes"))),
//!     )
//!     .build();
//! let root = store.children(store.root())[0];
//! assert_eq!(store.name_of(root).unwrap().local, "root");
//! assert_eq!(store.children(root).len(), 2);
//! assert_eq!(store.string_value(root), "Hello");
//! ```
use crate::model::{Fragment, NameId, NodeId, NodeKind, QName, Storage, StorageMut};
use crate::runtime::{Error, ErrorCode};
use crate::xdm::ExpandedName;
use core::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::Write as _;

#[derive(Debug, Clone)]
struct NodeRec {
    kind: NodeKind,
    name: Option<NameId>,
    value: String,
    parent: Option<NodeId>,
    attrs: Vec<NodeId>,
    children: Vec<NodeId>,
    pre: u32,
    size: u32,
    live: bool,
}

impl NodeRec {
    fn new(kind: NodeKind, name: Option<NameId>, value: String) -> Self {
        Self {
            kind,
            name,
            value,
            parent: None,
            attrs: Vec::new(),
            children: Vec::new(),
            pre: 0,
            size: 1,
            live: true,
        }
    }
}

/// Arena-backed document. Node handles stay valid across updates; detached
/// nodes keep their slot but are no longer reachable from the root.
#[derive(Debug, Clone)]
pub struct SimpleStore {
    nodes: Vec<NodeRec>,
    names: Vec<QName>,
    interned: HashMap<QName, NameId>,
    by_expanded: HashMap<ExpandedName, NameId>,
    root: NodeId,
    version: u64,
}

impl SimpleStore {
    fn empty() -> Self {
        let mut store = Self {
            nodes: Vec::new(),
            names: Vec::new(),
            interned: HashMap::new(),
            by_expanded: HashMap::new(),
            root: NodeId(0),
            version: 0,
        };
        store.root = store.alloc(NodeRec::new(NodeKind::Document, None, String::new()));
        store
    }

    /// Build a document whose children are the given fragments.
    pub fn from_fragments(fragments: Vec<Fragment>) -> Result<Self, Error> {
        let mut store = Self::empty();
        let root = store.root;
        store.append_fragments(root, 0, Fragment::flatten(fragments))?;
        store.renumber();
        Ok(store)
    }

    fn alloc(&mut self, rec: NodeRec) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(rec);
        id
    }

    fn rec(&self, node: NodeId) -> &NodeRec {
        &self.nodes[node.0 as usize]
    }

    fn rec_mut(&mut self, node: NodeId) -> &mut NodeRec {
        &mut self.nodes[node.0 as usize]
    }

    fn intern(&mut self, name: &QName) -> NameId {
        if let Some(id) = self.interned.get(name) {
            return *id;
        }
        let id = NameId(self.names.len() as u32);
        self.names.push(name.clone());
        self.interned.insert(name.clone(), id);
        self.by_expanded.entry(name.expanded()).or_insert(id);
        id
    }

    fn create(&mut self, fragment: &Fragment) -> Result<NodeId, Error> {
        let id = match fragment {
            Fragment::Element {
                name,
                attributes,
                children,
            } => {
                let name = self.intern(name);
                let id = self.alloc(NodeRec::new(NodeKind::Element, Some(name), String::new()));
                let attrs = attributes
                    .iter()
                    .map(|(n, v)| Fragment::Attribute {
                        name: n.clone(),
                        value: v.clone(),
                    })
                    .collect::<Vec<_>>();
                self.attach_attributes(id, &attrs)?;
                self.append_fragments(id, 0, Fragment::flatten(children.clone()))?;
                id
            }
            Fragment::Attribute { name, value } => {
                let name = self.intern(name);
                self.alloc(NodeRec::new(NodeKind::Attribute, Some(name), value.clone()))
            }
            Fragment::Text(v) => self.alloc(NodeRec::new(NodeKind::Text, None, v.clone())),
            Fragment::Comment(v) => self.alloc(NodeRec::new(NodeKind::Comment, None, v.clone())),
            Fragment::ProcessingInstruction { target, value } => {
                let name = self.intern(&QName::local(target.clone()));
                self.alloc(NodeRec::new(
                    NodeKind::ProcessingInstruction,
                    Some(name),
                    value.clone(),
                ))
            }
            Fragment::Sequence(_) => {
                return Err(Error::type_err("nested fragment sequence cannot be stored"));
            }
        };
        Ok(id)
    }

    fn append_fragments(
        &mut self,
        parent: NodeId,
        index: usize,
        fragments: Vec<Fragment>,
    ) -> Result<(), Error> {
        let mut created = Vec::with_capacity(fragments.len());
        for f in &fragments {
            if f.is_attribute() {
                return Err(Error::from_code(
                    ErrorCode::XUTY0013,
                    "attribute cannot be inserted as a child",
                ));
            }
            let id = self.create(f)?;
            self.rec_mut(id).parent = Some(parent);
            created.push(id);
        }
        let children = &mut self.rec_mut(parent).children;
        let at = index.min(children.len());
        children.splice(at..at, created);
        Ok(())
    }

    fn attach_attributes(&mut self, element: NodeId, attrs: &[Fragment]) -> Result<(), Error> {
        for a in attrs {
            let Fragment::Attribute { name, .. } = a else {
                return Err(Error::type_err("attribute fragment expected"));
            };
            let duplicate = self
                .rec(element)
                .attrs
                .iter()
                .any(|&x| self.name_of(x).is_some_and(|q| q.expanded() == name.expanded()));
            if duplicate {
                return Err(Error::from_code(
                    ErrorCode::XUDY0021,
                    format!("duplicate attribute {}", name.local),
                ));
            }
            let id = self.create(a)?;
            self.rec_mut(id).parent = Some(element);
            self.rec_mut(element).attrs.push(id);
        }
        Ok(())
    }

    fn kill(&mut self, node: NodeId) {
        let (attrs, children) = {
            let r = self.rec_mut(node);
            r.live = false;
            (r.attrs.clone(), r.children.clone())
        };
        for n in attrs.into_iter().chain(children) {
            self.kill(n);
        }
    }

    /// Recompute pre-order numbers and subtree sizes from the root.
    fn renumber(&mut self) {
        fn walk(store: &mut SimpleStore, node: NodeId, next: &mut u32) -> u32 {
            let pre = *next;
            *next += 1;
            let r = store.rec(node);
            let attrs = r.attrs.clone();
            let children = r.children.clone();
            let mut size = 1;
            for a in attrs {
                let ar = store.rec_mut(a);
                ar.pre = *next;
                ar.size = 1;
                *next += 1;
                size += 1;
            }
            for c in children {
                size += walk(store, c, next);
            }
            let r = store.rec_mut(node);
            r.pre = pre;
            r.size = size;
            size
        }
        let mut next = 0;
        let root = self.root;
        walk(self, root, &mut next);
    }

    fn touched(&mut self) {
        self.renumber();
        self.version += 1;
    }

    pub fn is_live(&self, node: NodeId) -> bool {
        self.rec(node).live
    }

    /// All element nodes with the given local name, in document order.
    pub fn elements_named(&self, local: &str) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(n) = stack.pop() {
            if self.kind(n) == NodeKind::Element
                && self.name_of(n).is_some_and(|q| q.local == local)
            {
                out.push(n);
            }
            stack.extend(self.children(n).iter().rev());
        }
        out
    }

    /// Compact XML serialization of a node, mainly for assertions.
    pub fn to_xml(&self, node: NodeId) -> String {
        let mut out = String::new();
        self.write_xml(node, &mut out);
        out
    }

    fn write_xml(&self, node: NodeId, out: &mut String) {
        let r = self.rec(node);
        match r.kind {
            NodeKind::Document => {
                for &c in &r.children {
                    self.write_xml(c, out);
                }
            }
            NodeKind::Element => {
                let name = self.display_name(node);
                let _ = write!(out, "<{name}");
                for &a in &r.attrs {
                    let _ = write!(
                        out,
                        " {}=\"{}\"",
                        self.display_name(a),
                        escape(self.text_of(a), true)
                    );
                }
                if r.children.is_empty() {
                    out.push_str("/>");
                } else {
                    out.push('>');
                    for &c in &r.children {
                        self.write_xml(c, out);
                    }
                    let _ = write!(out, "</{name}>");
                }
            }
            NodeKind::Attribute => {
                let _ = write!(out, "{}=\"{}\"", self.display_name(node), escape(&r.value, true));
            }
            NodeKind::Text => out.push_str(&escape(&r.value, false)),
            NodeKind::Comment => {
                let _ = write!(out, "<!--{}-->", r.value);
            }
            NodeKind::ProcessingInstruction => {
                let _ = write!(out, "<?{} {}?>", self.display_name(node), r.value);
            }
        }
    }

    fn display_name(&self, node: NodeId) -> String {
        match self.name_of(node) {
            Some(QName {
                prefix: Some(p),
                local,
                ..
            }) if !p.is_empty() => format!("{p}:{local}"),
            Some(q) => q.local.clone(),
            None => String::new(),
        }
    }
}

fn escape(s: &str, attr: bool) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '<' => out.push_str("&lt;"),
            '&' => out.push_str("&amp;"),
            '>' => out.push_str("&gt;"),
            '"' if attr => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

impl Storage for SimpleStore {
    fn root(&self) -> NodeId {
        self.root
    }

    fn kind(&self, node: NodeId) -> NodeKind {
        self.rec(node).kind
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.rec(node).parent
    }

    fn size(&self, node: NodeId) -> usize {
        self.rec(node).size as usize
    }

    fn attribute_count(&self, node: NodeId) -> usize {
        self.rec(node).attrs.len()
    }

    fn text_of(&self, node: NodeId) -> &str {
        &self.rec(node).value
    }

    fn tag_name_id(&self, node: NodeId) -> Option<NameId> {
        let r = self.rec(node);
        match r.kind {
            NodeKind::Element | NodeKind::ProcessingInstruction => r.name,
            _ => None,
        }
    }

    fn attribute_name_id(&self, node: NodeId) -> Option<NameId> {
        let r = self.rec(node);
        match r.kind {
            NodeKind::Attribute => r.name,
            _ => None,
        }
    }

    fn qname(&self, id: NameId) -> &QName {
        &self.names[id.0 as usize]
    }

    fn name_id(&self, name: &ExpandedName) -> Option<NameId> {
        self.by_expanded.get(name).copied()
    }

    fn children(&self, node: NodeId) -> &[NodeId] {
        &self.rec(node).children
    }

    fn attributes(&self, node: NodeId) -> &[NodeId] {
        &self.rec(node).attrs
    }

    fn compare_order(&self, a: NodeId, b: NodeId) -> Ordering {
        self.rec(a)
            .pre
            .cmp(&self.rec(b).pre)
            .then_with(|| a.0.cmp(&b.0))
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl StorageMut for SimpleStore {
    fn insert_children(
        &mut self,
        parent: NodeId,
        index: usize,
        nodes: &[Fragment],
    ) -> Result<(), Error> {
        if !matches!(self.kind(parent), NodeKind::Element | NodeKind::Document) {
            return Err(Error::from_code(
                ErrorCode::XUTY0005,
                "children can only be inserted into elements or documents",
            ));
        }
        self.append_fragments(parent, index, Fragment::flatten(nodes.to_vec()))?;
        self.touched();
        Ok(())
    }

    fn insert_attributes(&mut self, element: NodeId, attrs: &[Fragment]) -> Result<(), Error> {
        if self.kind(element) != NodeKind::Element {
            return Err(Error::from_code(
                ErrorCode::XUTY0005,
                "attributes can only be inserted into elements",
            ));
        }
        self.attach_attributes(element, &Fragment::flatten(attrs.to_vec()))?;
        self.touched();
        Ok(())
    }

    fn delete(&mut self, node: NodeId) -> Result<(), Error> {
        if let Some(p) = self.parent(node) {
            let pr = self.rec_mut(p);
            pr.attrs.retain(|&n| n != node);
            pr.children.retain(|&n| n != node);
        }
        self.rec_mut(node).parent = None;
        self.kill(node);
        self.touched();
        Ok(())
    }

    fn rename(&mut self, node: NodeId, name: QName) -> Result<(), Error> {
        if let Some(p) = self.parent(node)
            && self.kind(node) == NodeKind::Attribute
        {
            let clash = self.attributes(p).iter().any(|&a| {
                a != node && self.name_of(a).is_some_and(|q| q.expanded() == name.expanded())
            });
            if clash {
                return Err(Error::from_code(
                    ErrorCode::XUDY0021,
                    format!("duplicate attribute {}", name.local),
                ));
            }
        }
        let id = self.intern(&name);
        self.rec_mut(node).name = Some(id);
        self.touched();
        Ok(())
    }

    fn set_value(&mut self, node: NodeId, value: &str) -> Result<(), Error> {
        match self.kind(node) {
            NodeKind::Element | NodeKind::Document => {
                Err(Error::type_err("element value must be replaced through its content"))
            }
            _ => {
                self.rec_mut(node).value = value.to_string();
                self.touched();
                Ok(())
            }
        }
    }

    fn replace_content(&mut self, element: NodeId, text: &str) -> Result<(), Error> {
        let old = std::mem::take(&mut self.rec_mut(element).children);
        for c in old {
            self.rec_mut(c).parent = None;
            self.kill(c);
        }
        if !text.is_empty() {
            self.append_fragments(element, 0, vec![Fragment::Text(text.to_string())])?;
        }
        self.touched();
        Ok(())
    }
}

/// Builder for element and document nodes.
#[derive(Debug, Clone)]
pub struct NodeBuilder {
    name: Option<QName>,
    attributes: Vec<(QName, String)>,
    children: Vec<Fragment>,
}

impl NodeBuilder {
    pub fn child(mut self, child: impl Into<Fragment>) -> Self {
        match child.into() {
            Fragment::Attribute { name, value } => self.attributes.push((name, value)),
            other => self.children.push(other),
        }
        self
    }

    pub fn children<I, F>(mut self, it: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<Fragment>,
    {
        it.into_iter().fold(self, |b, c| b.child(c))
    }

    pub fn attr(mut self, attr: Fragment) -> Self {
        debug_assert!(attr.is_attribute());
        if let Fragment::Attribute { name, value } = attr {
            self.attributes.push((name, value));
        }
        self
    }

    /// Finish the tree. An element builder is wrapped in a document node.
    pub fn build(self) -> SimpleStore {
        let fragments = match self.name {
            Some(_) => vec![Fragment::from(self)],
            None => self.children,
        };
        // builder input never nests attributes below children; fall back to an empty document
        SimpleStore::from_fragments(fragments).unwrap_or_else(|_| SimpleStore::empty())
    }
}

impl From<NodeBuilder> for Fragment {
    fn from(b: NodeBuilder) -> Self {
        match b.name {
            Some(name) => Fragment::Element {
                name,
                attributes: b.attributes,
                children: b.children,
            },
            None => Fragment::Sequence(b.children),
        }
    }
}

pub fn doc() -> NodeBuilder {
    NodeBuilder {
        name: None,
        attributes: Vec::new(),
        children: Vec::new(),
    }
}

pub fn elem(name: &str) -> NodeBuilder {
    NodeBuilder {
        name: Some(QName::local(name)),
        attributes: Vec::new(),
        children: Vec::new(),
    }
}

/// Namespaced element; `qname` may carry a prefix (`p:local`).
pub fn elem_ns(uri: &str, qname: &str) -> NodeBuilder {
    NodeBuilder {
        name: Some(split_qname(uri, qname)),
        attributes: Vec::new(),
        children: Vec::new(),
    }
}

fn split_qname(uri: &str, qname: &str) -> QName {
    let (prefix, local) = match qname.split_once(':') {
        Some((p, l)) => (Some(p.to_string()), l.to_string()),
        None => (None, qname.to_string()),
    };
    QName {
        prefix,
        local,
        ns_uri: Some(uri.to_string()),
    }
}

pub fn text(v: &str) -> Fragment {
    Fragment::Text(v.to_string())
}

pub fn attr(name: &str, v: &str) -> Fragment {
    Fragment::Attribute {
        name: QName::local(name),
        value: v.to_string(),
    }
}

pub fn comment(v: &str) -> Fragment {
    Fragment::Comment(v.to_string())
}

pub fn pi(target: &str, data: &str) -> Fragment {
    Fragment::ProcessingInstruction {
        target: target.to_string(),
        value: data.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SimpleStore {
        doc()
            .child(
                elem("r")
                    .attr(attr("a", "1"))
                    .child(elem("x").child(text("one")))
                    .child(comment("c"))
                    .child(elem("y")),
            )
            .build()
    }

    #[test]
    fn attributes_precede_children() {
        let s = sample();
        let r = s.children(s.root())[0];
        let a = s.attributes(r)[0];
        let x = s.children(r)[0];
        assert_eq!(s.compare_order(a, x), Ordering::Less);
        assert_eq!(s.compare_order(r, a), Ordering::Less);
        assert_eq!(s.size(s.root()), 7);
    }

    #[test]
    fn updates_renumber_and_bump_version() {
        let mut s = sample();
        let r = s.children(s.root())[0];
        let y = s.children(r)[2];
        let v0 = s.version();
        s.insert_children(r, 0, &[elem("first").into()]).unwrap();
        let first = s.children(r)[0];
        assert_eq!(s.compare_order(first, y), Ordering::Less);
        assert!(s.version() > v0);
        s.delete(first).unwrap();
        assert!(!s.is_live(first));
        assert_eq!(s.to_xml(r), r#"<r a="1"><x>one</x><!--c--><y/></r>"#);
    }

    #[test]
    fn duplicate_attribute_is_rejected() {
        let mut s = sample();
        let r = s.children(s.root())[0];
        let err = s.insert_attributes(r, &[attr("a", "2")]).unwrap_err();
        assert!(err.is(ErrorCode::XUDY0021));
    }

    #[test]
    fn replace_content_and_rename() {
        let mut s = sample();
        let r = s.children(s.root())[0];
        let x = s.children(r)[0];
        s.replace_content(x, "two").unwrap();
        s.rename(x, QName::local("z")).unwrap();
        assert_eq!(s.to_xml(x), "<z>two</z>");
        assert_eq!(s.elements_named("z"), vec![x]);
    }
}
