//! Location paths, node tests and predicate filters.
use super::pos::Pos;
use super::{Expr, Flag, Occ, Shape, ShapeKind, atomic_ebv, check_simple};
use crate::model::{NodeId, NodeKind, Storage};
use crate::runtime::{Error, ErrorCode, Focus, QueryContext};
use crate::sequence::{self, Iter, sort_nodes};
use crate::xdm::{ExpandedName, XdmItem, XdmSequence};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Child,
    Descendant,
    DescendantOrSelf,
    Attribute,
    SelfAxis,
    Parent,
    Ancestor,
    AncestorOrSelf,
    FollowingSibling,
    PrecedingSibling,
    Following,
    Preceding,
}

impl Axis {
    /// Reverse axes number their positions from the context node outwards.
    pub fn is_reverse(self) -> bool {
        matches!(
            self,
            Axis::Parent
                | Axis::Ancestor
                | Axis::AncestorOrSelf
                | Axis::PrecedingSibling
                | Axis::Preceding
        )
    }

    pub fn principal(self) -> NodeKind {
        if self == Axis::Attribute {
            NodeKind::Attribute
        } else {
            NodeKind::Element
        }
    }

    /// Axis leading back from a node reached through `self`.
    pub fn invert(self) -> Option<Axis> {
        match self {
            Axis::Child | Axis::Attribute => Some(Axis::Parent),
            Axis::Descendant => Some(Axis::Ancestor),
            Axis::DescendantOrSelf => Some(Axis::AncestorOrSelf),
            Axis::SelfAxis => Some(Axis::SelfAxis),
            _ => None,
        }
    }

    /// Nodes on this axis in axis order.
    pub fn nodes(self, store: &dyn Storage, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        match self {
            Axis::Child => out.extend_from_slice(store.children(node)),
            Axis::Attribute => out.extend_from_slice(store.attributes(node)),
            Axis::SelfAxis => out.push(node),
            Axis::Parent => out.extend(store.parent(node)),
            Axis::Ancestor | Axis::AncestorOrSelf => {
                if self == Axis::AncestorOrSelf {
                    out.push(node);
                }
                let mut cur = store.parent(node);
                while let Some(p) = cur {
                    out.push(p);
                    cur = store.parent(p);
                }
            }
            Axis::Descendant => descendants(store, node, false, &mut out),
            Axis::DescendantOrSelf => descendants(store, node, true, &mut out),
            Axis::FollowingSibling | Axis::PrecedingSibling => {
                if store.kind(node) == NodeKind::Attribute {
                    return out;
                }
                let Some(parent) = store.parent(node) else {
                    return out;
                };
                let sibs = store.children(parent);
                if let Some(idx) = sibs.iter().position(|&s| s == node) {
                    if self == Axis::FollowingSibling {
                        out.extend_from_slice(&sibs[idx + 1..]);
                    } else {
                        out.extend(sibs[..idx].iter().rev());
                    }
                }
            }
            Axis::Following => {
                let mut cur = node;
                if store.kind(node) == NodeKind::Attribute
                    && let Some(p) = store.parent(node)
                {
                    descendants(store, p, false, &mut out);
                    cur = p;
                }
                loop {
                    for sib in Axis::FollowingSibling.nodes(store, cur) {
                        descendants(store, sib, true, &mut out);
                    }
                    match store.parent(cur) {
                        Some(p) => cur = p,
                        None => break,
                    }
                }
            }
            Axis::Preceding => {
                let mut cur = match store.kind(node) {
                    NodeKind::Attribute => store.parent(node).unwrap_or(node),
                    _ => node,
                };
                loop {
                    for sib in Axis::PrecedingSibling.nodes(store, cur) {
                        let mut sub = Vec::new();
                        descendants(store, sib, true, &mut sub);
                        out.extend(sub.into_iter().rev());
                    }
                    match store.parent(cur) {
                        Some(p) => cur = p,
                        None => break,
                    }
                }
            }
        }
        out
    }
}

fn descendants(store: &dyn Storage, node: NodeId, include_self: bool, out: &mut Vec<NodeId>) {
    if include_self {
        out.push(node);
    }
    let mut stack: Vec<NodeId> = store.children(node).iter().rev().copied().collect();
    while let Some(cur) = stack.pop() {
        out.push(cur);
        stack.extend(store.children(cur).iter().rev().copied());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeTest {
    /// Name test on the principal node kind of the axis.
    Name(ExpandedName),
    /// `*`
    Wildcard,
    /// `*:local`
    Local(String),
    /// `prefix:*`, resolved to the namespace URI.
    Namespace(String),
    /// `node()`
    AnyKind,
    Text,
    Comment,
    Pi(Option<String>),
    Document(Option<Box<NodeTest>>),
    Element(Option<ExpandedName>),
    Attribute(Option<ExpandedName>),
}

impl NodeTest {
    pub fn name(local: &str) -> Self {
        NodeTest::Name(ExpandedName::local(local))
    }

    /// Node kind this test restricts to, if any.
    pub fn kind(&self, principal: NodeKind) -> Option<NodeKind> {
        match self {
            NodeTest::Name(_) | NodeTest::Wildcard | NodeTest::Local(_) | NodeTest::Namespace(_) => {
                Some(principal)
            }
            NodeTest::AnyKind => None,
            NodeTest::Text => Some(NodeKind::Text),
            NodeTest::Comment => Some(NodeKind::Comment),
            NodeTest::Pi(_) => Some(NodeKind::ProcessingInstruction),
            NodeTest::Document(_) => Some(NodeKind::Document),
            NodeTest::Element(_) => Some(NodeKind::Element),
            NodeTest::Attribute(_) => Some(NodeKind::Attribute),
        }
    }

    /// The name this test requires, if it is an exact name test.
    pub fn exact_name(&self) -> Option<&ExpandedName> {
        match self {
            NodeTest::Name(n) | NodeTest::Element(Some(n)) | NodeTest::Attribute(Some(n)) => {
                Some(n)
            }
            _ => None,
        }
    }

    pub fn matches(&self, store: &dyn Storage, node: NodeId, principal: NodeKind) -> bool {
        let kind = store.kind(node);
        if let Some(k) = self.kind(principal)
            && k != kind
        {
            return false;
        }
        let name = || store.name_of(node);
        match self {
            NodeTest::Name(q) | NodeTest::Element(Some(q)) | NodeTest::Attribute(Some(q)) => {
                name().is_some_and(|n| n.matches(q))
            }
            NodeTest::Local(l) => name().is_some_and(|n| &n.local == l),
            NodeTest::Namespace(uri) => name().is_some_and(|n| n.ns_uri.as_deref() == Some(uri)),
            NodeTest::Pi(Some(target)) => name().is_some_and(|n| &n.local == target),
            NodeTest::Document(Some(inner)) => store
                .children(node)
                .iter()
                .any(|&c| inner.matches(store, c, NodeKind::Element)),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub axis: Axis,
    pub test: NodeTest,
    pub preds: Vec<Expr>,
}

impl Step {
    pub fn new(axis: Axis, test: NodeTest) -> Self {
        Self {
            axis,
            test,
            preds: Vec::new(),
        }
    }

    pub fn child(name: &str) -> Self {
        Self::new(Axis::Child, NodeTest::name(name))
    }

    pub fn attr(name: &str) -> Self {
        Self::new(Axis::Attribute, NodeTest::name(name))
    }

    pub fn descendant(name: &str) -> Self {
        Self::new(Axis::Descendant, NodeTest::name(name))
    }

    pub fn text() -> Self {
        Self::new(Axis::Child, NodeTest::Text)
    }

    pub fn pred(mut self, pred: Expr) -> Self {
        self.preds.push(pred);
        self
    }

    /// `true` if a predicate reads the context position or size.
    pub fn positional(&self) -> bool {
        self.preds.iter().any(is_positional)
    }

    fn matching(&self, store: &dyn Storage, node: NodeId) -> Vec<XdmItem> {
        let principal = self.axis.principal();
        self.axis
            .nodes(store, node)
            .into_iter()
            .filter(|&n| self.test.matches(store, n, principal))
            .map(XdmItem::Node)
            .collect()
    }
}

/// A predicate that depends on the position of the item it filters.
pub(crate) fn is_positional(pred: &Expr) -> bool {
    matches!(pred, Expr::Pos(_))
        || pred.has(Flag::Pos)
        || pred.has(Flag::Last)
        || matches!(pred.shape().kind, ShapeKind::Numeric | ShapeKind::Item | ShapeKind::Atomic)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    /// `None` for paths relative to the context node.
    pub input: Option<Box<Expr>>,
    pub steps: Vec<Step>,
}

impl Path {
    pub fn new(input: Option<Expr>, steps: Vec<Step>) -> Self {
        Self {
            input: input.map(Box::new),
            steps,
        }
    }

    pub fn relative(steps: Vec<Step>) -> Self {
        Self::new(None, steps)
    }

    /// Path starting at the root of the context node's tree.
    pub fn absolute(steps: Vec<Step>) -> Self {
        Self::new(Some(Expr::Root), steps)
    }

    pub fn is_absolute(&self) -> bool {
        matches!(self.input.as_deref(), Some(Expr::Root))
    }

    pub(crate) fn compile(mut self, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
        if let Some(input) = self.input.take() {
            let input = input.compile(ctx)?;
            check_simple(&input)?;
            if input.is_empty_value() {
                return Ok(Expr::empty());
            }
            self.input = Some(Box::new(input));
        }
        for step in &mut self.steps {
            let preds = std::mem::take(&mut step.preds);
            match compile_preds(preds, ctx)? {
                Some(p) => step.preds = p,
                None => return Ok(Expr::empty()),
            }
        }
        if self.steps.is_empty() {
            return Ok(self.input.map_or(Expr::Context, |i| *i));
        }
        crate::optimize::rewrite_path(self, ctx)
    }

    pub(crate) fn iter<'e>(&'e self, ctx: &mut QueryContext<'_>) -> Result<Iter<'e>, Error> {
        let store = ctx.store();
        let mut current: Vec<NodeId> = match &self.input {
            None => vec![ctx.context_node()?],
            Some(input) => input
                .value(ctx)?
                .into_iter()
                .map(|item| match item {
                    XdmItem::Node(n) => Ok(n),
                    XdmItem::Atomic(_) => Err(Error::from_code(
                        ErrorCode::XPTY0019,
                        "path step applied to an atomic value",
                    )),
                })
                .collect::<Result<_, _>>()?,
        };
        for step in &self.steps {
            let mut next = Vec::new();
            for &node in &current {
                ctx.checkpoint()?;
                let hits = apply_preds(ctx, step.matching(store, node), &step.preds)?;
                next.extend(hits.into_iter().filter_map(|i| i.as_node()));
            }
            sort_nodes(ctx, &mut next);
            current = next;
        }
        Ok(sequence::value(
            current.into_iter().map(XdmItem::Node).collect::<Vec<_>>(),
        ))
    }

    pub fn shape(&self) -> Shape {
        let input_single = self
            .input
            .as_ref()
            .is_none_or(|i| i.shape().occ.max_one());
        let each_single = self.steps.iter().all(|s| match s.axis {
            Axis::Attribute => s.test.exact_name().is_some(),
            Axis::SelfAxis | Axis::Parent => true,
            _ => false,
        });
        let occ = if input_single && each_single {
            Occ::ZeroOrOne
        } else {
            Occ::ZeroOrMore
        };
        Shape::new(ShapeKind::Node, occ)
    }
}

/// `input[pred]...`
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub input: Box<Expr>,
    pub preds: Vec<Expr>,
}

impl Filter {
    pub fn new(input: Expr, preds: Vec<Expr>) -> Self {
        Self {
            input: Box::new(input),
            preds,
        }
    }

    pub(crate) fn compile(self, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
        let input = self.input.compile(ctx)?;
        check_simple(&input)?;
        if input.is_empty_value() {
            return Ok(Expr::empty());
        }
        let Some(preds) = compile_preds(self.preds, ctx)? else {
            return Ok(Expr::empty());
        };
        if preds.is_empty() {
            return Ok(input);
        }
        Ok(Expr::Filter(Filter {
            input: Box::new(input),
            preds,
        }))
    }

    pub(crate) fn iter<'e>(&'e self, ctx: &mut QueryContext<'_>) -> Result<Iter<'e>, Error> {
        let mut it = self.input.iter(ctx)?;
        let mut preds = self.preds.as_slice();
        let items = if let Some(Expr::Pos(p)) = preds.first() {
            preds = &preds[1..];
            let mut items = Vec::new();
            if let Some(n) = it.size() {
                for i in p.min()..=p.max().min(n) {
                    items.extend(it.get(i - 1));
                }
            } else {
                let mut pos = 0usize;
                while let Some(item) = it.next(ctx)? {
                    pos += 1;
                    if pos > p.max() {
                        break;
                    }
                    if pos >= p.min() {
                        items.push(item);
                    }
                }
            }
            items
        } else {
            sequence::collect(it, ctx)?
        };
        Ok(sequence::value(apply_preds(ctx, items, preds)?))
    }

    pub fn shape(&self) -> Shape {
        let input = self.input.shape();
        let occ = match self.preds.first() {
            _ if input.occ == Occ::Zero => Occ::Zero,
            _ if input.occ.max_one() => Occ::ZeroOrOne,
            Some(Expr::Pos(p)) if p.is_single() => Occ::ZeroOrOne,
            _ => Occ::ZeroOrMore,
        };
        Shape::new(input.kind, occ)
    }
}

/// Compile predicates in their own focus. `None` if a predicate is statically false.
fn compile_preds(preds: Vec<Expr>, ctx: &mut QueryContext<'_>) -> Result<Option<Vec<Expr>>, Error> {
    let mut out = Vec::with_capacity(preds.len());
    for pred in preds {
        let pred = pred.compile(ctx)?;
        check_simple(&pred)?;
        let pred = match pred {
            Expr::Literal(a) if a.is_numeric() => match a.as_f64() {
                Some(v) => Pos::from_cmp(super::CmpOp::Eq, v).unwrap_or_else(|| Expr::boolean(false)),
                None => Expr::Literal(a),
            },
            other => other,
        };
        match &pred {
            Expr::Value(v) if v.is_empty() => return Ok(None),
            Expr::Literal(a) if !a.is_numeric() => {
                if atomic_ebv(a)? {
                    continue;
                }
                return Ok(None);
            }
            Expr::Pos(p) if p.min() == 1 && p.max() == Pos::OPEN => continue,
            _ => {}
        }
        out.push(pred);
    }
    Ok(Some(out))
}

/// Filter `items` through each predicate in turn.
pub(crate) fn apply_preds(
    ctx: &mut QueryContext<'_>,
    mut items: XdmSequence,
    preds: &[Expr],
) -> Result<XdmSequence, Error> {
    for pred in preds {
        if items.is_empty() {
            break;
        }
        if let Expr::Pos(p) = pred {
            let lo = p.min().saturating_sub(1);
            let hi = p.max().min(items.len());
            items = if lo < hi { items.drain(lo..hi).collect() } else { Vec::new() };
            continue;
        }
        let size = items.len();
        let mut kept = Vec::with_capacity(size);
        for (i, item) in items.into_iter().enumerate() {
            ctx.checkpoint()?;
            let keep = {
                let mut scope = ctx.focus_scope(Focus::new(item.clone(), i + 1, size));
                predicate_matches(pred, &mut scope)?
            };
            if keep {
                kept.push(item);
            }
        }
        items = kept;
    }
    Ok(items)
}

/// Truth value of a predicate: numbers select a position, everything else
/// uses the effective boolean value.
fn predicate_matches(pred: &Expr, ctx: &mut QueryContext<'_>) -> Result<bool, Error> {
    if matches!(pred, Expr::Pos(_)) || pred.shape().kind == ShapeKind::Boolean {
        return pred.ebv(ctx);
    }
    let mut it = pred.iter(ctx)?;
    let Some(first) = it.next(ctx)? else {
        return Ok(false);
    };
    match first {
        XdmItem::Node(_) => Ok(true),
        XdmItem::Atomic(a) => {
            if it.next(ctx)?.is_some() {
                return Err(Error::from_code(
                    ErrorCode::FORG0006,
                    "predicate evaluates to several atomic values",
                ));
            }
            match a.as_f64() {
                Some(v) => Ok(v == ctx.focus().pos as f64),
                None => atomic_ebv(&a),
            }
        }
    }
}
