//! Updating expressions and the pending update list.
//!
//! Evaluating an updating expression never touches storage. Each expression
//! validates its operands, copies its payload and appends primitives to the
//! [`UpdateCollector`] of the context. The caller applies the collected list
//! once evaluation has finished, so every read in a query observes the
//! pre-update state.
use crate::expr::{Expr, atomize, check_simple};
use crate::model::{Fragment, NodeId, NodeKind, QName, Storage, StorageMut};
use crate::runtime::{Error, ErrorCode, QueryContext};
use crate::xdm::{XdmAtomicValue, XdmItem};
use core::cmp::Ordering;

/// Position of inserted nodes relative to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InsertMode {
    #[default]
    Into,
    First,
    Last,
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub mode: InsertMode,
    pub source: Box<Expr>,
    pub target: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub target: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rename {
    pub target: Box<Expr>,
    pub name: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Replace {
    pub target: Box<Expr>,
    pub with: Box<Expr>,
    /// `replace value of node` instead of `replace node`.
    pub value_of: bool,
}

/// One primitive change to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    Insert(InsertMode, Vec<Fragment>),
    InsertAttributes(Vec<Fragment>),
    Delete,
    Rename(QName),
    ReplaceNode(Vec<Fragment>),
    /// New value of a text, attribute, comment or processing instruction.
    ReplaceValue(String),
    /// New text content of an element.
    ReplaceContent(String),
}

impl UpdateOp {
    /// Application order among primitives on the same target.
    fn rank(&self) -> u8 {
        match self {
            UpdateOp::Rename(_) | UpdateOp::ReplaceValue(_) | UpdateOp::ReplaceContent(_) => 0,
            UpdateOp::Insert(..) | UpdateOp::InsertAttributes(_) => 1,
            UpdateOp::ReplaceNode(_) => 2,
            UpdateOp::Delete => 3,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            UpdateOp::Insert(..) => "insert",
            UpdateOp::InsertAttributes(_) => "insert attributes",
            UpdateOp::Delete => "delete",
            UpdateOp::Rename(_) => "rename",
            UpdateOp::ReplaceNode(_) => "replace node",
            UpdateOp::ReplaceValue(_) | UpdateOp::ReplaceContent(_) => "replace value",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpdate {
    pub target: NodeId,
    pub op: UpdateOp,
}

/// Pending update list of one query.
#[derive(Debug, Default)]
pub struct UpdateCollector {
    updates: Vec<PendingUpdate>,
}

impl UpdateCollector {
    /// Append a primitive, rejecting a second rename or replacement of the same node.
    pub fn add(&mut self, update: PendingUpdate) -> Result<(), Error> {
        let code = match update.op {
            UpdateOp::Rename(_) => Some(ErrorCode::XUDY0015),
            UpdateOp::ReplaceNode(_) => Some(ErrorCode::XUDY0016),
            UpdateOp::ReplaceValue(_) | UpdateOp::ReplaceContent(_) => Some(ErrorCode::XUDY0017),
            _ => None,
        };
        if let Some(code) = code
            && self
                .updates
                .iter()
                .any(|u| u.target == update.target && conflicts(&u.op, &update.op))
        {
            return Err(Error::from_code(
                code,
                format!("node is the target of more than one {}", update.op.name()),
            ));
        }
        self.updates.push(update);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Drop everything collected after `mark`.
    pub fn truncate(&mut self, mark: usize) {
        self.updates.truncate(mark);
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingUpdate> {
        self.updates.iter()
    }

    /// Apply and drain all pending updates; returns the number of applied primitives.
    ///
    /// Primitives on nodes inside a deleted subtree are skipped. The rest is
    /// applied in reverse document order of the targets so that child
    /// positions computed during application stay valid.
    pub fn apply_all(&mut self, store: &mut dyn StorageMut) -> Result<usize, Error> {
        let mut updates = std::mem::take(&mut self.updates);
        let deleted: Vec<NodeId> = updates
            .iter()
            .filter(|u| u.op == UpdateOp::Delete)
            .map(|u| u.target)
            .collect();
        updates.retain(|u| {
            let inside = deleted.iter().any(|&d| store.is_ancestor(d, u.target));
            let on_deleted = deleted.contains(&u.target)
                && !matches!(
                    u.op,
                    UpdateOp::Delete
                        | UpdateOp::ReplaceNode(_)
                        | UpdateOp::Insert(InsertMode::Before | InsertMode::After, _)
                );
            !inside && !on_deleted
        });
        updates.sort_by(|a, b| match store.compare_order(b.target, a.target) {
            Ordering::Equal => a.op.rank().cmp(&b.op.rank()),
            o => o,
        });
        let mut applied = 0;
        let mut gone: Vec<NodeId> = Vec::new();
        for u in updates {
            if gone.contains(&u.target) {
                continue;
            }
            tracing::debug!(target_node = u.target.0, op = u.op.name(), "applying update");
            if apply_one(store, &u)? {
                gone.push(u.target);
            }
            applied += 1;
        }
        tracing::info!(applied, "updates applied");
        Ok(applied)
    }
}

fn conflicts(a: &UpdateOp, b: &UpdateOp) -> bool {
    matches!(
        (a, b),
        (UpdateOp::Rename(_), UpdateOp::Rename(_))
            | (UpdateOp::ReplaceNode(_), UpdateOp::ReplaceNode(_))
            | (
                UpdateOp::ReplaceValue(_) | UpdateOp::ReplaceContent(_),
                UpdateOp::ReplaceValue(_) | UpdateOp::ReplaceContent(_)
            )
    )
}

fn child_index(store: &dyn StorageMut, parent: NodeId, node: NodeId) -> Result<usize, Error> {
    store
        .children(parent)
        .iter()
        .position(|&c| c == node)
        .ok_or_else(|| Error::from_code(ErrorCode::XUDY0009, "target node is detached"))
}

fn parent_of(store: &dyn StorageMut, node: NodeId) -> Result<NodeId, Error> {
    store
        .parent(node)
        .ok_or_else(|| Error::from_code(ErrorCode::XUDY0009, "target node has no parent"))
}

/// Returns `true` if the target was removed from the tree.
fn apply_one(store: &mut dyn StorageMut, u: &PendingUpdate) -> Result<bool, Error> {
    let target = u.target;
    match &u.op {
        UpdateOp::Insert(mode, nodes) => {
            let (parent, index) = match mode {
                InsertMode::First => (target, 0),
                InsertMode::Into | InsertMode::Last => (target, store.children(target).len()),
                InsertMode::Before => {
                    let p = parent_of(store, target)?;
                    (p, child_index(store, p, target)?)
                }
                InsertMode::After => {
                    let p = parent_of(store, target)?;
                    (p, child_index(store, p, target)? + 1)
                }
            };
            store.insert_children(parent, index, nodes)?;
        }
        UpdateOp::InsertAttributes(attrs) => store.insert_attributes(target, attrs)?,
        UpdateOp::Delete => {
            store.delete(target)?;
            return Ok(true);
        }
        UpdateOp::Rename(name) => store.rename(target, name.clone())?,
        UpdateOp::ReplaceNode(nodes) => {
            let parent = parent_of(store, target)?;
            if store.kind(target) == NodeKind::Attribute {
                store.delete(target)?;
                store.insert_attributes(parent, nodes)?;
            } else {
                let index = child_index(store, parent, target)?;
                store.delete(target)?;
                store.insert_children(parent, index, nodes)?;
            }
            return Ok(true);
        }
        UpdateOp::ReplaceValue(v) => store.set_value(target, v)?,
        UpdateOp::ReplaceContent(v) => store.replace_content(target, v)?,
    }
    Ok(false)
}

/// Compile the operands of an updating expression; none of them may update.
fn compile_operand(e: &mut Box<Expr>, ctx: &mut QueryContext<'_>) -> Result<(), Error> {
    let compiled = std::mem::take(&mut **e).compile(ctx)?;
    check_simple(&compiled)?;
    **e = compiled;
    Ok(())
}

/// Targets known to be atomic values are rejected before evaluation.
fn check_literal_target(e: &Expr, code: ErrorCode, what: &str) -> Result<(), Error> {
    let atomic = match e {
        Expr::Literal(_) => true,
        Expr::Value(items) => items.iter().any(|i| !i.is_node()),
        _ => false,
    };
    if atomic {
        return Err(Error::from_code(code, format!("{what} target must be a node")));
    }
    Ok(())
}

/// Evaluate a target expression that must yield exactly one node.
fn single_target(
    e: &Expr,
    ctx: &mut QueryContext<'_>,
    code: ErrorCode,
    what: &str,
) -> Result<NodeId, Error> {
    let items = e.value(ctx)?;
    match items.as_slice() {
        [] => Err(Error::from_code(
            ErrorCode::XUDY0027,
            format!("{what} target is empty"),
        )),
        [XdmItem::Node(n)] => Ok(*n),
        _ => Err(Error::from_code(
            code,
            format!("{what} target must be a single node"),
        )),
    }
}

/// Copy the payload of `insert` or `replace node`. Adjacent atomic values
/// become one text node separated by spaces.
fn payload(items: Vec<XdmItem>, ctx: &QueryContext<'_>) -> Vec<Fragment> {
    let store = ctx.store();
    let mut out = Vec::with_capacity(items.len());
    let mut text: Option<String> = None;
    for item in items {
        match item {
            XdmItem::Node(n) => {
                if let Some(t) = text.take()
                    && !t.is_empty()
                {
                    out.push(Fragment::Text(t));
                }
                out.push(store.copy_fragment(n));
            }
            XdmItem::Atomic(a) => {
                let lexical = a.lexical();
                match &mut text {
                    Some(t) => {
                        t.push(' ');
                        t.push_str(&lexical);
                    }
                    None => text = Some(lexical),
                }
            }
        }
    }
    if let Some(t) = text
        && !t.is_empty()
    {
        out.push(Fragment::Text(t));
    }
    Fragment::flatten(out)
}

/// Split a payload into leading attributes and the remaining nodes.
fn split_attributes(nodes: Vec<Fragment>) -> Result<(Vec<Fragment>, Vec<Fragment>), Error> {
    let first_other = nodes.iter().position(|f| !f.is_attribute()).unwrap_or(nodes.len());
    if nodes[first_other..].iter().any(Fragment::is_attribute) {
        return Err(Error::from_code(
            ErrorCode::XUTY0013,
            "attributes must precede other nodes in the inserted sequence",
        ));
    }
    let mut attrs = nodes;
    let others = attrs.split_off(first_other);
    Ok((attrs, others))
}

impl Insert {
    pub fn new(mode: InsertMode, source: Expr, target: Expr) -> Self {
        Self {
            mode,
            source: Box::new(source),
            target: Box::new(target),
        }
    }

    pub(crate) fn compile(mut self, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
        compile_operand(&mut self.source, ctx)?;
        compile_operand(&mut self.target, ctx)?;
        let code = match self.mode {
            InsertMode::Before | InsertMode::After => ErrorCode::XUTY0006,
            _ => ErrorCode::XUTY0005,
        };
        check_literal_target(&self.target, code, "insert")?;
        Ok(Expr::Insert(self))
    }

    pub(crate) fn collect(&self, ctx: &mut QueryContext<'_>) -> Result<(), Error> {
        let items = self.source.value(ctx)?;
        let (attrs, others) = split_attributes(payload(items, ctx))?;
        let store = ctx.store();
        let sibling = matches!(self.mode, InsertMode::Before | InsertMode::After);
        let code = if sibling {
            ErrorCode::XUTY0006
        } else {
            ErrorCode::XUTY0005
        };
        let target = single_target(&self.target, ctx, code, "insert")?;
        let kind = store.kind(target);
        // element receiving inserted attributes
        let owner = if sibling {
            if matches!(kind, NodeKind::Attribute | NodeKind::Document) {
                return Err(Error::from_code(
                    code,
                    "insert before/after target must not be an attribute or document",
                ));
            }
            store.parent(target).ok_or_else(|| {
                Error::from_code(ErrorCode::XUDY0009, "insert before/after target has no parent")
            })?
        } else {
            if !matches!(kind, NodeKind::Element | NodeKind::Document) {
                return Err(Error::from_code(
                    code,
                    "insert target must be an element or document node",
                ));
            }
            target
        };
        if !attrs.is_empty() && store.kind(owner) != NodeKind::Element {
            return Err(Error::from_code(
                code,
                "attributes can only be inserted into elements",
            ));
        }
        let updates = ctx.updates_mut();
        if !attrs.is_empty() {
            updates.add(PendingUpdate {
                target: owner,
                op: UpdateOp::InsertAttributes(attrs),
            })?;
        }
        if !others.is_empty() {
            updates.add(PendingUpdate {
                target,
                op: UpdateOp::Insert(self.mode, others),
            })?;
        }
        Ok(())
    }
}

impl Delete {
    pub fn new(target: Expr) -> Self {
        Self {
            target: Box::new(target),
        }
    }

    pub(crate) fn compile(mut self, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
        compile_operand(&mut self.target, ctx)?;
        check_literal_target(&self.target, ErrorCode::XUTY0007, "delete")?;
        Ok(Expr::Delete(self))
    }

    pub(crate) fn collect(&self, ctx: &mut QueryContext<'_>) -> Result<(), Error> {
        let items = self.target.value(ctx)?;
        let mut nodes = Vec::with_capacity(items.len());
        for item in items {
            match item {
                XdmItem::Node(n) => nodes.push(n),
                XdmItem::Atomic(_) => {
                    return Err(Error::from_code(
                        ErrorCode::XUTY0007,
                        "delete target must be a sequence of nodes",
                    ));
                }
            }
        }
        let store = ctx.store();
        for n in nodes {
            // a node without parent cannot be detached
            if store.parent(n).is_none() {
                continue;
            }
            ctx.updates_mut().add(PendingUpdate {
                target: n,
                op: UpdateOp::Delete,
            })?;
        }
        Ok(())
    }
}

fn is_ncname(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || matches!(c, '-' | '.' | '_'))
}

/// Resolve the new name of a rename.
fn new_name(value: XdmAtomicValue, kind: NodeKind, ctx: &QueryContext<'_>) -> Result<QName, Error> {
    let name = match value {
        XdmAtomicValue::QName {
            ns_uri,
            prefix,
            local,
        } => {
            if let Some(p) = &prefix
                && let Some(bound) = ctx.resolve_prefix(p)
                && Some(bound) != ns_uri.as_deref()
            {
                return Err(Error::from_code(
                    ErrorCode::XUDY0023,
                    format!("prefix '{p}' is already bound to '{bound}'"),
                ));
            }
            QName {
                prefix,
                local,
                ns_uri,
            }
        }
        XdmAtomicValue::String(s) | XdmAtomicValue::UntypedAtomic(s) => {
            let s = s.trim();
            let (prefix, local) = match s.split_once(':') {
                Some((p, l)) => (Some(p), l),
                None => (None, s),
            };
            if !is_ncname(local) || prefix.is_some_and(|p| !is_ncname(p)) {
                return Err(Error::from_code(
                    ErrorCode::FOCA0002,
                    format!("'{s}' is not a valid name"),
                ));
            }
            let ns_uri = match prefix {
                Some(p) => Some(ctx.resolve_prefix(p).map(str::to_string).ok_or_else(|| {
                    Error::from_code(ErrorCode::FOCA0002, format!("prefix '{p}' is not declared"))
                })?),
                None => None,
            };
            QName {
                prefix: prefix.map(str::to_string),
                local: local.to_string(),
                ns_uri,
            }
        }
        other => {
            return Err(Error::type_err(format!(
                "new name must be a QName or string, found {}",
                other.atomic_type()
            )));
        }
    };
    if kind == NodeKind::ProcessingInstruction && (name.prefix.is_some() || name.ns_uri.is_some()) {
        return Err(Error::from_code(
            ErrorCode::FOCA0002,
            "processing-instruction target must not have a namespace",
        ));
    }
    Ok(name)
}

impl Rename {
    pub fn new(target: Expr, name: Expr) -> Self {
        Self {
            target: Box::new(target),
            name: Box::new(name),
        }
    }

    pub(crate) fn compile(mut self, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
        compile_operand(&mut self.target, ctx)?;
        compile_operand(&mut self.name, ctx)?;
        check_literal_target(&self.target, ErrorCode::XUTY0012, "rename")?;
        Ok(Expr::Rename(self))
    }

    pub(crate) fn collect(&self, ctx: &mut QueryContext<'_>) -> Result<(), Error> {
        let target = single_target(&self.target, ctx, ErrorCode::XUTY0012, "rename")?;
        let kind = ctx.store().kind(target);
        if !matches!(
            kind,
            NodeKind::Element | NodeKind::Attribute | NodeKind::ProcessingInstruction
        ) {
            return Err(Error::from_code(
                ErrorCode::XUTY0012,
                "rename target must be an element, attribute or processing instruction",
            ));
        }
        let value = self.name.atomic_one(ctx)?;
        let name = new_name(value, kind, ctx)?;
        ctx.updates_mut().add(PendingUpdate {
            target,
            op: UpdateOp::Rename(name),
        })
    }
}

impl Replace {
    pub fn new(target: Expr, with: Expr) -> Self {
        Self {
            target: Box::new(target),
            with: Box::new(with),
            value_of: false,
        }
    }

    pub fn value_of(target: Expr, with: Expr) -> Self {
        Self {
            value_of: true,
            ..Self::new(target, with)
        }
    }

    pub(crate) fn compile(mut self, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
        compile_operand(&mut self.target, ctx)?;
        compile_operand(&mut self.with, ctx)?;
        check_literal_target(&self.target, ErrorCode::XUTY0008, "replace")?;
        Ok(Expr::Replace(self))
    }

    pub(crate) fn collect(&self, ctx: &mut QueryContext<'_>) -> Result<(), Error> {
        let target = single_target(&self.target, ctx, ErrorCode::XUTY0008, "replace")?;
        let store = ctx.store();
        let kind = store.kind(target);
        if self.value_of {
            if kind == NodeKind::Document {
                return Err(Error::from_code(
                    ErrorCode::XUTY0008,
                    "cannot replace the value of a document node",
                ));
            }
            let items = self.with.value(ctx)?;
            let text = items
                .into_iter()
                .map(|i| atomize(ctx, i).lexical())
                .collect::<Vec<_>>()
                .join(" ");
            let op = if kind == NodeKind::Element {
                UpdateOp::ReplaceContent(text)
            } else {
                UpdateOp::ReplaceValue(text)
            };
            return ctx.updates_mut().add(PendingUpdate { target, op });
        }
        if kind == NodeKind::Document {
            return Err(Error::from_code(
                ErrorCode::XUTY0008,
                "cannot replace a document node",
            ));
        }
        if store.parent(target).is_none() {
            return Err(Error::from_code(
                ErrorCode::XUDY0009,
                "replace target has no parent",
            ));
        }
        let items = self.with.value(ctx)?;
        let nodes = payload(items, ctx);
        let attribute = kind == NodeKind::Attribute;
        if attribute && nodes.iter().any(|f| !f.is_attribute()) {
            return Err(Error::from_code(
                ErrorCode::XUTY0011,
                "an attribute can only be replaced by attributes",
            ));
        }
        if !attribute && nodes.iter().any(Fragment::is_attribute) {
            return Err(Error::from_code(
                ErrorCode::XUTY0010,
                "replacement of a non-attribute node must not contain attributes",
            ));
        }
        ctx.updates_mut().add(PendingUpdate {
            target,
            op: UpdateOp::ReplaceNode(nodes),
        })
    }
}

/// Applies the pending updates of `ctx` to `store`.
pub fn apply_updates(
    ctx: &mut QueryContext<'_>,
    store: &mut dyn StorageMut,
) -> Result<usize, Error> {
    ctx.take_updates().apply_all(store)
}
