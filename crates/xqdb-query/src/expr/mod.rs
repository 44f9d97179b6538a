//! Expression tree: one closed sum type with compile and evaluate dispatch.
//!
//! Every operator family lives in its own submodule and contributes the
//! payload struct of its variant, its compile-time rewrites and its
//! evaluator. This module holds the shared static analysis used by the
//! optimizer (`has`, `uses_var`, `removable`, `remove_var`, `shape`).
pub mod arith;
pub mod compare;
pub mod flwor;
pub mod logic;
pub mod order;
pub mod path;
pub mod pos;
pub mod range;
pub mod set;
pub mod types;
pub mod window;

use crate::ft::FTContains;
use crate::ft::scoring::Scoring;
use crate::functions::FnCall;
use crate::index::IndexQuery;
use crate::model::NodeKind;
use crate::runtime::{Error, ErrorCode, QueryContext};
use crate::sequence::{self, Iter};
use crate::update::{Delete, Insert, Rename, Replace};
use crate::xdm::{AtomicType, ExpandedName, XdmAtomicValue, XdmItem, XdmSequence};
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

pub use arith::{Arith, Calc};
pub use compare::{CmpG, CmpN, CmpOp, CmpV, NodeOp};
pub use flwor::{Clause, Flwor, GroupSpec, OrderKey, Quantified};
pub use logic::{Catch, CatchCode, ErrVars, If, Try};
pub use path::{Axis, Filter, NodeTest, Path, Step};
pub use pos::Pos;
pub use range::{CmpR, CmpSR};
pub use types::{Cast, Instance, ItemType, Occ, SeqType, Treat, TypeCase, TypeSwitch};
pub use window::{Window, WindowCond, WindowVars};

static NEXT_VAR: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(pub u32);

/// A variable declaration. Identity is the id, so two variables with the
/// same name never alias.
#[derive(Debug, Clone)]
pub struct Var {
    pub id: VarId,
    pub name: ExpandedName,
    pub declared: Option<SeqType>,
}

impl Var {
    pub fn new(name: &str) -> Self {
        Self {
            id: VarId(NEXT_VAR.fetch_add(1, AtomicOrdering::Relaxed)),
            name: ExpandedName::local(name),
            declared: None,
        }
    }

    pub fn typed(name: &str, ty: SeqType) -> Self {
        Self {
            declared: Some(ty),
            ..Self::new(name)
        }
    }
}

impl PartialEq for Var {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Static properties queried by the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    /// Reads the context position.
    Pos,
    /// Reads the context size.
    Last,
    /// Reads the context item.
    Ctx,
    /// Produces pending updates.
    Upd,
    /// Non-deterministic or raising; never folded or removed.
    Ndt,
}

/// How a child expression is evaluated relative to its parent's focus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Same focus as the parent.
    Plain,
    /// Evaluated once per item with a new focus (predicates, later path steps).
    Focus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeKind {
    Item,
    Node,
    Boolean,
    Numeric,
    String,
    Atomic,
}

/// Static result classification: item kind and cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    pub kind: ShapeKind,
    pub occ: Occ,
}

impl Shape {
    pub const fn new(kind: ShapeKind, occ: Occ) -> Self {
        Self { kind, occ }
    }

    pub const fn one(kind: ShapeKind) -> Self {
        Self::new(kind, Occ::One)
    }

    pub fn is_single(&self) -> bool {
        self.occ == Occ::One
    }

    pub fn at_most_one(&self) -> bool {
        self.occ.max_one()
    }

    fn of_atomic(a: &XdmAtomicValue) -> ShapeKind {
        match a {
            XdmAtomicValue::Boolean(_) => ShapeKind::Boolean,
            v if v.is_numeric() => ShapeKind::Numeric,
            XdmAtomicValue::String(_) => ShapeKind::String,
            _ => ShapeKind::Atomic,
        }
    }

    fn of_item(item: &XdmItem) -> ShapeKind {
        match item {
            XdmItem::Node(_) => ShapeKind::Node,
            XdmItem::Atomic(a) => Self::of_atomic(a),
        }
    }

    /// Shape of either of two alternatives.
    pub fn either(self, other: Shape) -> Shape {
        let kind = if self.kind == other.kind {
            self.kind
        } else if self.occ == Occ::Zero {
            other.kind
        } else if other.occ == Occ::Zero {
            self.kind
        } else {
            ShapeKind::Item
        };
        Shape::new(kind, self.occ.union(other.occ))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `.`
    Context,
    /// Root of the tree containing the context node (`/`).
    Root,
    Literal(XdmAtomicValue),
    /// Pre-computed sequence; `Value(vec![])` is the empty sequence.
    Value(XdmSequence),
    VarRef(Var),
    /// Context position test synthesized from `position()` comparisons.
    Pos(Pos),
    IndexAccess(IndexQuery),
    /// Unary minus.
    Neg(Box<Expr>),
    Arith(Arith),
    CmpG(CmpG),
    CmpV(CmpV),
    CmpN(CmpN),
    CmpR(CmpR),
    CmpSR(CmpSR),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Union(Vec<Expr>),
    Intersect(Vec<Expr>),
    Except(Vec<Expr>),
    /// Sequence constructor `(a, b, ...)`.
    List(Vec<Expr>),
    /// `a to b`
    Range(Box<Expr>, Box<Expr>),
    Path(Path),
    Filter(Filter),
    Call(FnCall),
    Cast(Cast),
    Castable(Cast),
    Treat(Treat),
    Instance(Instance),
    Flwor(Flwor),
    Quantified(Quantified),
    If(If),
    TypeSwitch(TypeSwitch),
    Try(Try),
    FTContains(FTContains),
    Insert(Insert),
    Delete(Delete),
    Rename(Rename),
    Replace(Replace),
}

impl Default for Expr {
    fn default() -> Self {
        Expr::empty()
    }
}

impl From<XdmAtomicValue> for Expr {
    fn from(v: XdmAtomicValue) -> Self {
        Expr::Literal(v)
    }
}

impl Expr {
    pub fn empty() -> Self {
        Expr::Value(Vec::new())
    }

    pub fn int(i: i64) -> Self {
        Expr::Literal(XdmAtomicValue::Integer(i))
    }

    pub fn double(d: f64) -> Self {
        Expr::Literal(XdmAtomicValue::Double(d))
    }

    pub fn string(s: &str) -> Self {
        Expr::Literal(XdmAtomicValue::String(s.to_string()))
    }

    pub fn boolean(b: bool) -> Self {
        Expr::Literal(XdmAtomicValue::Boolean(b))
    }

    pub fn var(v: &Var) -> Self {
        Expr::VarRef(v.clone())
    }

    /// Sequence constructor.
    pub fn seq(items: Vec<Expr>) -> Self {
        Expr::List(items)
    }

    pub fn ints(values: &[i64]) -> Self {
        Expr::List(values.iter().map(|v| Expr::int(*v)).collect())
    }

    pub fn range(from: Expr, to: Expr) -> Self {
        Expr::Range(Box::new(from), Box::new(to))
    }

    /// Wrap an evaluated sequence as a constant.
    pub fn from_seq(mut seq: XdmSequence) -> Self {
        if seq.len() == 1
            && !seq[0].is_node()
            && let Some(XdmItem::Atomic(a)) = seq.pop()
        {
            return Expr::Literal(a);
        }
        Expr::Value(seq)
    }

    /// `true` for literals and pre-computed sequences.
    pub fn is_value(&self) -> bool {
        matches!(self, Expr::Literal(_) | Expr::Value(_))
    }

    pub fn is_empty_value(&self) -> bool {
        matches!(self, Expr::Value(v) if v.is_empty())
    }

    pub fn as_bool_literal(&self) -> Option<bool> {
        match self {
            Expr::Literal(XdmAtomicValue::Boolean(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn is_updating(&self) -> bool {
        self.has(Flag::Upd)
    }

    /// Child expressions with the focus they are evaluated in.
    pub fn children(&self) -> Vec<(Role, &Expr)> {
        use Role::*;
        let mut out: Vec<(Role, &Expr)> = Vec::new();
        match self {
            Expr::Context
            | Expr::Root
            | Expr::Literal(_)
            | Expr::Value(_)
            | Expr::VarRef(_)
            | Expr::Pos(_)
            | Expr::IndexAccess(_) => {}
            Expr::Neg(e) => out.push((Plain, e)),
            Expr::Arith(a) => {
                out.push((Plain, &a.lhs));
                out.push((Plain, &a.rhs));
            }
            Expr::CmpG(c) => {
                out.push((Plain, &c.lhs));
                out.push((Plain, &c.rhs));
            }
            Expr::CmpV(c) => {
                out.push((Plain, &c.lhs));
                out.push((Plain, &c.rhs));
            }
            Expr::CmpN(c) => {
                out.push((Plain, &c.lhs));
                out.push((Plain, &c.rhs));
            }
            Expr::CmpR(c) => out.push((Plain, &c.expr)),
            Expr::CmpSR(c) => out.push((Plain, &c.expr)),
            Expr::And(v)
            | Expr::Or(v)
            | Expr::Union(v)
            | Expr::Intersect(v)
            | Expr::Except(v)
            | Expr::List(v) => out.extend(v.iter().map(|e| (Plain, e))),
            Expr::Range(a, b) => {
                out.push((Plain, a));
                out.push((Plain, b));
            }
            Expr::Path(p) => {
                if let Some(i) = &p.input {
                    out.push((Plain, i));
                }
                for s in &p.steps {
                    out.extend(s.preds.iter().map(|e| (Focus, e)));
                }
            }
            Expr::Filter(f) => {
                out.push((Plain, &f.input));
                out.extend(f.preds.iter().map(|e| (Focus, e)));
            }
            Expr::Call(f) => out.extend(f.args.iter().map(|e| (Plain, e))),
            Expr::Cast(c) | Expr::Castable(c) => out.push((Plain, &c.expr)),
            Expr::Treat(t) => out.push((Plain, &t.expr)),
            Expr::Instance(i) => out.push((Plain, &i.expr)),
            Expr::Flwor(f) => {
                for c in &f.clauses {
                    out.extend(c.exprs().into_iter().map(|e| (Plain, e)));
                }
                out.push((Plain, &f.ret));
            }
            Expr::Quantified(q) => {
                out.extend(q.bindings.iter().map(|(_, e)| (Plain, e)));
                out.push((Plain, &q.satisfies));
            }
            Expr::If(i) => {
                out.push((Plain, &i.cond));
                out.push((Plain, &i.then));
                out.push((Plain, &i.els));
            }
            Expr::TypeSwitch(t) => {
                out.push((Plain, &t.operand));
                out.extend(t.cases.iter().map(|c| (Plain, &c.ret)));
                out.push((Plain, &t.default.ret));
            }
            Expr::Try(t) => {
                out.push((Plain, &t.body));
                out.extend(t.catches.iter().map(|c| (Plain, &c.body)));
            }
            Expr::FTContains(f) => {
                out.push((Plain, &f.input));
                out.extend(f.ft.exprs().into_iter().map(|e| (Plain, e)));
            }
            Expr::Insert(i) => {
                out.push((Plain, &i.source));
                out.push((Plain, &i.target));
            }
            Expr::Delete(d) => out.push((Plain, &d.target)),
            Expr::Rename(r) => {
                out.push((Plain, &r.target));
                out.push((Plain, &r.name));
            }
            Expr::Replace(r) => {
                out.push((Plain, &r.target));
                out.push((Plain, &r.with));
            }
        }
        out
    }

    /// Mutable counterpart of [`children`](Self::children).
    pub fn children_mut(&mut self) -> Vec<(Role, &mut Expr)> {
        use Role::*;
        let mut out: Vec<(Role, &mut Expr)> = Vec::new();
        match self {
            Expr::Context
            | Expr::Root
            | Expr::Literal(_)
            | Expr::Value(_)
            | Expr::VarRef(_)
            | Expr::Pos(_)
            | Expr::IndexAccess(_) => {}
            Expr::Neg(e) => out.push((Plain, &mut **e)),
            Expr::Arith(a) => {
                out.push((Plain, &mut *a.lhs));
                out.push((Plain, &mut *a.rhs));
            }
            Expr::CmpG(c) => {
                out.push((Plain, &mut *c.lhs));
                out.push((Plain, &mut *c.rhs));
            }
            Expr::CmpV(c) => {
                out.push((Plain, &mut *c.lhs));
                out.push((Plain, &mut *c.rhs));
            }
            Expr::CmpN(c) => {
                out.push((Plain, &mut *c.lhs));
                out.push((Plain, &mut *c.rhs));
            }
            Expr::CmpR(c) => out.push((Plain, &mut *c.expr)),
            Expr::CmpSR(c) => out.push((Plain, &mut *c.expr)),
            Expr::And(v)
            | Expr::Or(v)
            | Expr::Union(v)
            | Expr::Intersect(v)
            | Expr::Except(v)
            | Expr::List(v) => out.extend(v.iter_mut().map(|e| (Plain, e))),
            Expr::Range(a, b) => {
                out.push((Plain, &mut **a));
                out.push((Plain, &mut **b));
            }
            Expr::Path(p) => {
                if let Some(i) = &mut p.input {
                    out.push((Plain, &mut **i));
                }
                for s in &mut p.steps {
                    out.extend(s.preds.iter_mut().map(|e| (Focus, e)));
                }
            }
            Expr::Filter(f) => {
                out.push((Plain, &mut *f.input));
                out.extend(f.preds.iter_mut().map(|e| (Focus, e)));
            }
            Expr::Call(f) => out.extend(f.args.iter_mut().map(|e| (Plain, e))),
            Expr::Cast(c) | Expr::Castable(c) => out.push((Plain, &mut *c.expr)),
            Expr::Treat(t) => out.push((Plain, &mut *t.expr)),
            Expr::Instance(i) => out.push((Plain, &mut *i.expr)),
            Expr::Flwor(f) => {
                for c in &mut f.clauses {
                    out.extend(c.exprs_mut().into_iter().map(|e| (Plain, e)));
                }
                out.push((Plain, &mut *f.ret));
            }
            Expr::Quantified(q) => {
                out.extend(q.bindings.iter_mut().map(|(_, e)| (Plain, e)));
                out.push((Plain, &mut *q.satisfies));
            }
            Expr::If(i) => {
                out.push((Plain, &mut *i.cond));
                out.push((Plain, &mut *i.then));
                out.push((Plain, &mut *i.els));
            }
            Expr::TypeSwitch(t) => {
                out.push((Plain, &mut *t.operand));
                out.extend(t.cases.iter_mut().map(|c| (Plain, &mut c.ret)));
                out.push((Plain, &mut t.default.ret));
            }
            Expr::Try(t) => {
                out.push((Plain, &mut *t.body));
                out.extend(t.catches.iter_mut().map(|c| (Plain, &mut c.body)));
            }
            Expr::FTContains(f) => {
                out.push((Plain, &mut *f.input));
                out.extend(f.ft.exprs_mut().into_iter().map(|e| (Plain, e)));
            }
            Expr::Insert(i) => {
                out.push((Plain, &mut *i.source));
                out.push((Plain, &mut *i.target));
            }
            Expr::Delete(d) => out.push((Plain, &mut *d.target)),
            Expr::Rename(r) => {
                out.push((Plain, &mut *r.target));
                out.push((Plain, &mut *r.name));
            }
            Expr::Replace(r) => {
                out.push((Plain, &mut *r.target));
                out.push((Plain, &mut *r.with));
            }
        }
        out
    }

    /// Whether this expression, or a child evaluated in the same focus, has `flag`.
    pub fn has(&self, flag: Flag) -> bool {
        let own = match self {
            Expr::Context | Expr::Root => flag == Flag::Ctx,
            Expr::Pos(_) => matches!(flag, Flag::Pos | Flag::Ctx),
            Expr::Path(p) => p.input.is_none() && flag == Flag::Ctx,
            Expr::Call(f) => f.func.has(flag, f.args.len()),
            Expr::Insert(_) | Expr::Delete(_) | Expr::Rename(_) | Expr::Replace(_) => {
                flag == Flag::Upd
            }
            _ => false,
        };
        own || self.children().into_iter().any(|(role, c)| match role {
            Role::Plain => c.has(flag),
            // a new focus hides the focus flags of the child
            Role::Focus => matches!(flag, Flag::Upd | Flag::Ndt) && c.has(flag),
        })
    }

    /// `true` if the expression depends on the focus in any way.
    pub fn uses_focus(&self) -> bool {
        self.has(Flag::Ctx) || self.has(Flag::Pos) || self.has(Flag::Last)
    }

    pub fn uses_var(&self, var: &Var) -> bool {
        match self {
            Expr::VarRef(v) => v.id == var.id,
            Expr::Flwor(f) if f.refs_var(var) => true,
            _ => self.children().into_iter().any(|(_, c)| c.uses_var(var)),
        }
    }

    /// `true` if every reference to `var` can be replaced by the context item.
    pub fn removable(&self, var: &Var) -> bool {
        if let Expr::Flwor(f) = self
            && f.refs_var(var)
        {
            return false;
        }
        self.children().into_iter().all(|(role, c)| match role {
            Role::Plain => c.removable(var),
            Role::Focus => !c.uses_var(var),
        })
    }

    /// Replace every reference to `var` with the context item.
    pub fn remove_var(&mut self, var: &Var) {
        if let Expr::VarRef(v) = self
            && v.id == var.id
        {
            *self = Expr::Context;
            return;
        }
        for (_, c) in self.children_mut() {
            c.remove_var(var);
        }
    }

    /// Substitute `value` for every reference to `var`.
    pub fn inline(&mut self, var: &Var, value: &Expr) {
        if let Expr::VarRef(v) = self
            && v.id == var.id
        {
            *self = value.clone();
            return;
        }
        for (_, c) in self.children_mut() {
            c.inline(var, value);
        }
    }

    /// Number of nodes in the expression tree.
    pub fn expr_size(&self) -> usize {
        1 + self
            .children()
            .into_iter()
            .map(|(_, c)| c.expr_size())
            .sum::<usize>()
    }

    pub fn shape(&self) -> Shape {
        use ShapeKind as K;
        match self {
            Expr::Context => Shape::one(K::Item),
            Expr::Root => Shape::one(K::Node),
            Expr::Literal(a) => Shape::one(Shape::of_atomic(a)),
            Expr::Value(v) => match v.len() {
                0 => Shape::new(K::Item, Occ::Zero),
                1 => Shape::one(Shape::of_item(&v[0])),
                _ => {
                    let kind = if v.iter().all(XdmItem::is_node) {
                        K::Node
                    } else {
                        K::Item
                    };
                    Shape::new(kind, Occ::OneOrMore)
                }
            },
            Expr::VarRef(v) => v
                .declared
                .as_ref()
                .map_or(Shape::new(K::Item, Occ::ZeroOrMore), SeqType::shape),
            Expr::Pos(_)
            | Expr::CmpG(_)
            | Expr::And(_)
            | Expr::Or(_)
            | Expr::Quantified(_)
            | Expr::Instance(_)
            | Expr::Castable(_)
            | Expr::FTContains(_) => Shape::one(K::Boolean),
            Expr::CmpR(c) => Shape::new(K::Boolean, if c.single { Occ::ZeroOrOne } else { Occ::One }),
            Expr::CmpSR(c) => Shape::new(K::Boolean, if c.single { Occ::ZeroOrOne } else { Occ::One }),
            Expr::CmpV(c) => Shape::new(K::Boolean, binary_occ(&c.lhs, &c.rhs)),
            Expr::CmpN(c) => Shape::new(K::Boolean, binary_occ(&c.lhs, &c.rhs)),
            Expr::IndexAccess(_)
            | Expr::Union(_)
            | Expr::Intersect(_)
            | Expr::Except(_) => Shape::new(K::Node, Occ::ZeroOrMore),
            Expr::Neg(e) => Shape::new(K::Numeric, e.shape().occ.single_or_empty()),
            Expr::Arith(a) => a.shape(),
            Expr::List(v) => {
                let mut iter = v.iter().map(Expr::shape);
                match iter.next() {
                    None => Shape::new(K::Item, Occ::Zero),
                    Some(first) => iter.fold(first, |acc, s| {
                        let kind = if acc.occ == Occ::Zero {
                            s.kind
                        } else if s.occ == Occ::Zero || acc.kind == s.kind {
                            acc.kind
                        } else {
                            K::Item
                        };
                        Shape::new(kind, acc.occ.concat(s.occ))
                    }),
                }
            }
            Expr::Range(_, _) => Shape::new(K::Numeric, Occ::ZeroOrMore),
            Expr::Path(p) => p.shape(),
            Expr::Filter(f) => f.shape(),
            Expr::Call(f) => f.shape(),
            Expr::Cast(c) => c.shape(),
            Expr::Treat(t) => t.ty.shape(),
            Expr::Flwor(f) => Shape::new(f.ret.shape().kind, Occ::ZeroOrMore),
            Expr::If(i) => i.then.shape().either(i.els.shape()),
            Expr::TypeSwitch(t) => t
                .cases
                .iter()
                .fold(t.default.ret.shape(), |acc, c| acc.either(c.ret.shape())),
            Expr::Try(t) => t
                .catches
                .iter()
                .fold(t.body.shape(), |acc, c| acc.either(c.body.shape())),
            Expr::Insert(_) | Expr::Delete(_) | Expr::Rename(_) | Expr::Replace(_) => {
                Shape::new(K::Item, Occ::Zero)
            }
        }
    }

    /// `true` if the result is known to be nodes in document order without duplicates.
    pub fn ddo(&self) -> bool {
        match self {
            Expr::Root | Expr::Path(_) | Expr::IndexAccess(_) => true,
            Expr::Union(_) | Expr::Intersect(_) | Expr::Except(_) => true,
            Expr::Filter(f) => f.input.ddo(),
            Expr::Value(v) => v.is_empty(),
            _ => false,
        }
    }

    /// Compile bottom-up and return an equivalent, possibly cheaper expression.
    /// Compiling an already compiled expression returns it unchanged.
    pub fn compile(self, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
        let compiled = match self {
            e @ (Expr::Context
            | Expr::Root
            | Expr::Literal(_)
            | Expr::Value(_)
            | Expr::VarRef(_)
            | Expr::Pos(_)
            | Expr::IndexAccess(_)) => return Ok(e),
            Expr::Neg(e) => arith::compile_neg(*e, ctx)?,
            Expr::Arith(a) => a.compile(ctx)?,
            Expr::CmpG(c) => c.compile(ctx)?,
            Expr::CmpV(c) => c.compile(ctx)?,
            Expr::CmpN(c) => c.compile(ctx)?,
            Expr::CmpR(c) => c.compile(ctx)?,
            Expr::CmpSR(c) => c.compile(ctx)?,
            Expr::And(v) => logic::compile_and(v, ctx)?,
            Expr::Or(v) => logic::compile_or(v, ctx)?,
            Expr::Union(v) => set::compile_union(v, ctx)?,
            Expr::Intersect(v) => set::compile_intersect(v, ctx)?,
            Expr::Except(v) => set::compile_except(v, ctx)?,
            Expr::List(v) => set::compile_list(v, ctx)?,
            Expr::Range(a, b) => set::compile_range(*a, *b, ctx)?,
            Expr::Path(p) => p.compile(ctx)?,
            Expr::Filter(f) => f.compile(ctx)?,
            Expr::Call(f) => f.compile(ctx)?,
            Expr::Cast(c) => c.compile(ctx)?,
            Expr::Castable(c) => c.compile_castable(ctx)?,
            Expr::Treat(t) => t.compile(ctx)?,
            Expr::Instance(i) => i.compile(ctx)?,
            Expr::Flwor(f) => f.compile(ctx)?,
            Expr::Quantified(q) => q.compile(ctx)?,
            Expr::If(i) => i.compile(ctx)?,
            Expr::TypeSwitch(t) => t.compile(ctx)?,
            Expr::Try(t) => t.compile(ctx)?,
            Expr::FTContains(f) => f.compile(ctx)?,
            Expr::Insert(i) => i.compile(ctx)?,
            Expr::Delete(d) => d.compile(ctx)?,
            Expr::Rename(r) => r.compile(ctx)?,
            Expr::Replace(r) => r.compile(ctx)?,
        };
        compiled.fold(ctx)
    }

    /// Pre-evaluate an expression whose operands are all constants. Errors are
    /// not raised here; the expression is kept and fails when evaluated.
    pub(crate) fn fold(self, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
        if !ctx.options().fold_constants
            || self.is_value()
            || matches!(
                self,
                Expr::Context
                    | Expr::Root
                    | Expr::VarRef(_)
                    | Expr::Pos(_)
                    | Expr::IndexAccess(_)
                    // ranges stay lazy
                    | Expr::Range(..)
            )
            || self.has(Flag::Upd)
            || self.has(Flag::Ndt)
            || self.uses_focus()
            || !self.children().iter().all(|(_, c)| c.is_value())
        {
            return Ok(self);
        }
        match self.value(ctx) {
            Ok(seq) => {
                let folded = Expr::from_seq(seq);
                tracing::debug!(expr = ?folded, "folded constant expression");
                Ok(folded)
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(_) => Ok(self),
        }
    }

    /// Lazily evaluate the expression.
    pub fn iter<'e>(&'e self, ctx: &mut QueryContext<'_>) -> Result<Iter<'e>, Error> {
        match self {
            Expr::Context => Ok(sequence::single(ctx.context_item()?.clone())),
            Expr::Root => {
                let node = ctx.context_node().map_err(|_| {
                    Error::from_code(ErrorCode::XPDY0002, "root requires a context node")
                })?;
                let store = ctx.store();
                let mut root = node;
                while let Some(p) = store.parent(root) {
                    root = p;
                }
                Ok(sequence::single(XdmItem::Node(root)))
            }
            Expr::Literal(a) => Ok(sequence::single(XdmItem::Atomic(a.clone()))),
            Expr::Value(v) => Ok(sequence::value(v.clone())),
            Expr::VarRef(v) => Ok(Box::new(sequence::ValueIter::new(ctx.var(v)?))),
            Expr::IndexAccess(q) => {
                let index = ctx.index().ok_or_else(|| {
                    Error::from_code(ErrorCode::FOER0000, "index access without an index")
                })?;
                let hits = index.lookup(q);
                Ok(sequence::value(
                    hits.into_iter().map(XdmItem::Node).collect::<Vec<_>>(),
                ))
            }
            Expr::Neg(e) => arith::eval_neg(e, ctx).map(opt_atomic),
            Expr::Arith(a) => a.eval(ctx).map(opt_atomic),
            Expr::CmpV(c) => c.eval(ctx).map(opt_bool),
            Expr::CmpN(c) => c.eval(ctx).map(opt_bool),
            Expr::CmpR(c) => c.eval(ctx).map(opt_bool),
            Expr::CmpSR(c) => c.eval(ctx).map(opt_bool),
            Expr::Pos(_)
            | Expr::CmpG(_)
            | Expr::And(_)
            | Expr::Or(_)
            | Expr::Quantified(_)
            | Expr::Instance(_)
            | Expr::Castable(_)
            | Expr::FTContains(_) => Ok(sequence::single(XdmItem::Atomic(
                XdmAtomicValue::Boolean(self.ebv(ctx)?),
            ))),
            Expr::Union(v) => set::iter_union(v, ctx),
            Expr::Intersect(v) => set::iter_intersect(v, ctx),
            Expr::Except(v) => set::iter_except(v, ctx),
            Expr::List(v) => set::iter_list(v, ctx),
            Expr::Range(a, b) => set::iter_range(a, b, ctx),
            Expr::Path(p) => p.iter(ctx),
            Expr::Filter(f) => f.iter(ctx),
            Expr::Call(f) => f.iter(ctx),
            Expr::Cast(c) => c.eval(ctx).map(opt_atomic),
            Expr::Treat(t) => t.iter(ctx),
            Expr::Flwor(f) => f.iter(ctx),
            Expr::If(i) => i.iter(ctx),
            Expr::TypeSwitch(t) => t.iter(ctx),
            Expr::Try(t) => t.iter(ctx),
            Expr::Insert(i) => i.collect(ctx).map(|_| sequence::empty()),
            Expr::Delete(d) => d.collect(ctx).map(|_| sequence::empty()),
            Expr::Rename(r) => r.collect(ctx).map(|_| sequence::empty()),
            Expr::Replace(r) => r.collect(ctx).map(|_| sequence::empty()),
        }
    }

    /// Evaluate to a materialized sequence.
    pub fn value(&self, ctx: &mut QueryContext<'_>) -> Result<XdmSequence, Error> {
        let it = self.iter(ctx)?;
        sequence::collect(it, ctx)
    }

    /// Evaluate to at most one item.
    pub fn item(&self, ctx: &mut QueryContext<'_>) -> Result<Option<XdmItem>, Error> {
        let mut it = self.iter(ctx)?;
        let first = it.next(ctx)?;
        if first.is_some() && it.next(ctx)?.is_some() {
            return Err(Error::type_err("sequence of more than one item is not allowed here"));
        }
        Ok(first)
    }

    /// Evaluate and atomize to at most one atomic value.
    pub fn atomic_opt(&self, ctx: &mut QueryContext<'_>) -> Result<Option<XdmAtomicValue>, Error> {
        Ok(self.item(ctx)?.map(|i| atomize(ctx, i)))
    }

    /// Evaluate and atomize to exactly one atomic value.
    pub fn atomic_one(&self, ctx: &mut QueryContext<'_>) -> Result<XdmAtomicValue, Error> {
        self.atomic_opt(ctx)?
            .ok_or_else(|| Error::empty_sequence("empty sequence is not allowed here"))
    }

    /// Evaluate and atomize every item.
    pub fn atomize_all(&self, ctx: &mut QueryContext<'_>) -> Result<Vec<XdmAtomicValue>, Error> {
        let mut it = self.iter(ctx)?;
        let mut out = Vec::new();
        while let Some(item) = it.next(ctx)? {
            out.push(atomize(ctx, item));
        }
        Ok(out)
    }

    /// Effective boolean value.
    pub fn ebv(&self, ctx: &mut QueryContext<'_>) -> Result<bool, Error> {
        match self {
            Expr::Literal(XdmAtomicValue::Boolean(b)) => Ok(*b),
            Expr::Pos(p) => Ok(p.matches(ctx.focus().pos)),
            Expr::CmpG(c) => c.eval(ctx),
            Expr::CmpV(c) => Ok(c.eval(ctx)?.unwrap_or(false)),
            Expr::CmpN(c) => Ok(c.eval(ctx)?.unwrap_or(false)),
            Expr::CmpR(c) => Ok(c.eval(ctx)?.unwrap_or(false)),
            Expr::CmpSR(c) => Ok(c.eval(ctx)?.unwrap_or(false)),
            Expr::And(v) => logic::eval_and(v, ctx),
            Expr::Or(v) => logic::eval_or(v, ctx),
            Expr::Quantified(q) => q.eval(ctx),
            Expr::Instance(i) => i.eval(ctx),
            Expr::Castable(c) => c.eval_castable(ctx),
            Expr::FTContains(f) => Ok(f.score(ctx)? > 0.0),
            _ => {
                let mut it = self.iter(ctx)?;
                let Some(first) = it.next(ctx)? else {
                    return Ok(false);
                };
                match first {
                    XdmItem::Node(_) => Ok(true),
                    XdmItem::Atomic(a) => {
                        if it.next(ctx)?.is_some() {
                            return Err(Error::from_code(
                                ErrorCode::FORG0006,
                                "effective boolean value of a sequence of several atomic values",
                            ));
                        }
                        atomic_ebv(&a)
                    }
                }
            }
        }
    }

    /// Full-text relevance in `[0, 1]`; non-full-text expressions score 1 or 0.
    pub fn score(&self, ctx: &mut QueryContext<'_>) -> Result<f64, Error> {
        match self {
            Expr::FTContains(f) => f.score(ctx),
            Expr::And(v) => {
                let scoring = ctx.scoring();
                let mut acc: Option<f64> = None;
                for e in v {
                    let s = e.score(ctx)?;
                    if s <= 0.0 {
                        return Ok(0.0);
                    }
                    acc = Some(acc.map_or(s, |a| scoring.and(a, s)));
                }
                Ok(acc.unwrap_or(1.0))
            }
            Expr::Or(v) => {
                let scoring = ctx.scoring();
                let mut acc = 0.0;
                for e in v {
                    acc = scoring.or(acc, e.score(ctx)?);
                }
                Ok(acc)
            }
            e if e.shape().kind == ShapeKind::Boolean => {
                Ok(if e.ebv(ctx)? { 1.0 } else { 0.0 })
            }
            other => {
                let items = other.value(ctx)?;
                Ok(Scoring::mean(items.iter().map(|i| match i {
                    XdmItem::Atomic(XdmAtomicValue::Boolean(b)) => {
                        if *b { 1.0 } else { 0.0 }
                    }
                    _ => 1.0,
                })))
            }
        }
    }
}

fn binary_occ(a: &Expr, b: &Expr) -> Occ {
    if a.shape().is_single() && b.shape().is_single() {
        Occ::One
    } else {
        Occ::ZeroOrOne
    }
}

fn opt_atomic<'e>(v: Option<XdmAtomicValue>) -> Iter<'e> {
    match v {
        Some(a) => sequence::single(XdmItem::Atomic(a)),
        None => sequence::empty(),
    }
}

fn opt_bool<'e>(v: Option<bool>) -> Iter<'e> {
    opt_atomic(v.map(XdmAtomicValue::Boolean))
}

/// Atomize a single item. Nodes yield their string value as untyped atomic,
/// except comments and processing instructions, which yield strings.
pub fn atomize(ctx: &QueryContext<'_>, item: XdmItem) -> XdmAtomicValue {
    match item {
        XdmItem::Atomic(a) => a,
        XdmItem::Node(n) => {
            let store = ctx.store();
            match store.kind(n) {
                NodeKind::Comment | NodeKind::ProcessingInstruction => {
                    XdmAtomicValue::String(store.string_value(n))
                }
                _ => XdmAtomicValue::UntypedAtomic(store.string_value(n)),
            }
        }
    }
}

/// Effective boolean value of a single atomic value.
pub fn atomic_ebv(a: &XdmAtomicValue) -> Result<bool, Error> {
    match a {
        XdmAtomicValue::Boolean(b) => Ok(*b),
        XdmAtomicValue::String(s) | XdmAtomicValue::UntypedAtomic(s) | XdmAtomicValue::AnyUri(s) => {
            Ok(!s.is_empty())
        }
        XdmAtomicValue::Integer(i) => Ok(*i != 0),
        XdmAtomicValue::Decimal(d) => Ok(*d != 0.0),
        XdmAtomicValue::Double(d) => Ok(*d != 0.0 && !d.is_nan()),
        XdmAtomicValue::Float(f) => Ok(*f != 0.0 && !f.is_nan()),
        other => Err(Error::from_code(
            ErrorCode::FORG0006,
            format!(
                "effective boolean value is not defined for {}",
                other.atomic_type()
            ),
        )),
    }
}

/// Reject updating sub-expressions in positions that must not update.
pub(crate) fn check_simple(e: &Expr) -> Result<(), Error> {
    if e.is_updating() {
        return Err(Error::from_code(
            ErrorCode::XUST0001,
            "updating expression is not allowed here",
        ));
    }
    Ok(())
}

/// Static type of a literal, used by type-based rewrites.
pub(crate) fn literal_type(e: &Expr) -> Option<AtomicType> {
    match e {
        Expr::Literal(a) => Some(a.atomic_type()),
        _ => None,
    }
}
