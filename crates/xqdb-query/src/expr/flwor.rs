//! FLWOR expressions and quantifiers.
//!
//! Tuples are vectors of variable bindings. Without `order by` or
//! `group by` the tuple stream is produced lazily by [`FlworIter`], which
//! keeps one sub-iterator per `for` clause and re-establishes the bindings of
//! the current tuple on every pull. Sorting and grouping need every tuple, so
//! those FLWORs are evaluated clause by clause over a materialized stream,
//! as are FLWORs with window clauses.
//!
//! Compilation rewrites the clause list until it is stable: conjunctive
//! `where` clauses are split and moved up to the clause binding their
//! variables, then folded into the predicate of that `for`; positional
//! tests become position predicates; nested FLWORs are flattened and
//! loop-invariant `let` clauses leave the loops they do not depend on.
use super::order::{EmptyOrder, KeySpec, compare_keys, stable_sort};
use super::pos::Pos;
use super::types::check_declared;
use super::window::Window;
use super::{Expr, Filter, Flag, ShapeKind, Var, VarId, atomize, check_simple};
use crate::runtime::{Error, QueryContext};
use crate::sequence::{self, ItemIter, Iter};
use crate::xdm::{SharedSequence, XdmAtomicValue, XdmItem, XdmSequence};
use smallvec::SmallVec;
use std::collections::HashMap;

pub(crate) type Tuple = SmallVec<[(VarId, SharedSequence); 4]>;

#[derive(Debug, Clone, PartialEq)]
pub struct OrderKey {
    pub expr: Expr,
    pub descending: bool,
    /// `None` uses the default of the query options.
    pub empty: Option<EmptyOrder>,
}

impl OrderKey {
    pub fn asc(expr: Expr) -> Self {
        Self {
            expr,
            descending: false,
            empty: None,
        }
    }

    pub fn desc(expr: Expr) -> Self {
        Self {
            descending: true,
            ..Self::asc(expr)
        }
    }
}

/// `group by $var [:= expr]`
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSpec {
    pub var: Var,
    /// `None` groups by the current value of an already bound `var`.
    pub expr: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    For {
        var: Var,
        pos: Option<Var>,
        allowing_empty: bool,
        expr: Expr,
    },
    Let {
        var: Var,
        /// `let score $s := expr` binds the relevance of `expr`.
        score: bool,
        expr: Expr,
    },
    Where(Expr),
    OrderBy(Vec<OrderKey>),
    GroupBy(Vec<GroupSpec>),
    Count(Var),
    Window(Window),
}

impl Clause {
    pub fn for_in(var: &Var, expr: Expr) -> Self {
        Clause::For {
            var: var.clone(),
            pos: None,
            allowing_empty: false,
            expr,
        }
    }

    pub fn let_(var: &Var, expr: Expr) -> Self {
        Clause::Let {
            var: var.clone(),
            score: false,
            expr,
        }
    }

    pub fn exprs(&self) -> Vec<&Expr> {
        match self {
            Clause::For { expr, .. } | Clause::Let { expr, .. } | Clause::Where(expr) => vec![expr],
            Clause::OrderBy(keys) => keys.iter().map(|k| &k.expr).collect(),
            Clause::GroupBy(specs) => specs.iter().filter_map(|s| s.expr.as_ref()).collect(),
            Clause::Count(_) => Vec::new(),
            Clause::Window(w) => w.exprs(),
        }
    }

    pub fn exprs_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            Clause::For { expr, .. } | Clause::Let { expr, .. } | Clause::Where(expr) => vec![expr],
            Clause::OrderBy(keys) => keys.iter_mut().map(|k| &mut k.expr).collect(),
            Clause::GroupBy(specs) => specs.iter_mut().filter_map(|s| s.expr.as_mut()).collect(),
            Clause::Count(_) => Vec::new(),
            Clause::Window(w) => w.exprs_mut(),
        }
    }

    /// Variables bound by this clause.
    pub fn binds(&self) -> Vec<&Var> {
        match self {
            Clause::For { var, pos, .. } => std::iter::once(var).chain(pos).collect(),
            Clause::Let { var, .. } | Clause::Count(var) => vec![var],
            Clause::GroupBy(specs) => specs.iter().map(|s| &s.var).collect(),
            Clause::Window(w) => w.vars(),
            Clause::Where(_) | Clause::OrderBy(_) => Vec::new(),
        }
    }

    /// Whether `e` may be evaluated before this clause: it reads none of the
    /// clause's variables and the clause has no side effects.
    fn skippable_by(&self, e: &Expr) -> bool {
        let stateless = matches!(
            self,
            Clause::For { .. } | Clause::Let { .. } | Clause::Where(_) | Clause::Window(_)
        );
        stateless
            && self
                .exprs()
                .into_iter()
                .all(|c| !c.has(Flag::Upd) && !c.has(Flag::Ndt))
            && !self.binds().into_iter().any(|v| e.uses_var(v))
    }

    /// Clauses that keep their meaning when appended to an enclosing FLWOR.
    fn nests(&self) -> bool {
        matches!(self, Clause::For { .. } | Clause::Let { .. } | Clause::Where(_))
    }

    fn refs_var(&self, var: &Var) -> bool {
        match self {
            Clause::GroupBy(specs) => specs.iter().any(|s| s.expr.is_none() && s.var == *var),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Flwor {
    pub clauses: Vec<Clause>,
    pub ret: Box<Expr>,
}

impl Flwor {
    pub fn new(clauses: Vec<Clause>, ret: Expr) -> Self {
        Self {
            clauses,
            ret: Box::new(ret),
        }
    }

    /// References to `var` that are not visible as expressions (`group by $v`).
    pub fn refs_var(&self, var: &Var) -> bool {
        self.clauses.iter().any(|c| c.refs_var(var))
    }

    /// Whether `var` is read by a clause after index `i` or by the return expression.
    fn used_after(&self, i: usize, var: &Var) -> bool {
        self.clauses[i + 1..]
            .iter()
            .any(|c| c.refs_var(var) || c.exprs().into_iter().any(|e| e.uses_var(var)))
            || self.ret.uses_var(var)
    }

    fn grouped_after(&self, i: usize) -> bool {
        self.clauses[i + 1..]
            .iter()
            .any(|c| matches!(c, Clause::GroupBy(_)))
    }

    pub(crate) fn compile(mut self, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
        for clause in &mut self.clauses {
            for e in clause.exprs_mut() {
                *e = std::mem::take(e).compile(ctx)?;
                check_simple(e)?;
            }
        }
        self.ret = Box::new(self.ret.compile(ctx)?);
        loop {
            match self.simplify(ctx)? {
                Step::Again(f) => self = f,
                Step::Done(e) => return Ok(e),
            }
        }
    }

    /// Apply one rewrite. Returns the rewritten FLWOR to try again, or the final expression.
    fn simplify(mut self, ctx: &mut QueryContext<'_>) -> Result<Step, Error> {
        for i in 0..self.clauses.len() {
            match &self.clauses[i] {
                Clause::Where(w) => match w.as_bool_literal() {
                    Some(true) => {
                        tracing::debug!("removed trivially true where clause");
                        self.clauses.remove(i);
                        return Ok(Step::Again(self));
                    }
                    Some(false) => return Ok(Step::Done(Expr::empty())),
                    None if w.is_empty_value() => return Ok(Step::Done(Expr::empty())),
                    None => {}
                },
                Clause::For {
                    allowing_empty: false,
                    expr,
                    ..
                } if expr.is_empty_value() => return Ok(Step::Done(Expr::empty())),
                Clause::For { expr, .. } if expr.shape().is_single() => {
                    if let Clause::For { var, pos, expr, .. } = self.clauses.remove(i) {
                        tracing::debug!(var = %var.name, "rewrote for over a single item to let");
                        if let Some(p) = pos {
                            self.clauses.insert(i, Clause::let_(&p, Expr::int(1)));
                        }
                        self.clauses.insert(i, Clause::let_(&var, expr));
                    }
                    return Ok(Step::Again(self));
                }
                Clause::Let { var, score, expr } => {
                    let side_effects = expr.has(Flag::Upd) || expr.has(Flag::Ndt);
                    if !side_effects && !self.used_after(i, var) {
                        tracing::debug!(var = %var.name, "removed unused let clause");
                        self.clauses.remove(i);
                        return Ok(Step::Again(self));
                    }
                    let cheap = expr.is_value() || matches!(expr, Expr::VarRef(_));
                    if !*score
                        && cheap
                        && !side_effects
                        && var.declared.is_none()
                        && !self.grouped_after(i)
                    {
                        let (var, value) = (var.clone(), expr.clone());
                        self.clauses.remove(i);
                        for c in &mut self.clauses[i..] {
                            for e in c.exprs_mut() {
                                e.inline(&var, &value);
                            }
                        }
                        self.ret.inline(&var, &value);
                        tracing::debug!(var = %var.name, "inlined let clause");
                        // inlined values may enable further folding
                        for c in &mut self.clauses[i..] {
                            for e in c.exprs_mut() {
                                *e = std::mem::take(e).compile(ctx)?;
                            }
                        }
                        self.ret = Box::new(self.ret.compile(ctx)?);
                        return Ok(Step::Again(self));
                    }
                }
                Clause::Count(var) if !self.used_after(i, var) => {
                    self.clauses.remove(i);
                    return Ok(Step::Again(self));
                }
                _ => {}
            }
        }
        if self.split_where()
            || self.float_where()
            || self.positional_where(ctx)?
            || self.unnest()
            || self.where_to_predicate(ctx)?
            || self.slide_let()
        {
            return Ok(Step::Again(self));
        }
        if let (
            [
                Clause::For {
                    var,
                    pos: None,
                    allowing_empty: false,
                    ..
                }
                | Clause::Let {
                    var, score: false, ..
                },
            ],
            Expr::VarRef(r),
        ) = (self.clauses.as_slice(), &*self.ret)
            && r == var
            && var.declared.is_none()
        {
            tracing::debug!(var = %var.name, "collapsed flwor returning its only variable");
            if let Some(Clause::For { expr, .. } | Clause::Let { expr, .. }) = self.clauses.pop() {
                return Ok(Step::Done(expr));
            }
        }
        if self.clauses.is_empty() {
            return Ok(Step::Done(*self.ret));
        }
        Ok(Step::Done(Expr::Flwor(self)))
    }

    /// `where A and B` as `where A where B`.
    fn split_where(&mut self) -> bool {
        let Some(i) = self
            .clauses
            .iter()
            .position(|c| matches!(c, Clause::Where(Expr::And(_))))
        else {
            return false;
        };
        if let Clause::Where(Expr::And(parts)) = self.clauses.remove(i) {
            tracing::debug!(parts = parts.len(), "split conjunctive where clause");
            let rest = self.clauses.split_off(i);
            self.clauses.extend(parts.into_iter().map(Clause::Where));
            self.clauses.extend(rest);
        }
        true
    }

    /// Move a `where` clause above the clauses that bind none of its variables.
    fn float_where(&mut self) -> bool {
        for i in 1..self.clauses.len() {
            let Clause::Where(pred) = &self.clauses[i] else {
                continue;
            };
            if pred.has(Flag::Upd) || pred.has(Flag::Ndt) {
                continue;
            }
            // only worth moving past a clause that binds variables
            let mut to = None;
            let mut k = i;
            while k > 0 && self.clauses[k - 1].skippable_by(pred) {
                k -= 1;
                if !matches!(self.clauses[k], Clause::Where(_)) {
                    to = Some(k);
                }
            }
            if let Some(to) = to {
                let clause = self.clauses.remove(i);
                self.clauses.insert(to, clause);
                tracing::debug!(from = i, to, "moved where clause up");
                return true;
            }
        }
        false
    }

    /// `for $x at $p in E where $p = N` as `for $x in E[N]` if `$p` is read nowhere else.
    fn positional_where(&mut self, ctx: &mut QueryContext<'_>) -> Result<bool, Error> {
        for i in 0..self.clauses.len().saturating_sub(1) {
            let (
                Clause::For {
                    pos: Some(p),
                    allowing_empty: false,
                    ..
                },
                Clause::Where(pred),
            ) = (&self.clauses[i], &self.clauses[i + 1])
            else {
                continue;
            };
            let Some(test) = position_test(pred, p) else {
                continue;
            };
            if self.used_after(i + 1, p) {
                continue;
            }
            self.clauses.remove(i + 1);
            if let Clause::For { var, pos, expr, .. } = &mut self.clauses[i] {
                *pos = None;
                let input = std::mem::take(expr);
                *expr = match test {
                    Expr::Pos(_) => Expr::Filter(Filter::new(input, vec![test])).compile(ctx)?,
                    // the position test never holds
                    _ => Expr::empty(),
                };
                tracing::debug!(var = %var.name, "rewrote positional where clause to predicate");
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// `for $x in E where P($x)` as `for $x in E[P(.)]`.
    fn where_to_predicate(&mut self, ctx: &mut QueryContext<'_>) -> Result<bool, Error> {
        for i in 0..self.clauses.len().saturating_sub(1) {
            let (
                Clause::For {
                    var,
                    pos: None,
                    allowing_empty: false,
                    ..
                },
                Clause::Where(pred),
            ) = (&self.clauses[i], &self.clauses[i + 1])
            else {
                continue;
            };
            if pred.uses_focus()
                || pred.has(Flag::Upd)
                || pred.has(Flag::Ndt)
                || !pred.removable(var)
                || pred.shape().kind != ShapeKind::Boolean
            {
                continue;
            }
            let Clause::Where(mut pred) = self.clauses.remove(i + 1) else {
                continue;
            };
            if let Clause::For { var, expr, .. } = &mut self.clauses[i] {
                pred.remove_var(var);
                let input = std::mem::take(expr);
                *expr = Expr::Filter(Filter::new(input, vec![pred])).compile(ctx)?;
                tracing::debug!(var = %var.name, "moved where clause into a predicate");
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Move a `let` clause above the `for` clauses it does not depend on.
    fn slide_let(&mut self) -> bool {
        for i in 1..self.clauses.len() {
            let Clause::Let { expr, .. } = &self.clauses[i] else {
                continue;
            };
            if expr.has(Flag::Upd) || expr.has(Flag::Ndt) {
                continue;
            }
            let mut to = None;
            let mut k = i;
            while k > 0 {
                let prev = &self.clauses[k - 1];
                let iterates = matches!(prev, Clause::For { .. } | Clause::Window(_));
                let passable = iterates || matches!(prev, Clause::Let { .. } | Clause::Where(_));
                if !passable || !prev.skippable_by(expr) {
                    break;
                }
                k -= 1;
                if iterates {
                    to = Some(k);
                }
            }
            if let Some(to) = to {
                let clause = self.clauses.remove(i);
                if let Clause::Let { var, .. } = &clause {
                    tracing::debug!(var = %var.name, "moved loop-invariant let clause out of for");
                }
                self.clauses.insert(to, clause);
                return true;
            }
        }
        false
    }

    /// Inline the clauses of a nested FLWOR bound by a `for` clause or returned.
    fn unnest(&mut self) -> bool {
        for i in 0..self.clauses.len() {
            let Clause::For {
                pos: None,
                allowing_empty: false,
                expr: Expr::Flwor(inner),
                ..
            } = &self.clauses[i]
            else {
                continue;
            };
            if !inner.clauses.iter().all(Clause::nests) {
                continue;
            }
            if let Clause::For {
                var,
                expr: Expr::Flwor(inner),
                ..
            } = self.clauses.remove(i)
            {
                tracing::debug!(var = %var.name, "unnested flwor bound by for clause");
                let Flwor { clauses, ret } = inner;
                let bound = Clause::For {
                    var,
                    pos: None,
                    allowing_empty: false,
                    expr: *ret,
                };
                let rest = self.clauses.split_off(i);
                self.clauses.extend(clauses);
                self.clauses.push(bound);
                self.clauses.extend(rest);
            }
            return true;
        }
        let nested =
            matches!(&*self.ret, Expr::Flwor(inner) if inner.clauses.iter().all(Clause::nests));
        if nested && let Expr::Flwor(inner) = std::mem::take(&mut *self.ret) {
            tracing::debug!(clauses = inner.clauses.len(), "unnested flwor in return");
            self.clauses.extend(inner.clauses);
            self.ret = inner.ret;
            return true;
        }
        false
    }

    pub(crate) fn iter<'e>(&'e self, ctx: &mut QueryContext<'_>) -> Result<Iter<'e>, Error> {
        let blocking = self
            .clauses
            .iter()
            .any(|c| matches!(c, Clause::OrderBy(_) | Clause::GroupBy(_) | Clause::Window(_)));
        if blocking {
            return self.eval_materialized(ctx);
        }
        let n = self.clauses.len();
        Ok(Box::new(FlworIter {
            clauses: &self.clauses,
            ret: &self.ret,
            binds: Tuple::new(),
            marks: vec![0; n],
            fors: (0..n).map(|_| None).collect(),
            counts: vec![0; n],
            out: None,
            started: false,
            done: false,
        }))
    }

    fn eval_materialized<'e>(&'e self, ctx: &mut QueryContext<'_>) -> Result<Iter<'e>, Error> {
        let mut tuples: Vec<Tuple> = vec![Tuple::new()];
        for clause in &self.clauses {
            tuples = match clause {
                Clause::For {
                    var,
                    pos,
                    allowing_empty,
                    expr,
                } => {
                    let mut next = Vec::new();
                    for t in tuples {
                        let items = with_binds(ctx, &t, |c| expr.value(c))?;
                        if items.is_empty() && *allowing_empty {
                            next.push(extend(&t, var, pos.as_ref(), None, 0));
                        }
                        for (i, item) in items.into_iter().enumerate() {
                            ctx.checkpoint()?;
                            check_declared(ctx, var, std::slice::from_ref(&item))?;
                            next.push(extend(&t, var, pos.as_ref(), Some(item), i + 1));
                        }
                    }
                    next
                }
                Clause::Let { var, score, expr } => {
                    let mut next = Vec::with_capacity(tuples.len());
                    for mut t in tuples {
                        let v = with_binds(ctx, &t, |c| bind_let(c, var, *score, expr))?;
                        t.push((var.id, v));
                        next.push(t);
                    }
                    next
                }
                Clause::Where(pred) => {
                    let mut next = Vec::with_capacity(tuples.len());
                    for t in tuples {
                        if with_binds(ctx, &t, |c| pred.ebv(c))? {
                            next.push(t);
                        }
                    }
                    next
                }
                Clause::Count(var) => tuples
                    .into_iter()
                    .enumerate()
                    .map(|(i, mut t)| {
                        t.push((var.id, counter(i + 1)));
                        t
                    })
                    .collect(),
                Clause::OrderBy(keys) => order_tuples(ctx, tuples, keys)?,
                Clause::GroupBy(specs) => group_tuples(ctx, tuples, specs)?,
                Clause::Window(w) => {
                    let mut next = Vec::new();
                    for t in tuples {
                        let items = with_binds(ctx, &t, |c| w.expr.value(c))?;
                        next.extend(w.tuples(ctx, &t, &items)?);
                    }
                    next
                }
            };
        }
        let mut out = XdmSequence::new();
        for t in &tuples {
            out.extend(with_binds(ctx, t, |c| self.ret.value(c))?);
        }
        Ok(sequence::value(out))
    }
}

enum Step {
    Again(Flwor),
    Done(Expr),
}

/// Evaluate `f` with the bindings of `tuple` in scope.
pub(crate) fn with_binds<R>(
    ctx: &mut QueryContext<'_>,
    tuple: &[(VarId, SharedSequence)],
    f: impl FnOnce(&mut QueryContext<'_>) -> Result<R, Error>,
) -> Result<R, Error> {
    let mut scope = ctx.scope();
    for (id, v) in tuple {
        scope.bind_id(*id, v.clone());
    }
    f(&mut scope)
}

/// `$p op n` or `n op $p` with a numeric literal, as a position test.
fn position_test(pred: &Expr, p: &Var) -> Option<Expr> {
    let (op, lhs, rhs) = match pred {
        Expr::CmpG(c) => (c.op, &*c.lhs, &*c.rhs),
        Expr::CmpV(c) => (c.op, &*c.lhs, &*c.rhs),
        _ => return None,
    };
    match (lhs, rhs) {
        (Expr::VarRef(v), Expr::Literal(n)) if v == p => Pos::from_cmp(op, n.as_f64()?),
        (Expr::Literal(n), Expr::VarRef(v)) if v == p => Pos::from_cmp(op.swap(), n.as_f64()?),
        _ => None,
    }
}

pub(crate) fn counter(n: usize) -> SharedSequence {
    let n = i64::try_from(n).unwrap_or(i64::MAX);
    vec![XdmItem::Atomic(XdmAtomicValue::Integer(n))].into()
}

fn extend(t: &Tuple, var: &Var, pos: Option<&Var>, item: Option<XdmItem>, at: usize) -> Tuple {
    let mut t = t.clone();
    t.push((var.id, item.into_iter().collect::<Vec<_>>().into()));
    if let Some(p) = pos {
        t.push((p.id, counter(at)));
    }
    t
}

fn bind_let(
    ctx: &mut QueryContext<'_>,
    var: &Var,
    score: bool,
    expr: &Expr,
) -> Result<SharedSequence, Error> {
    if score {
        let s = expr.score(ctx)?;
        return Ok(vec![XdmItem::Atomic(XdmAtomicValue::Double(s))].into());
    }
    let value = expr.value(ctx)?;
    check_declared(ctx, var, &value)?;
    Ok(value.into())
}

fn order_tuples(
    ctx: &mut QueryContext<'_>,
    tuples: Vec<Tuple>,
    keys: &[OrderKey],
) -> Result<Vec<Tuple>, Error> {
    let default_empty = ctx.options().empty_order;
    let specs: Vec<KeySpec> = keys
        .iter()
        .map(|k| KeySpec {
            descending: k.descending,
            empty: k.empty.unwrap_or(default_empty),
        })
        .collect();
    let mut keyed = Vec::with_capacity(tuples.len());
    for t in tuples {
        let mut values = Vec::with_capacity(keys.len());
        for k in keys {
            values.push(with_binds(ctx, &t, |c| k.expr.atomic_opt(c))?);
        }
        keyed.push((values, t));
    }
    let sorted = stable_sort(keyed, |a, b| compare_keys(&a.0, &b.0, &specs))?;
    Ok(sorted.into_iter().map(|(_, t)| t).collect())
}

/// Hashable identity of a grouping key. Numerically equal values of
/// different numeric types share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyAtom {
    Empty,
    Int(i64),
    Num(u64),
    Nan,
    Str(String),
    Bool(bool),
    Other(&'static str, String),
}

impl KeyAtom {
    fn of(v: Option<&XdmAtomicValue>) -> KeyAtom {
        let Some(v) = v else {
            return KeyAtom::Empty;
        };
        if let XdmAtomicValue::Integer(i) = v {
            return KeyAtom::Int(*i);
        }
        if let Some(f) = v.as_f64() {
            if f.is_nan() {
                return KeyAtom::Nan;
            }
            if f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15 {
                return KeyAtom::Int(f as i64);
            }
            return KeyAtom::Num(f.to_bits());
        }
        match v {
            XdmAtomicValue::Boolean(b) => KeyAtom::Bool(*b),
            s if s.is_string_like() => KeyAtom::Str(s.lexical()),
            other => KeyAtom::Other(other.atomic_type().name(), other.lexical()),
        }
    }
}

fn group_tuples(
    ctx: &mut QueryContext<'_>,
    tuples: Vec<Tuple>,
    specs: &[GroupSpec],
) -> Result<Vec<Tuple>, Error> {
    let mut index: HashMap<Vec<KeyAtom>, usize> = HashMap::new();
    let mut groups: Vec<(Vec<Option<XdmAtomicValue>>, Vec<Tuple>)> = Vec::new();
    for t in tuples {
        let mut key = Vec::with_capacity(specs.len());
        for spec in specs {
            let seq = match &spec.expr {
                Some(e) => with_binds(ctx, &t, |c| e.value(c))?,
                None => with_binds(ctx, &t, |c| c.var(&spec.var))?.to_vec(),
            };
            if seq.len() > 1 {
                return Err(Error::type_err("grouping key must be at most one atomic value"));
            }
            key.push(seq.into_iter().next().map(|i| atomize(ctx, i)));
        }
        let atoms: Vec<KeyAtom> = key.iter().map(|k| KeyAtom::of(k.as_ref())).collect();
        match index.get(&atoms) {
            Some(&g) => groups[g].1.push(t),
            None => {
                index.insert(atoms, groups.len());
                groups.push((key, vec![t]));
            }
        }
    }
    tracing::debug!(groups = groups.len(), "partitioned tuples");
    let grouping: Vec<VarId> = specs.iter().map(|s| s.var.id).collect();
    Ok(groups
        .into_iter()
        .map(|(key, members)| {
            let mut out = Tuple::new();
            if let Some(first) = members.first() {
                for (slot, (id, _)) in first.iter().enumerate() {
                    if grouping.contains(id) {
                        continue;
                    }
                    let merged: Vec<XdmItem> = members
                        .iter()
                        .flat_map(|m| m[slot].1.iter().cloned())
                        .collect();
                    out.push((*id, merged.into()));
                }
            }
            for (spec, k) in specs.iter().zip(key) {
                out.push((spec.var.id, k.map(XdmItem::Atomic).into_iter().collect::<Vec<_>>().into()));
            }
            out
        })
        .collect())
}

struct ForState<'e> {
    iter: Iter<'e>,
    pos: usize,
    exhausted: bool,
}

/// Lazy nested-loop evaluation of FLWORs without blocking clauses.
struct FlworIter<'e> {
    clauses: &'e [Clause],
    ret: &'e Expr,
    binds: Tuple,
    /// Length of `binds` before clause `i` added its bindings.
    marks: Vec<usize>,
    fors: Vec<Option<ForState<'e>>>,
    counts: Vec<usize>,
    out: Option<Iter<'e>>,
    started: bool,
    done: bool,
}

impl<'e> FlworIter<'e> {
    /// Pull the next binding of the `for` clause at `level`. `false` if it has none left.
    fn pull(&mut self, ctx: &mut QueryContext<'_>, level: usize) -> Result<bool, Error> {
        let clauses = self.clauses;
        let Clause::For {
            var,
            pos,
            allowing_empty,
            ..
        } = &clauses[level]
        else {
            return Ok(false);
        };
        self.binds.truncate(self.marks[level]);
        let Some(state) = self.fors[level].as_mut() else {
            return Ok(false);
        };
        if state.exhausted {
            self.fors[level] = None;
            return Ok(false);
        }
        let next = {
            let mut scope = ctx.scope();
            for (id, v) in &self.binds {
                scope.bind_id(*id, v.clone());
            }
            state.iter.next(&mut scope)?
        };
        match next {
            Some(item) => {
                check_declared(ctx, var, std::slice::from_ref(&item))?;
                state.pos += 1;
                let at = state.pos;
                self.binds.push((var.id, vec![item].into()));
                if let Some(p) = pos {
                    self.binds.push((p.id, counter(at)));
                }
                Ok(true)
            }
            None if state.pos == 0 && *allowing_empty => {
                state.exhausted = true;
                self.binds.push((var.id, Vec::new().into()));
                if let Some(p) = pos {
                    self.binds.push((p.id, counter(0)));
                }
                Ok(true)
            }
            None => {
                self.fors[level] = None;
                Ok(false)
            }
        }
    }

    /// Advance to the next complete tuple.
    fn advance(&mut self, ctx: &mut QueryContext<'_>) -> Result<bool, Error> {
        let clauses = self.clauses;
        let n = clauses.len();
        // `level` is the clause to (re)enter; `down` tells whether it is entered fresh.
        let (mut level, mut down) = if self.started {
            match n.checked_sub(1) {
                Some(l) => (l, false),
                None => return Ok(false),
            }
        } else {
            self.started = true;
            (0, true)
        };
        loop {
            ctx.checkpoint()?;
            if down && level == n {
                return Ok(true);
            }
            let clause = &clauses[level];
            let ok = if down {
                self.binds.truncate(self.marks[level]);
                self.marks[level] = self.binds.len();
                match clause {
                    Clause::For { expr, .. } => {
                        let iter = with_binds(ctx, &self.binds, |c| expr.iter(c))?;
                        self.fors[level] = Some(ForState {
                            iter,
                            pos: 0,
                            exhausted: false,
                        });
                        self.pull(ctx, level)?
                    }
                    Clause::Let { var, score, expr } => {
                        let v = with_binds(ctx, &self.binds, |c| bind_let(c, var, *score, expr))?;
                        self.binds.push((var.id, v));
                        true
                    }
                    Clause::Where(pred) => with_binds(ctx, &self.binds, |c| pred.ebv(c))?,
                    Clause::Count(var) => {
                        self.counts[level] += 1;
                        self.binds.push((var.id, counter(self.counts[level])));
                        true
                    }
                    Clause::OrderBy(_) | Clause::GroupBy(_) | Clause::Window(_) => {
                        return Err(Error::from_code(
                            crate::runtime::ErrorCode::FOER0000,
                            "blocking clause in a streamed flwor",
                        ));
                    }
                }
            } else if matches!(clause, Clause::For { .. }) {
                self.pull(ctx, level)?
            } else {
                false
            };
            if ok {
                level += 1;
                down = true;
            } else {
                match level.checked_sub(1) {
                    Some(l) => {
                        level = l;
                        down = false;
                    }
                    None => return Ok(false),
                }
            }
        }
    }
}

impl ItemIter for FlworIter<'_> {
    fn next(&mut self, ctx: &mut QueryContext<'_>) -> Result<Option<XdmItem>, Error> {
        loop {
            if let Some(out) = self.out.as_mut() {
                let item = with_binds(ctx, &self.binds, |c| out.next(c))?;
                if item.is_some() {
                    return Ok(item);
                }
                self.out = None;
            }
            if self.done {
                return Ok(None);
            }
            if !self.advance(ctx)? {
                self.done = true;
                return Ok(None);
            }
            let ret = self.ret;
            self.out = Some(with_binds(ctx, &self.binds, |c| ret.iter(c))?);
        }
    }
}

/// `some/every $v in E ... satisfies P`
#[derive(Debug, Clone, PartialEq)]
pub struct Quantified {
    pub every: bool,
    pub bindings: Vec<(Var, Expr)>,
    pub satisfies: Box<Expr>,
}

impl Quantified {
    pub fn some(bindings: Vec<(Var, Expr)>, satisfies: Expr) -> Self {
        Self {
            every: false,
            bindings,
            satisfies: Box::new(satisfies),
        }
    }

    pub fn every(bindings: Vec<(Var, Expr)>, satisfies: Expr) -> Self {
        Self {
            every: true,
            ..Self::some(bindings, satisfies)
        }
    }

    pub(crate) fn compile(mut self, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
        for (_, e) in &mut self.bindings {
            *e = std::mem::take(e).compile(ctx)?;
            check_simple(e)?;
        }
        let satisfies = self.satisfies.compile(ctx)?;
        check_simple(&satisfies)?;
        self.satisfies = Box::new(satisfies);
        // no tuples: `some` is false, `every` is true
        if self.bindings.iter().any(|(_, e)| e.is_empty_value()) {
            tracing::debug!(every = self.every, "folded quantifier over an empty binding");
            return Ok(Expr::boolean(self.every));
        }
        // a constant test decides every non-empty case the same way
        let pure = self.bindings.iter().all(|(_, e)| !e.has(Flag::Ndt));
        if pure
            && self.satisfies.as_bool_literal() == Some(self.every)
        {
            return Ok(Expr::boolean(self.every));
        }
        Ok(Expr::Quantified(self))
    }

    pub(crate) fn eval(&self, ctx: &mut QueryContext<'_>) -> Result<bool, Error> {
        self.eval_from(0, ctx)
    }

    fn eval_from(&self, i: usize, ctx: &mut QueryContext<'_>) -> Result<bool, Error> {
        let Some((var, expr)) = self.bindings.get(i) else {
            return self.satisfies.ebv(ctx);
        };
        let mut it = expr.iter(ctx)?;
        while let Some(item) = it.next(ctx)? {
            ctx.checkpoint()?;
            let hit = {
                let mut scope = ctx.scope();
                scope.bind(var, vec![item]);
                self.eval_from(i + 1, &mut scope)?
            };
            if hit != self.every {
                return Ok(hit);
            }
        }
        Ok(self.every)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{Arith, Calc, CmpG, CmpOp};
    use crate::simple_store::{doc, elem};

    fn ints(v: &[XdmItem]) -> Vec<i64> {
        v.iter()
            .map(|i| match i {
                XdmItem::Atomic(XdmAtomicValue::Integer(n)) => *n,
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    }

    #[test]
    fn nested_for_is_a_cartesian_product() {
        let store = doc().child(elem("a")).build();
        let mut ctx = QueryContext::new(&store);
        let (x, y) = (Var::new("x"), Var::new("y"));
        let f = Flwor::new(
            vec![
                Clause::for_in(&x, Expr::ints(&[1, 2])),
                Clause::for_in(&y, Expr::ints(&[10, 20])),
            ],
            Expr::Arith(Arith::new(Calc::Add, Expr::var(&x), Expr::var(&y))),
        );
        let out = Expr::Flwor(f).value(&mut ctx).unwrap();
        assert_eq!(ints(&out), vec![11, 21, 12, 22]);
    }

    #[test]
    fn for_over_a_single_item_becomes_let() {
        let store = doc().child(elem("a")).build();
        let mut ctx = QueryContext::new(&store).with_document_context();
        let x = Var::new("x");
        let f = Flwor::new(
            vec![Clause::for_in(&x, Expr::Root)],
            Expr::Arith(Arith::new(Calc::Add, Expr::int(1), Expr::int(1))),
        );
        // the binding is unused once turned into a let
        assert_eq!(Expr::Flwor(f).compile(&mut ctx).unwrap(), Expr::int(2));
    }

    #[test]
    fn where_filter_rewrite() {
        let store = doc().child(elem("a")).build();
        let mut ctx = QueryContext::new(&store);
        let x = Var::new("x");
        let f = Flwor::new(
            vec![
                Clause::for_in(&x, Expr::range(Expr::int(1), Expr::int(5))),
                Clause::Where(Expr::CmpG(CmpG::new(CmpOp::Gt, Expr::var(&x), Expr::int(3)))),
            ],
            Expr::var(&x),
        );
        let compiled = Expr::Flwor(f).compile(&mut ctx).unwrap();
        assert!(matches!(compiled, Expr::Filter(_)));
        assert_eq!(ints(&compiled.value(&mut ctx).unwrap()), vec![4, 5]);
    }

    #[test]
    fn positional_variable_and_allowing_empty() {
        let store = doc().child(elem("a")).build();
        let mut ctx = QueryContext::new(&store);
        let (x, i) = (Var::new("x"), Var::new("i"));
        let f = Flwor::new(
            vec![Clause::For {
                var: x.clone(),
                pos: Some(i.clone()),
                allowing_empty: true,
                expr: Expr::List(vec![]),
            }],
            Expr::var(&i),
        );
        assert_eq!(ints(&Expr::Flwor(f).value(&mut ctx).unwrap()), vec![0]);
    }

    #[test]
    fn quantifiers_short_circuit() {
        let store = doc().child(elem("a")).build();
        let mut ctx = QueryContext::new(&store);
        let x = Var::new("x");
        let gt = |n| Expr::CmpG(CmpG::new(CmpOp::Gt, Expr::var(&x), Expr::int(n)));
        let some = Quantified::some(vec![(x.clone(), Expr::ints(&[1, 2, 3]))], gt(2));
        assert!(some.eval(&mut ctx).unwrap());
        let every = Quantified::every(vec![(x.clone(), Expr::ints(&[1, 2, 3]))], gt(2));
        assert!(!every.eval(&mut ctx).unwrap());
        let vacuous = Quantified::every(vec![(x.clone(), Expr::empty())], gt(2));
        assert_eq!(Expr::Quantified(vacuous).compile(&mut ctx).unwrap(), Expr::boolean(true));
    }
}
