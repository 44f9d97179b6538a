//! Node set operators, sequence construction and integer ranges.
use super::types::cast_atomic;
use super::{Expr, check_simple};
use crate::runtime::{Error, QueryContext};
use crate::sequence::{
    self, ExceptIter, IntersectIter, ItemIter, Iter, RangeIter, UnionIter, doc_order_distinct,
};
use crate::xdm::{AtomicType, XdmAtomicValue, XdmItem};

fn compile_operands(
    ops: Vec<Expr>,
    ctx: &mut QueryContext<'_>,
    flatten: fn(Expr) -> Result<Vec<Expr>, Expr>,
) -> Result<Vec<Expr>, Error> {
    let mut out = Vec::with_capacity(ops.len());
    for op in ops {
        let op = op.compile(ctx)?;
        check_simple(&op)?;
        match flatten(op) {
            Ok(inner) => out.extend(inner),
            Err(op) => out.push(op),
        }
    }
    Ok(out)
}

fn reject_atomic(ops: &[Expr]) -> Result<(), Error> {
    if let Some(Expr::Literal(a)) = ops.iter().find(|e| matches!(e, Expr::Literal(_))) {
        return Err(Error::type_err(format!(
            "set operation expects nodes, found {}",
            a.atomic_type()
        )));
    }
    Ok(())
}

pub(crate) fn compile_union(ops: Vec<Expr>, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
    let mut ops = compile_operands(ops, ctx, |e| match e {
        Expr::Union(v) => Ok(v),
        other => Err(other),
    })?;
    reject_atomic(&ops)?;
    ops.retain(|e| !e.is_empty_value());
    match ops.len() {
        0 => Ok(Expr::empty()),
        1 if ops[0].ddo() => Ok(ops.remove(0)),
        _ => Ok(Expr::Union(ops)),
    }
}

pub(crate) fn compile_intersect(ops: Vec<Expr>, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
    let mut ops = compile_operands(ops, ctx, |e| match e {
        Expr::Intersect(v) => Ok(v),
        other => Err(other),
    })?;
    reject_atomic(&ops)?;
    if ops.iter().any(Expr::is_empty_value) {
        return Ok(Expr::empty());
    }
    match ops.len() {
        1 if ops[0].ddo() => Ok(ops.remove(0)),
        _ => Ok(Expr::Intersect(ops)),
    }
}

pub(crate) fn compile_except(ops: Vec<Expr>, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
    let mut ops = compile_operands(ops, ctx, |e| Err(e))?;
    reject_atomic(&ops)?;
    if ops.first().is_none_or(Expr::is_empty_value) {
        return Ok(Expr::empty());
    }
    let first = ops.remove(0);
    ops.retain(|e| !e.is_empty_value());
    if ops.is_empty() && first.ddo() {
        return Ok(first);
    }
    ops.insert(0, first);
    Ok(Expr::Except(ops))
}

/// Operand iterators in document order: merged directly when every operand
/// is already ordered, otherwise sorted after materialization.
fn ordered_inputs<'e>(ops: &'e [Expr], ctx: &mut QueryContext<'_>) -> Result<Vec<Iter<'e>>, Error> {
    let mut out = Vec::with_capacity(ops.len());
    for op in ops {
        if op.ddo() {
            out.push(op.iter(ctx)?);
        } else {
            let items = op.value(ctx)?;
            out.push(sequence::value(doc_order_distinct(ctx, items)?));
        }
    }
    Ok(out)
}

pub(crate) fn iter_union<'e>(ops: &'e [Expr], ctx: &mut QueryContext<'_>) -> Result<Iter<'e>, Error> {
    Ok(Box::new(UnionIter::new(ordered_inputs(ops, ctx)?)))
}

pub(crate) fn iter_intersect<'e>(
    ops: &'e [Expr],
    ctx: &mut QueryContext<'_>,
) -> Result<Iter<'e>, Error> {
    Ok(Box::new(IntersectIter::new(ordered_inputs(ops, ctx)?)))
}

pub(crate) fn iter_except<'e>(ops: &'e [Expr], ctx: &mut QueryContext<'_>) -> Result<Iter<'e>, Error> {
    let mut inputs = ordered_inputs(ops, ctx)?;
    if inputs.is_empty() {
        return Ok(sequence::empty());
    }
    let first = inputs.remove(0);
    Ok(Box::new(ExceptIter::new(first, inputs)))
}

/// Operands of a sequence constructor may be updating expressions.
pub(crate) fn compile_list(ops: Vec<Expr>, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
    let mut out = Vec::with_capacity(ops.len());
    for op in ops {
        match op.compile(ctx)? {
            Expr::List(inner) => out.extend(inner),
            other => out.push(other),
        }
    }
    let mut ops = out;
    ops.retain(|e| !e.is_empty_value());
    match ops.len() {
        0 => Ok(Expr::empty()),
        1 => Ok(ops.remove(0)),
        _ => Ok(Expr::List(ops)),
    }
}

/// Lazy concatenation of the operand sequences.
struct ListIter<'e> {
    ops: &'e [Expr],
    next_op: usize,
    current: Option<Iter<'e>>,
}

impl ItemIter for ListIter<'_> {
    fn next(&mut self, ctx: &mut QueryContext<'_>) -> Result<Option<XdmItem>, Error> {
        loop {
            if let Some(cur) = self.current.as_mut()
                && let Some(item) = cur.next(ctx)?
            {
                return Ok(Some(item));
            }
            let Some(op) = self.ops.get(self.next_op) else {
                return Ok(None);
            };
            self.next_op += 1;
            self.current = Some(op.iter(ctx)?);
        }
    }
}

pub(crate) fn iter_list<'e>(ops: &'e [Expr], _ctx: &mut QueryContext<'_>) -> Result<Iter<'e>, Error> {
    Ok(Box::new(ListIter {
        ops,
        next_op: 0,
        current: None,
    }))
}

pub(crate) fn compile_range(from: Expr, to: Expr, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
    let from = from.compile(ctx)?;
    let to = to.compile(ctx)?;
    check_simple(&from)?;
    check_simple(&to)?;
    if from.is_empty_value() || to.is_empty_value() {
        return Ok(Expr::empty());
    }
    // `n to n` is the single integer n
    if from == to
        && let Expr::Literal(XdmAtomicValue::Integer(_)) = &from
    {
        return Ok(from);
    }
    Ok(Expr::Range(Box::new(from), Box::new(to)))
}

fn range_bound(v: XdmAtomicValue) -> Result<i64, Error> {
    match v {
        XdmAtomicValue::Integer(i) => Ok(i),
        v @ XdmAtomicValue::UntypedAtomic(_) => match cast_atomic(v, AtomicType::Integer)? {
            XdmAtomicValue::Integer(i) => Ok(i),
            other => Err(Error::type_err(format!(
                "range bound must be an integer, found {}",
                other.atomic_type()
            ))),
        },
        other => Err(Error::type_err(format!(
            "range bound must be an integer, found {}",
            other.atomic_type()
        ))),
    }
}

pub(crate) fn iter_range<'e>(
    from: &'e Expr,
    to: &'e Expr,
    ctx: &mut QueryContext<'_>,
) -> Result<Iter<'e>, Error> {
    let Some(a) = from.atomic_opt(ctx)? else {
        return Ok(sequence::empty());
    };
    let Some(b) = to.atomic_opt(ctx)? else {
        return Ok(sequence::empty());
    };
    Ok(Box::new(RangeIter::new(range_bound(a)?, range_bound(b)?)))
}
