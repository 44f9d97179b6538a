//! Boolean connectives, conditionals and `try/catch`.
use super::{Expr, Var, check_simple};
use crate::runtime::{Error, QueryContext};
use crate::sequence::{self, Iter};
use crate::xdm::{ExpandedName, XdmAtomicValue, XdmItem};

/// Compile the operands and flatten nested conjunctions. Literal operands
/// short-circuit; positional and range tests over the same operand merge.
pub(crate) fn compile_and(ops: Vec<Expr>, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
    let mut out: Vec<Expr> = Vec::with_capacity(ops.len());
    for op in ops {
        let op = op.compile(ctx)?;
        check_simple(&op)?;
        let flat = match op {
            Expr::And(inner) => inner,
            other => vec![other],
        };
        for e in flat {
            if e.is_value() {
                match e.ebv(ctx) {
                    Ok(true) => continue,
                    Ok(false) => return Ok(Expr::boolean(false)),
                    Err(err) if err.is_cancelled() => return Err(err),
                    Err(_) => {}
                }
            }
            match merge_and(&mut out, e) {
                Some(e) => out.push(e),
                None if out.iter().any(|x| x.as_bool_literal() == Some(false)) => {
                    return Ok(Expr::boolean(false));
                }
                None => {}
            }
        }
    }
    Ok(finish(out, true))
}

pub(crate) fn compile_or(ops: Vec<Expr>, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
    let mut out: Vec<Expr> = Vec::with_capacity(ops.len());
    for op in ops {
        let op = op.compile(ctx)?;
        check_simple(&op)?;
        let flat = match op {
            Expr::Or(inner) => inner,
            other => vec![other],
        };
        for e in flat {
            if e.is_value() {
                match e.ebv(ctx) {
                    Ok(true) => return Ok(Expr::boolean(true)),
                    Ok(false) => continue,
                    Err(err) if err.is_cancelled() => return Err(err),
                    Err(_) => {}
                }
            }
            if let Some(e) = merge_or(&mut out, e) {
                out.push(e);
            }
        }
    }
    Ok(finish(out, false))
}

/// Fold `e` into a compatible operand already in `out`. Returns `e` back if
/// nothing absorbed it. An empty merge leaves `false` in `out`.
fn merge_and(out: &mut [Expr], e: Expr) -> Option<Expr> {
    for prev in out.iter_mut() {
        let merged = match (&*prev, &e) {
            (Expr::Pos(a), Expr::Pos(b)) => {
                Some(a.intersect(b).map_or_else(|| Expr::boolean(false), Expr::Pos))
            }
            (Expr::CmpR(a), Expr::CmpR(b)) if mergeable(&a.expr, a.single) => a.intersect(b),
            (Expr::CmpSR(a), Expr::CmpSR(b)) if mergeable(&a.expr, a.single) => a.intersect(b),
            _ => None,
        };
        if let Some(m) = merged {
            tracing::debug!(merged = ?m, "merged conjunction operands");
            *prev = m;
            return None;
        }
    }
    Some(e)
}

fn merge_or(out: &mut [Expr], e: Expr) -> Option<Expr> {
    if let Expr::Pos(b) = &e {
        for prev in out.iter_mut() {
            if let Expr::Pos(a) = prev
                && let Some(u) = a.union(b)
            {
                tracing::debug!(min = u.min(), max = u.max(), "merged positional disjunction");
                *a = u;
                return None;
            }
        }
    }
    Some(e)
}

/// Ranges over a possibly multi-valued operand are existential and do not
/// intersect.
fn mergeable(operand: &Expr, single: bool) -> bool {
    single || operand.shape().at_most_one()
}

fn finish(mut out: Vec<Expr>, and: bool) -> Expr {
    match out.len() {
        0 => Expr::boolean(and),
        1 if out[0].shape() == super::Shape::one(super::ShapeKind::Boolean) => out.remove(0),
        _ if and => Expr::And(out),
        _ => Expr::Or(out),
    }
}

pub(crate) fn eval_and(ops: &[Expr], ctx: &mut QueryContext<'_>) -> Result<bool, Error> {
    for op in ops {
        if !op.ebv(ctx)? {
            return Ok(false);
        }
    }
    Ok(true)
}

pub(crate) fn eval_or(ops: &[Expr], ctx: &mut QueryContext<'_>) -> Result<bool, Error> {
    for op in ops {
        if op.ebv(ctx)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// `if (cond) then a else b`
#[derive(Debug, Clone, PartialEq)]
pub struct If {
    pub cond: Box<Expr>,
    pub then: Box<Expr>,
    pub els: Box<Expr>,
}

impl If {
    pub fn new(cond: Expr, then: Expr, els: Expr) -> Self {
        Self {
            cond: Box::new(cond),
            then: Box::new(then),
            els: Box::new(els),
        }
    }

    pub(crate) fn compile(mut self, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
        let cond = self.cond.compile(ctx)?;
        check_simple(&cond)?;
        self.then = Box::new(self.then.compile(ctx)?);
        self.els = Box::new(self.els.compile(ctx)?);
        if cond.is_value() {
            match cond.ebv(ctx) {
                Ok(b) => return Ok(if b { *self.then } else { *self.els }),
                Err(err) if err.is_cancelled() => return Err(err),
                Err(_) => {}
            }
        }
        self.cond = Box::new(cond);
        Ok(Expr::If(self))
    }

    pub(crate) fn iter<'e>(&'e self, ctx: &mut QueryContext<'_>) -> Result<Iter<'e>, Error> {
        if self.cond.ebv(ctx)? {
            self.then.iter(ctx)
        } else {
            self.els.iter(ctx)
        }
    }
}

/// Error name test of a `catch` clause.
#[derive(Debug, Clone, PartialEq)]
pub enum CatchCode {
    /// `*`
    Any,
    Name(ExpandedName),
    /// `*:local`
    Local(String),
    /// `prefix:*`, resolved to its namespace URI.
    Namespace(String),
}

impl CatchCode {
    pub fn matches(&self, code: &ExpandedName) -> bool {
        match self {
            CatchCode::Any => true,
            CatchCode::Name(n) => n == code,
            CatchCode::Local(l) => *l == code.local,
            CatchCode::Namespace(ns) => code.ns_uri.as_deref() == Some(ns.as_str()),
        }
    }
}

/// Variables bound inside a `catch` body (`$err:code`, `$err:description`, `$err:value`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrVars {
    pub code: Option<Var>,
    pub description: Option<Var>,
    pub value: Option<Var>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Catch {
    pub codes: Vec<CatchCode>,
    pub vars: ErrVars,
    pub body: Expr,
}

impl Catch {
    pub fn new(codes: Vec<CatchCode>, body: Expr) -> Self {
        Self {
            codes,
            vars: ErrVars::default(),
            body,
        }
    }

    pub fn with_vars(mut self, vars: ErrVars) -> Self {
        self.vars = vars;
        self
    }

    fn matches(&self, err: &Error) -> bool {
        self.codes.iter().any(|c| c.matches(&err.code))
    }
}

/// `try { body } catch ...`. The body is evaluated eagerly so that every
/// dynamic error it raises surfaces inside the try.
#[derive(Debug, Clone, PartialEq)]
pub struct Try {
    pub body: Box<Expr>,
    pub catches: Vec<Catch>,
}

impl Try {
    pub fn new(body: Expr, catches: Vec<Catch>) -> Self {
        Self {
            body: Box::new(body),
            catches,
        }
    }

    pub(crate) fn compile(mut self, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
        // static errors in the body are not caught
        let body = self.body.compile(ctx)?;
        if body.is_value() {
            return Ok(body);
        }
        self.body = Box::new(body);
        for c in &mut self.catches {
            c.body = std::mem::take(&mut c.body).compile(ctx)?;
        }
        Ok(Expr::Try(self))
    }

    pub(crate) fn iter<'e>(&'e self, ctx: &mut QueryContext<'_>) -> Result<Iter<'e>, Error> {
        let mark = ctx.updates().len();
        let err = match self.body.value(ctx) {
            Ok(v) => return Ok(sequence::value(v)),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => e,
        };
        let Some(catch) = self.catches.iter().find(|c| c.matches(&err)) else {
            return Err(err);
        };
        tracing::debug!(code = %err.format_code(), "caught dynamic error");
        // updates collected by the failed body are discarded
        ctx.updates_mut().truncate(mark);
        let mut scope = ctx.scope();
        if let Some(v) = &catch.vars.code {
            let code = XdmAtomicValue::QName {
                ns_uri: err.code.ns_uri.clone(),
                prefix: err.code.ns_uri.as_ref().map(|_| "err".to_string()),
                local: err.code.local.clone(),
            };
            scope.bind(v, vec![XdmItem::Atomic(code)]);
        }
        if let Some(v) = &catch.vars.description {
            scope.bind(v, vec![XdmItem::Atomic(XdmAtomicValue::String(err.message.clone()))]);
        }
        if let Some(v) = &catch.vars.value {
            scope.bind(v, err.value.clone().unwrap_or_default());
        }
        let out = catch.body.value(&mut scope)?;
        Ok(sequence::value(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{CmpG, CmpOp, CmpR, Pos, Step, path::Path};
    use crate::runtime::ErrorCode;
    use crate::simple_store::{doc, elem};

    #[test]
    fn positional_conjunction_intersects() {
        let store = doc().child(elem("a")).build();
        let mut ctx = QueryContext::new(&store);
        let a = Expr::Pos(Pos::new(1, 3).unwrap());
        let b = Expr::Pos(Pos::new(2, 5).unwrap());
        let e = compile_and(vec![a.clone(), b.clone()], &mut ctx).unwrap();
        assert_eq!(e, Expr::Pos(Pos::new(2, 3).unwrap()));
        let c = Expr::Pos(Pos::new(2, 4).unwrap());
        let u = compile_or(vec![a, c], &mut ctx).unwrap();
        assert_eq!(u, Expr::Pos(Pos::new(1, 4).unwrap()));
    }

    #[test]
    fn disjoint_ranges_collapse_to_false() {
        let store = doc().child(elem("a")).build();
        let mut ctx = QueryContext::new(&store);
        let price = Expr::Path(Path::relative(vec![Step::attr("price")]));
        let inf = f64::INFINITY;
        let lo = Expr::CmpR(CmpR::new(price.clone(), 6.0, true, inf, true));
        let hi = Expr::CmpR(CmpR::new(price, -inf, true, 5.0, true));
        assert_eq!(compile_and(vec![lo, hi], &mut ctx).unwrap(), Expr::boolean(false));
    }

    #[test]
    fn literal_operands_short_circuit() {
        let store = doc().child(elem("a")).build();
        let mut ctx = QueryContext::new(&store);
        let cmp = Expr::CmpG(CmpG::new(CmpOp::Eq, Expr::Context, Expr::int(1)));
        let e = compile_and(vec![Expr::boolean(true), cmp.clone()], &mut ctx).unwrap();
        assert_eq!(e, cmp);
        let e = compile_or(vec![cmp, Expr::boolean(true)], &mut ctx).unwrap();
        assert_eq!(e, Expr::boolean(true));
    }

    #[test]
    fn catch_binds_code_and_rolls_back() {
        let store = doc().child(elem("a")).build();
        let mut ctx = QueryContext::new(&store);
        let code = Var::new("code");
        let body = Expr::Arith(crate::expr::Arith::new(
            crate::expr::Calc::IDiv,
            Expr::int(1),
            Expr::int(0),
        ));
        let t = Try::new(
            body,
            vec![
                Catch::new(vec![CatchCode::Local("FOAR0001".into())], Expr::var(&code))
                    .with_vars(ErrVars {
                        code: Some(code.clone()),
                        ..ErrVars::default()
                    }),
            ],
        );
        let out = Expr::Try(t).value(&mut ctx).unwrap();
        let expected = ErrorCode::FOAR0001.qname();
        assert!(matches!(
            &out[..],
            [XdmItem::Atomic(XdmAtomicValue::QName { local, ns_uri, .. })]
                if *local == expected.local && *ns_uri == expected.ns_uri
        ));
    }
}
