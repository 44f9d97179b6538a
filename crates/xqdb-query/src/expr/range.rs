//! Range comparisons synthesized from comparisons of a single-step path
//! against a literal bound.
use super::compare::{CmpOp, compare_general, compare_value};
use super::path::{Axis, Path, Step};
use super::{Expr, check_simple};
use crate::runtime::{Error, QueryContext};
use crate::xdm::XdmAtomicValue;

/// Numeric range test `min <(=) expr <(=) max`.
#[derive(Debug, Clone, PartialEq)]
pub struct CmpR {
    pub expr: Box<Expr>,
    pub min: f64,
    pub min_incl: bool,
    pub max: f64,
    pub max_incl: bool,
    /// Derived from a value comparison: the operand must be at most one item.
    pub single: bool,
}

/// String range test with codepoint ordering; `None` bounds are open.
#[derive(Debug, Clone, PartialEq)]
pub struct CmpSR {
    pub expr: Box<Expr>,
    pub min: Option<String>,
    pub min_incl: bool,
    pub max: Option<String>,
    pub max_incl: bool,
    pub single: bool,
}

/// The step of a relative, predicate-free, single-step path.
pub(crate) fn single_step(e: &Expr) -> Option<&Step> {
    match e {
        Expr::Path(Path { input: None, steps }) if steps.len() == 1 => {
            let step = &steps[0];
            (step.preds.is_empty()
                && matches!(step.axis, Axis::Child | Axis::Attribute | Axis::Descendant))
            .then_some(step)
        }
        _ => None,
    }
}

/// Rewrite `path op literal` into a range comparison.
pub(crate) fn from_comparison(op: CmpOp, lhs: &Expr, rhs: &Expr, single: bool) -> Option<Expr> {
    single_step(lhs)?;
    let Expr::Literal(lit) = rhs else {
        return None;
    };
    if lit.is_numeric() {
        let v = lit.as_f64()?;
        if v.is_nan() {
            return None;
        }
        let (inf, sup) = (f64::NEG_INFINITY, f64::INFINITY);
        let (min, min_incl, max, max_incl) = match op {
            CmpOp::Eq => (v, true, v, true),
            CmpOp::Lt => (inf, true, v, false),
            CmpOp::Le => (inf, true, v, true),
            CmpOp::Gt => (v, false, sup, true),
            CmpOp::Ge => (v, true, sup, true),
            CmpOp::Ne => return None,
        };
        return Some(Expr::CmpR(CmpR {
            expr: Box::new(lhs.clone()),
            min,
            min_incl,
            max,
            max_incl,
            single,
        }));
    }
    let XdmAtomicValue::String(s) = lit else {
        return None;
    };
    let s = Some(s.clone());
    let (min, min_incl, max, max_incl) = match op {
        CmpOp::Lt => (None, true, s, false),
        CmpOp::Le => (None, true, s, true),
        CmpOp::Gt => (s, false, None, true),
        CmpOp::Ge => (s, true, None, true),
        // equality is left to the text and attribute indexes
        CmpOp::Eq | CmpOp::Ne => return None,
    };
    Some(Expr::CmpSR(CmpSR {
        expr: Box::new(lhs.clone()),
        min,
        min_incl,
        max,
        max_incl,
        single,
    }))
}

/// Tighter of two lower bounds (`upper == false`) or upper bounds.
fn tighter<T: PartialOrd + Clone>(a: (&T, bool), b: (&T, bool), upper: bool) -> (T, bool) {
    let (av, ai) = a;
    let (bv, bi) = b;
    let a_wins = if upper { av < bv } else { av > bv };
    if av == bv {
        (av.clone(), ai && bi)
    } else if a_wins {
        (av.clone(), ai)
    } else {
        (bv.clone(), bi)
    }
}

impl CmpR {
    pub fn new(expr: Expr, min: f64, min_incl: bool, max: f64, max_incl: bool) -> Self {
        Self {
            expr: Box::new(expr),
            min,
            min_incl,
            max,
            max_incl,
            single: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min > self.max || (self.min == self.max && !(self.min_incl && self.max_incl))
    }

    /// Conjunction of two ranges over the same operand. `None` if the
    /// ranges test different operands; `false` if the result is empty.
    pub fn intersect(&self, other: &CmpR) -> Option<Expr> {
        if self.expr != other.expr || self.single != other.single {
            return None;
        }
        let (min, min_incl) = tighter((&self.min, self.min_incl), (&other.min, other.min_incl), false);
        let (max, max_incl) = tighter((&self.max, self.max_incl), (&other.max, other.max_incl), true);
        let merged = CmpR {
            expr: self.expr.clone(),
            min,
            min_incl,
            max,
            max_incl,
            single: self.single,
        };
        Some(if merged.is_empty() {
            Expr::boolean(false)
        } else {
            Expr::CmpR(merged)
        })
    }

    pub fn step(&self) -> Option<&Step> {
        single_step(&self.expr)
    }

    pub(crate) fn compile(mut self, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
        self.expr = Box::new(self.expr.compile(ctx)?);
        check_simple(&self.expr)?;
        if self.is_empty() {
            return Ok(Expr::boolean(false));
        }
        Ok(Expr::CmpR(self))
    }

    fn contains(&self, a: &XdmAtomicValue) -> Result<bool, Error> {
        let cmp = if self.single { compare_value } else { compare_general };
        if self.min != f64::NEG_INFINITY {
            let op = if self.min_incl { CmpOp::Ge } else { CmpOp::Gt };
            if !cmp(a, &XdmAtomicValue::Double(self.min), op)? {
                return Ok(false);
            }
        }
        if self.max != f64::INFINITY {
            let op = if self.max_incl { CmpOp::Le } else { CmpOp::Lt };
            if !cmp(a, &XdmAtomicValue::Double(self.max), op)? {
                return Ok(false);
            }
        }
        // an unbounded side still rejects NaN
        Ok(a.as_f64().is_none_or(|v| !v.is_nan()))
    }

    pub(crate) fn eval(&self, ctx: &mut QueryContext<'_>) -> Result<Option<bool>, Error> {
        if self.single {
            return match self.expr.atomic_opt(ctx)? {
                Some(a) => self.contains(&a).map(Some),
                None => Ok(None),
            };
        }
        for a in self.expr.atomize_all(ctx)? {
            if self.contains(&a)? {
                return Ok(Some(true));
            }
        }
        Ok(Some(false))
    }
}

impl CmpSR {
    pub fn is_empty(&self) -> bool {
        match (&self.min, &self.max) {
            (Some(lo), Some(hi)) => lo > hi || (lo == hi && !(self.min_incl && self.max_incl)),
            _ => false,
        }
    }

    /// Conjunction of two string ranges over the same operand.
    pub fn intersect(&self, other: &CmpSR) -> Option<Expr> {
        if self.expr != other.expr || self.single != other.single {
            return None;
        }
        let lower = |a: &Option<String>, ai, b: &Option<String>, bi| match (a, b) {
            (Some(x), Some(y)) => {
                let (v, i) = tighter((x, ai), (y, bi), false);
                (Some(v), i)
            }
            (Some(x), None) => (Some(x.clone()), ai),
            (None, y) => (y.clone(), bi),
        };
        let upper = |a: &Option<String>, ai, b: &Option<String>, bi| match (a, b) {
            (Some(x), Some(y)) => {
                let (v, i) = tighter((x, ai), (y, bi), true);
                (Some(v), i)
            }
            (Some(x), None) => (Some(x.clone()), ai),
            (None, y) => (y.clone(), bi),
        };
        let (min, min_incl) = lower(&self.min, self.min_incl, &other.min, other.min_incl);
        let (max, max_incl) = upper(&self.max, self.max_incl, &other.max, other.max_incl);
        let merged = CmpSR {
            expr: self.expr.clone(),
            min,
            min_incl,
            max,
            max_incl,
            single: self.single,
        };
        Some(if merged.is_empty() {
            Expr::boolean(false)
        } else {
            Expr::CmpSR(merged)
        })
    }

    pub fn step(&self) -> Option<&Step> {
        single_step(&self.expr)
    }

    pub(crate) fn compile(mut self, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
        self.expr = Box::new(self.expr.compile(ctx)?);
        check_simple(&self.expr)?;
        if self.is_empty() {
            return Ok(Expr::boolean(false));
        }
        Ok(Expr::CmpSR(self))
    }

    fn contains(&self, a: &XdmAtomicValue) -> Result<bool, Error> {
        let cmp = if self.single { compare_value } else { compare_general };
        if let Some(lo) = &self.min {
            let op = if self.min_incl { CmpOp::Ge } else { CmpOp::Gt };
            if !cmp(a, &XdmAtomicValue::String(lo.clone()), op)? {
                return Ok(false);
            }
        }
        if let Some(hi) = &self.max {
            let op = if self.max_incl { CmpOp::Le } else { CmpOp::Lt };
            if !cmp(a, &XdmAtomicValue::String(hi.clone()), op)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub(crate) fn eval(&self, ctx: &mut QueryContext<'_>) -> Result<Option<bool>, Error> {
        if self.single {
            return match self.expr.atomic_opt(ctx)? {
                Some(a) => self.contains(&a).map(Some),
                None => Ok(None),
            };
        }
        for a in self.expr.atomize_all(ctx)? {
            if self.contains(&a)? {
                return Ok(Some(true));
            }
        }
        Ok(Some(false))
    }
}
