//! General, value and node comparisons.
use super::pos::Pos;
use super::{Expr, atomize, check_simple, range};
use crate::functions::Builtin;
use crate::runtime::{Error, QueryContext};
use crate::xdm::{XdmAtomicValue, XdmItem, parse_double};
use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use core::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// Operator with its operands exchanged (`a < b` is `b > a`).
    pub fn swap(self) -> CmpOp {
        match self {
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
            other => other,
        }
    }

    pub fn holds(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

/// Unified numeric representation with minimal promotion.
#[derive(Clone, Copy)]
enum NumKind {
    Int(i64),
    Dec(f64),
    Float(f32),
    Double(f64),
}

impl NumKind {
    fn classify(v: &XdmAtomicValue) -> Option<NumKind> {
        match v {
            XdmAtomicValue::Integer(i) => Some(NumKind::Int(*i)),
            XdmAtomicValue::Decimal(d) => Some(NumKind::Dec(*d)),
            XdmAtomicValue::Float(f) => Some(NumKind::Float(*f)),
            XdmAtomicValue::Double(d) => Some(NumKind::Double(*d)),
            _ => None,
        }
    }

    fn to_f64(self) -> f64 {
        match self {
            NumKind::Int(i) => i as f64,
            NumKind::Dec(d) | NumKind::Double(d) => d,
            NumKind::Float(f) => f as f64,
        }
    }

    fn compare(a: NumKind, b: NumKind) -> Option<Ordering> {
        use NumKind::*;
        match (a, b) {
            (Int(x), Int(y)) => Some(x.cmp(&y)),
            (Double(_), _) | (_, Double(_)) => a.to_f64().partial_cmp(&b.to_f64()),
            (Float(_), _) | (_, Float(_)) => (a.to_f64() as f32).partial_cmp(&(b.to_f64() as f32)),
            _ => a.to_f64().partial_cmp(&b.to_f64()),
        }
    }
}

fn untyped_to_double(s: &str) -> Result<XdmAtomicValue, Error> {
    parse_double(s)
        .map(XdmAtomicValue::Double)
        .ok_or_else(|| {
            Error::from_code(
                crate::runtime::ErrorCode::FORG0001,
                format!("cannot convert \"{s}\" to a number"),
            )
        })
}

/// Coerce untyped operands of a general comparison toward the other side.
fn coerce_general(
    a: &XdmAtomicValue,
    b: &XdmAtomicValue,
) -> Result<(XdmAtomicValue, XdmAtomicValue), Error> {
    use XdmAtomicValue as V;
    let coerce = |s: &str, other: &V| -> Result<V, Error> {
        if other.is_numeric() {
            untyped_to_double(s)
        } else if other.is_string_like() {
            Ok(V::String(s.to_string()))
        } else {
            super::types::cast_atomic(V::UntypedAtomic(s.to_string()), other.atomic_type())
        }
    };
    Ok(match (a, b) {
        (V::UntypedAtomic(x), V::UntypedAtomic(y)) => (V::String(x.clone()), V::String(y.clone())),
        (V::UntypedAtomic(s), other) => (coerce(s, other)?, other.clone()),
        (other, V::UntypedAtomic(s)) => (other.clone(), coerce(s, other)?),
        _ => (a.clone(), b.clone()),
    })
}

fn date_instant(date: NaiveDate, tz: Option<FixedOffset>) -> Option<DateTime<FixedOffset>> {
    date.and_time(chrono::NaiveTime::default())
        .and_local_timezone(tz.unwrap_or_else(|| Utc.fix()))
        .single()
}

/// Order of two comparable atomic values; `None` when either side is NaN.
/// Strings compare by codepoint.
pub fn atomic_ordering(
    a: &XdmAtomicValue,
    b: &XdmAtomicValue,
) -> Result<Option<Ordering>, Error> {
    use XdmAtomicValue as V;
    if let (Some(x), Some(y)) = (NumKind::classify(a), NumKind::classify(b)) {
        return Ok(NumKind::compare(x, y));
    }
    if a.is_string_like() && b.is_string_like() {
        return Ok(Some(a.lexical().cmp(&b.lexical())));
    }
    let ord = match (a, b) {
        (V::Boolean(x), V::Boolean(y)) => x.cmp(y),
        (V::DateTime(x), V::DateTime(y)) => x.cmp(y),
        (V::Date { date: da, tz: ta }, V::Date { date: db, tz: tb }) => {
            match (date_instant(*da, *ta), date_instant(*db, *tb)) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => da.cmp(db),
            }
        }
        (V::Time { time: ta, tz: za }, V::Time { time: tb, tz: zb }) => {
            let off = |z: &Option<FixedOffset>| z.map_or(0, |o| o.local_minus_utc());
            let secs = |t: &chrono::NaiveTime, z| {
                i64::from(chrono::Timelike::num_seconds_from_midnight(t)) - i64::from(off(z))
            };
            secs(ta, za)
                .cmp(&secs(tb, zb))
                .then(chrono::Timelike::nanosecond(ta).cmp(&chrono::Timelike::nanosecond(tb)))
        }
        (V::YearMonthDuration(x), V::YearMonthDuration(y)) => x.cmp(y),
        (V::DayTimeDuration(x), V::DayTimeDuration(y)) => x.cmp(y),
        _ => {
            return Err(Error::type_err(format!(
                "{} and {} are not comparable",
                a.atomic_type(),
                b.atomic_type()
            )));
        }
    };
    Ok(Some(ord))
}

fn compare_normalized(a: &XdmAtomicValue, b: &XdmAtomicValue, op: CmpOp) -> Result<bool, Error> {
    use XdmAtomicValue as V;
    // QNames only support equality; prefixes are ignored
    if let (
        V::QName {
            ns_uri: na,
            local: la,
            ..
        },
        V::QName {
            ns_uri: nb,
            local: lb,
            ..
        },
    ) = (a, b)
    {
        let eq = na == nb && la == lb;
        return match op {
            CmpOp::Eq => Ok(eq),
            CmpOp::Ne => Ok(!eq),
            _ => Err(Error::type_err("relational comparison of xs:QName values")),
        };
    }
    match atomic_ordering(a, b)? {
        Some(ord) => Ok(op.holds(ord)),
        None => Ok(op == CmpOp::Ne),
    }
}

/// Scalar comparison used by general comparisons: untyped values are
/// coerced toward the type of the other operand.
pub fn compare_general(a: &XdmAtomicValue, b: &XdmAtomicValue, op: CmpOp) -> Result<bool, Error> {
    let (a, b) = coerce_general(a, b)?;
    compare_normalized(&a, &b, op)
}

/// Scalar comparison used by value comparisons: untyped values compare as strings.
pub fn compare_value(a: &XdmAtomicValue, b: &XdmAtomicValue, op: CmpOp) -> Result<bool, Error> {
    let as_string = |v: &XdmAtomicValue| match v {
        XdmAtomicValue::UntypedAtomic(s) => XdmAtomicValue::String(s.clone()),
        other => other.clone(),
    };
    compare_normalized(&as_string(a), &as_string(b), op)
}

fn is_position_call(e: &Expr) -> bool {
    matches!(e, Expr::Call(f) if f.func == Builtin::Position && f.args.is_empty())
}

/// `position() op n` with a numeric literal on either side.
fn position_rewrite(op: CmpOp, lhs: &Expr, rhs: &Expr) -> Option<Expr> {
    match (lhs, rhs) {
        (l, Expr::Literal(v)) if is_position_call(l) => Pos::from_cmp(op, v.as_f64()?),
        (Expr::Literal(v), r) if is_position_call(r) => Pos::from_cmp(op.swap(), v.as_f64()?),
        _ => None,
    }
}

/// Existential comparison over two sequences (`=`, `<`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct CmpG {
    pub op: CmpOp,
    pub lhs: Box<Expr>,
    pub rhs: Box<Expr>,
}

impl CmpG {
    pub fn new(op: CmpOp, lhs: Expr, rhs: Expr) -> Self {
        Self {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub(crate) fn compile(mut self, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
        self.lhs = Box::new(self.lhs.compile(ctx)?);
        self.rhs = Box::new(self.rhs.compile(ctx)?);
        check_simple(&self.lhs)?;
        check_simple(&self.rhs)?;
        if self.lhs.is_empty_value() || self.rhs.is_empty_value() {
            return Ok(Expr::boolean(false));
        }
        if let Some(p) = position_rewrite(self.op, &self.lhs, &self.rhs) {
            return Ok(p);
        }
        // constants go to the right
        if self.lhs.is_value() && !self.rhs.is_value() {
            std::mem::swap(&mut self.lhs, &mut self.rhs);
            self.op = self.op.swap();
        }
        if let Some(r) = range::from_comparison(self.op, &self.lhs, &self.rhs, false) {
            return Ok(r);
        }
        Ok(Expr::CmpG(self))
    }

    pub(crate) fn eval(&self, ctx: &mut QueryContext<'_>) -> Result<bool, Error> {
        let right = self.rhs.atomize_all(ctx)?;
        if right.is_empty() {
            return Ok(false);
        }
        let mut left = self.lhs.iter(ctx)?;
        while let Some(item) = left.next(ctx)? {
            let a = atomize(ctx, item);
            for b in &right {
                ctx.checkpoint()?;
                if compare_general(&a, b, self.op)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

/// Singleton comparison (`eq`, `lt`, ...). An empty operand yields the empty sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct CmpV {
    pub op: CmpOp,
    pub lhs: Box<Expr>,
    pub rhs: Box<Expr>,
}

impl CmpV {
    pub fn new(op: CmpOp, lhs: Expr, rhs: Expr) -> Self {
        Self {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub(crate) fn compile(mut self, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
        self.lhs = Box::new(self.lhs.compile(ctx)?);
        self.rhs = Box::new(self.rhs.compile(ctx)?);
        check_simple(&self.lhs)?;
        check_simple(&self.rhs)?;
        if self.lhs.is_empty_value() || self.rhs.is_empty_value() {
            return Ok(Expr::empty());
        }
        if let Some(p) = position_rewrite(self.op, &self.lhs, &self.rhs) {
            return Ok(p);
        }
        if self.lhs.is_value() && !self.rhs.is_value() {
            std::mem::swap(&mut self.lhs, &mut self.rhs);
            self.op = self.op.swap();
        }
        if let Some(r) = range::from_comparison(self.op, &self.lhs, &self.rhs, true) {
            return Ok(r);
        }
        Ok(Expr::CmpV(self))
    }

    pub(crate) fn eval(&self, ctx: &mut QueryContext<'_>) -> Result<Option<bool>, Error> {
        let Some(a) = self.lhs.atomic_opt(ctx)? else {
            return Ok(None);
        };
        let Some(b) = self.rhs.atomic_opt(ctx)? else {
            return Ok(None);
        };
        compare_value(&a, &b, self.op).map(Some)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOp {
    /// `is`
    Is,
    /// `<<`
    Before,
    /// `>>`
    After,
}

/// Identity and document-order comparison of two nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct CmpN {
    pub op: NodeOp,
    pub lhs: Box<Expr>,
    pub rhs: Box<Expr>,
}

impl CmpN {
    pub fn new(op: NodeOp, lhs: Expr, rhs: Expr) -> Self {
        Self {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub(crate) fn compile(mut self, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
        self.lhs = Box::new(self.lhs.compile(ctx)?);
        self.rhs = Box::new(self.rhs.compile(ctx)?);
        check_simple(&self.lhs)?;
        check_simple(&self.rhs)?;
        for side in [&self.lhs, &self.rhs] {
            if let Expr::Literal(a) = &**side {
                return Err(Error::type_err(format!(
                    "node comparison applied to {}",
                    a.atomic_type()
                )));
            }
        }
        if self.lhs.is_empty_value() || self.rhs.is_empty_value() {
            return Ok(Expr::empty());
        }
        Ok(Expr::CmpN(self))
    }

    fn node(e: &Expr, ctx: &mut QueryContext<'_>) -> Result<Option<crate::model::NodeId>, Error> {
        match e.item(ctx)? {
            None => Ok(None),
            Some(XdmItem::Node(n)) => Ok(Some(n)),
            Some(XdmItem::Atomic(a)) => Err(Error::type_err(format!(
                "node comparison applied to {}",
                a.atomic_type()
            ))),
        }
    }

    pub(crate) fn eval(&self, ctx: &mut QueryContext<'_>) -> Result<Option<bool>, Error> {
        let Some(a) = Self::node(&self.lhs, ctx)? else {
            return Ok(None);
        };
        let Some(b) = Self::node(&self.rhs, ctx)? else {
            return Ok(None);
        };
        let store = ctx.store();
        Ok(Some(match self.op {
            NodeOp::Is => a == b,
            NodeOp::Before => store.compare_order(a, b) == Ordering::Less,
            NodeOp::After => store.compare_order(a, b) == Ordering::Greater,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use XdmAtomicValue as V;

    #[test]
    fn numeric_promotion() {
        assert!(compare_general(&V::Integer(2), &V::Double(2.0), CmpOp::Eq).unwrap());
        assert!(compare_general(&V::Decimal(1.5), &V::Integer(2), CmpOp::Lt).unwrap());
        assert!(compare_general(&V::Double(f64::NAN), &V::Double(f64::NAN), CmpOp::Ne).unwrap());
        assert!(!compare_general(&V::Double(f64::NAN), &V::Double(1.0), CmpOp::Lt).unwrap());
    }

    #[test]
    fn untyped_follows_the_other_operand() {
        let u = V::UntypedAtomic("10".into());
        assert!(compare_general(&u, &V::Integer(9), CmpOp::Gt).unwrap());
        // as strings "10" sorts before "9"
        assert!(compare_general(&u, &V::String("9".into()), CmpOp::Lt).unwrap());
        assert!(compare_value(&u, &V::Integer(9), CmpOp::Gt).is_err());
    }

    #[test]
    fn incomparable_types_raise() {
        let err = compare_general(&V::Boolean(true), &V::Integer(1), CmpOp::Eq).unwrap_err();
        assert!(err.is(crate::runtime::ErrorCode::XPTY0004));
    }
}
