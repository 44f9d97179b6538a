//! Arithmetic operators.
use super::{Expr, Occ, Shape, ShapeKind, check_simple};
use crate::runtime::{Error, ErrorCode, QueryContext};
use crate::xdm::{XdmAtomicValue, parse_double};
use chrono::TimeDelta;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Calc {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
}

fn div_by_zero() -> Error {
    Error::from_code(ErrorCode::FOAR0001, "division by zero")
}

fn overflow() -> Error {
    Error::from_code(ErrorCode::FOAR0002, "numeric overflow")
}

fn untyped_number(v: XdmAtomicValue) -> Result<XdmAtomicValue, Error> {
    match v {
        XdmAtomicValue::UntypedAtomic(s) => parse_double(&s).map(XdmAtomicValue::Double).ok_or_else(|| {
            Error::from_code(
                ErrorCode::FORG0001,
                format!("cannot convert \"{s}\" to a number"),
            )
        }),
        other => Ok(other),
    }
}

impl Calc {
    pub fn symbol(self) -> &'static str {
        match self {
            Calc::Add => "+",
            Calc::Sub => "-",
            Calc::Mul => "*",
            Calc::Div => "div",
            Calc::IDiv => "idiv",
            Calc::Mod => "mod",
        }
    }

    /// Apply the operator to two atomic operands.
    pub fn eval(self, a: XdmAtomicValue, b: XdmAtomicValue) -> Result<XdmAtomicValue, Error> {
        use XdmAtomicValue as V;
        let (a, b) = (untyped_number(a)?, untyped_number(b)?);
        match (&a, &b) {
            (V::Integer(x), V::Integer(y)) => self.integers(*x, *y),
            (V::Double(_), _) | (_, V::Double(_)) if a.is_numeric() && b.is_numeric() => {
                self.floats(a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN), V::Double)
            }
            (V::Float(_), _) | (_, V::Float(_)) if a.is_numeric() && b.is_numeric() => {
                self.floats(a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN), |f| {
                    V::Float(f as f32)
                })
            }
            _ if a.is_numeric() && b.is_numeric() => self.decimals(
                a.as_f64().unwrap_or(f64::NAN),
                b.as_f64().unwrap_or(f64::NAN),
            ),
            _ => self.temporal(&a, &b),
        }
    }

    fn integers(self, x: i64, y: i64) -> Result<XdmAtomicValue, Error> {
        let r = match self {
            Calc::Add => x.checked_add(y),
            Calc::Sub => x.checked_sub(y),
            Calc::Mul => x.checked_mul(y),
            Calc::Div => {
                if y == 0 {
                    return Err(div_by_zero());
                }
                return Ok(XdmAtomicValue::Decimal(x as f64 / y as f64));
            }
            Calc::IDiv => {
                if y == 0 {
                    return Err(div_by_zero());
                }
                x.checked_div(y)
            }
            Calc::Mod => {
                if y == 0 {
                    return Err(div_by_zero());
                }
                x.checked_rem(y)
            }
        };
        r.map(XdmAtomicValue::Integer).ok_or_else(overflow)
    }

    fn decimals(self, x: f64, y: f64) -> Result<XdmAtomicValue, Error> {
        let r = match self {
            Calc::Add => x + y,
            Calc::Sub => x - y,
            Calc::Mul => x * y,
            Calc::Div | Calc::IDiv | Calc::Mod if y == 0.0 => return Err(div_by_zero()),
            Calc::Div => x / y,
            Calc::IDiv => return idiv(x, y),
            Calc::Mod => x % y,
        };
        if !r.is_finite() {
            return Err(overflow());
        }
        Ok(XdmAtomicValue::Decimal(r))
    }

    /// IEEE arithmetic; only `idiv` can fail.
    fn floats(
        self,
        x: f64,
        y: f64,
        wrap: impl Fn(f64) -> XdmAtomicValue,
    ) -> Result<XdmAtomicValue, Error> {
        Ok(wrap(match self {
            Calc::Add => x + y,
            Calc::Sub => x - y,
            Calc::Mul => x * y,
            Calc::Div => x / y,
            Calc::Mod => x % y,
            Calc::IDiv => return idiv(x, y),
        }))
    }

    fn temporal(self, a: &XdmAtomicValue, b: &XdmAtomicValue) -> Result<XdmAtomicValue, Error> {
        use XdmAtomicValue as V;
        let bad = || {
            Error::type_err(format!(
                "operator {} is not defined for {} and {}",
                self.symbol(),
                a.atomic_type(),
                b.atomic_type()
            ))
        };
        match (self, a, b) {
            (Calc::Add, V::YearMonthDuration(x), V::YearMonthDuration(y)) => {
                x.checked_add(*y).map(V::YearMonthDuration).ok_or_else(overflow)
            }
            (Calc::Sub, V::YearMonthDuration(x), V::YearMonthDuration(y)) => {
                x.checked_sub(*y).map(V::YearMonthDuration).ok_or_else(overflow)
            }
            (Calc::Add, V::DayTimeDuration(x), V::DayTimeDuration(y)) => {
                x.checked_add(*y).map(V::DayTimeDuration).ok_or_else(overflow)
            }
            (Calc::Sub, V::DayTimeDuration(x), V::DayTimeDuration(y)) => {
                x.checked_sub(*y).map(V::DayTimeDuration).ok_or_else(overflow)
            }
            (Calc::Div, V::DayTimeDuration(x), V::DayTimeDuration(y)) => {
                if *y == 0 {
                    return Err(div_by_zero());
                }
                Ok(V::Decimal(*x as f64 / *y as f64))
            }
            (Calc::Mul | Calc::Div, V::DayTimeDuration(x), n) if n.is_numeric() => {
                let f = n.as_f64().unwrap_or(f64::NAN);
                let r = if self == Calc::Mul { *x as f64 * f } else { *x as f64 / f };
                if !r.is_finite() {
                    return Err(overflow());
                }
                Ok(V::DayTimeDuration(r.round() as i64))
            }
            (Calc::Mul, n, V::DayTimeDuration(_)) if n.is_numeric() => Calc::Mul.temporal(b, a),
            (Calc::Add | Calc::Sub, V::DateTime(dt), V::DayTimeDuration(secs)) => {
                let delta = TimeDelta::try_seconds(*secs).ok_or_else(overflow)?;
                let r = if self == Calc::Add {
                    dt.checked_add_signed(delta)
                } else {
                    dt.checked_sub_signed(delta)
                };
                r.map(V::DateTime).ok_or_else(overflow)
            }
            (Calc::Sub, V::DateTime(x), V::DateTime(y)) => {
                Ok(V::DayTimeDuration(x.signed_duration_since(*y).num_seconds()))
            }
            (Calc::Add | Calc::Sub, V::Date { date, tz }, V::DayTimeDuration(secs)) => {
                let days = TimeDelta::try_days(secs / 86_400).ok_or_else(overflow)?;
                let r = if self == Calc::Add {
                    date.checked_add_signed(days)
                } else {
                    date.checked_sub_signed(days)
                };
                r.map(|date| V::Date { date, tz: *tz }).ok_or_else(overflow)
            }
            (Calc::Sub, V::Date { date: x, .. }, V::Date { date: y, .. }) => {
                Ok(V::DayTimeDuration(x.signed_duration_since(*y).num_seconds()))
            }
            _ => Err(bad()),
        }
    }
}

fn idiv(x: f64, y: f64) -> Result<XdmAtomicValue, Error> {
    if y == 0.0 {
        return Err(div_by_zero());
    }
    let q = (x / y).trunc();
    if !q.is_finite() || q < i64::MIN as f64 || q > i64::MAX as f64 {
        return Err(overflow());
    }
    Ok(XdmAtomicValue::Integer(q as i64))
}

/// Binary arithmetic `lhs op rhs`; an empty operand yields the empty sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Arith {
    pub op: Calc,
    pub lhs: Box<Expr>,
    pub rhs: Box<Expr>,
}

impl Arith {
    pub fn new(op: Calc, lhs: Expr, rhs: Expr) -> Self {
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
        // e + 0, e - 0, e * 1, e div 1 on a single numeric operand
        let lhs_shape = self.lhs.shape();
        if lhs_shape.kind == ShapeKind::Numeric
            && lhs_shape.is_single()
            && let Expr::Literal(XdmAtomicValue::Integer(n)) = &*self.rhs
            && matches!((self.op, n), (Calc::Add | Calc::Sub, 0) | (Calc::Mul | Calc::Div, 1))
        {
            return Ok(*self.lhs);
        }
        Ok(Expr::Arith(self))
    }

    pub(crate) fn eval(&self, ctx: &mut QueryContext<'_>) -> Result<Option<XdmAtomicValue>, Error> {
        let Some(a) = self.lhs.atomic_opt(ctx)? else {
            return Ok(None);
        };
        let Some(b) = self.rhs.atomic_opt(ctx)? else {
            return Ok(None);
        };
        self.op.eval(a, b).map(Some)
    }

    pub fn shape(&self) -> Shape {
        let (l, r) = (self.lhs.shape(), self.rhs.shape());
        let kind = if l.kind == ShapeKind::Atomic || r.kind == ShapeKind::Atomic {
            ShapeKind::Atomic
        } else {
            ShapeKind::Numeric
        };
        let occ = if l.is_single() && r.is_single() {
            Occ::One
        } else {
            Occ::ZeroOrOne
        };
        Shape::new(kind, occ)
    }
}

pub(crate) fn compile_neg(e: Expr, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
    let e = e.compile(ctx)?;
    check_simple(&e)?;
    if e.is_empty_value() {
        return Ok(Expr::empty());
    }
    Ok(Expr::Neg(Box::new(e)))
}

pub(crate) fn eval_neg(e: &Expr, ctx: &mut QueryContext<'_>) -> Result<Option<XdmAtomicValue>, Error> {
    use XdmAtomicValue as V;
    let Some(v) = e.atomic_opt(ctx)? else {
        return Ok(None);
    };
    let r = match untyped_number(v)? {
        V::Integer(i) => V::Integer(i.checked_neg().ok_or_else(overflow)?),
        V::Decimal(d) => V::Decimal(-d),
        V::Double(d) => V::Double(-d),
        V::Float(f) => V::Float(-f),
        V::YearMonthDuration(m) => V::YearMonthDuration(-m),
        V::DayTimeDuration(s) => V::DayTimeDuration(-s),
        other => {
            return Err(Error::type_err(format!(
                "unary minus is not defined for {}",
                other.atomic_type()
            )));
        }
    };
    Ok(Some(r))
}

#[cfg(test)]
mod tests {
    use super::*;
    use XdmAtomicValue as V;

    #[test]
    fn integer_arithmetic_is_checked() {
        assert_eq!(Calc::Add.eval(V::Integer(2), V::Integer(3)).unwrap(), V::Integer(5));
        assert_eq!(Calc::Div.eval(V::Integer(7), V::Integer(2)).unwrap(), V::Decimal(3.5));
        assert_eq!(Calc::IDiv.eval(V::Integer(-7), V::Integer(2)).unwrap(), V::Integer(-3));
        assert_eq!(Calc::Mod.eval(V::Integer(-7), V::Integer(2)).unwrap(), V::Integer(-1));
        assert!(Calc::Mul.eval(V::Integer(i64::MAX), V::Integer(2)).unwrap_err().is(ErrorCode::FOAR0002));
        assert!(Calc::IDiv.eval(V::Integer(1), V::Integer(0)).unwrap_err().is(ErrorCode::FOAR0001));
    }

    #[test]
    fn doubles_follow_ieee() {
        assert_eq!(Calc::Div.eval(V::Double(1.0), V::Integer(0)).unwrap(), V::Double(f64::INFINITY));
        assert_eq!(Calc::Add.eval(V::UntypedAtomic("1.5".into()), V::Integer(1)).unwrap(), V::Double(2.5));
        assert!(Calc::IDiv.eval(V::Double(1.0), V::Double(0.0)).unwrap_err().is(ErrorCode::FOAR0001));
    }

    #[test]
    fn durations_add_up() {
        assert_eq!(
            Calc::Add.eval(V::DayTimeDuration(60), V::DayTimeDuration(30)).unwrap(),
            V::DayTimeDuration(90)
        );
        assert!(Calc::Add.eval(V::Boolean(true), V::Integer(1)).unwrap_err().is(ErrorCode::XPTY0004));
    }
}
