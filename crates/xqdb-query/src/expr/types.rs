//! Sequence types, casts and the type-testing expressions.
use super::path::NodeTest;
use super::{Expr, Shape, ShapeKind, Var, check_simple};
use crate::model::NodeKind;
use crate::runtime::{Error, ErrorCode, QueryContext};
use crate::sequence::{self, Iter};
use crate::xdm::{AtomicType, XdmAtomicValue, XdmItem, parse_double};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, Utc};

/// Occurrence indicator of a sequence type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occ {
    Zero,
    ZeroOrOne,
    One,
    ZeroOrMore,
    OneOrMore,
}

impl Occ {
    pub fn min(self) -> usize {
        match self {
            Occ::One | Occ::OneOrMore => 1,
            _ => 0,
        }
    }

    pub fn max(self) -> Option<usize> {
        match self {
            Occ::Zero => Some(0),
            Occ::ZeroOrOne | Occ::One => Some(1),
            Occ::ZeroOrMore | Occ::OneOrMore => None,
        }
    }

    pub fn max_one(self) -> bool {
        self.max().is_some_and(|m| m <= 1)
    }

    pub fn matches(self, len: usize) -> bool {
        len >= self.min() && self.max().is_none_or(|m| len <= m)
    }

    fn from_bounds(min: usize, max: Option<usize>) -> Occ {
        match (min, max) {
            (0, Some(0)) => Occ::Zero,
            (0, Some(1)) => Occ::ZeroOrOne,
            (1, Some(1)) => Occ::One,
            (0, _) => Occ::ZeroOrMore,
            _ => Occ::OneOrMore,
        }
    }

    /// Cardinality of a single-valued operator applied to this input.
    pub fn single_or_empty(self) -> Occ {
        match self {
            Occ::Zero => Occ::Zero,
            Occ::One => Occ::One,
            _ => Occ::ZeroOrOne,
        }
    }

    /// Either of two results.
    pub fn union(self, other: Occ) -> Occ {
        let max = match (self.max(), other.max()) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };
        Occ::from_bounds(self.min().min(other.min()), max)
    }

    /// Concatenation of two results.
    pub fn concat(self, other: Occ) -> Occ {
        let max = match (self.max(), other.max()) {
            (Some(a), Some(b)) => Some(a + b),
            _ => None,
        };
        Occ::from_bounds(self.min() + other.min(), max)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemType {
    AnyItem,
    AnyNode,
    Kind(NodeTest),
    Atomic(AtomicType),
}

impl ItemType {
    pub fn matches(&self, ctx: &QueryContext<'_>, item: &XdmItem) -> bool {
        match (self, item) {
            (ItemType::AnyItem, _) => true,
            (ItemType::AnyNode, XdmItem::Node(_)) => true,
            (ItemType::Kind(test), XdmItem::Node(n)) => {
                test.matches(ctx.store(), *n, NodeKind::Element)
            }
            (ItemType::Atomic(t), XdmItem::Atomic(a)) => a.atomic_type().derives_from(*t),
            _ => false,
        }
    }

    fn shape_kind(&self) -> ShapeKind {
        match self {
            ItemType::AnyItem => ShapeKind::Item,
            ItemType::AnyNode | ItemType::Kind(_) => ShapeKind::Node,
            ItemType::Atomic(t) => atomic_shape(*t),
        }
    }
}

fn atomic_shape(t: AtomicType) -> ShapeKind {
    match t {
        AtomicType::Boolean => ShapeKind::Boolean,
        AtomicType::String => ShapeKind::String,
        t if t.is_numeric() => ShapeKind::Numeric,
        _ => ShapeKind::Atomic,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeqType {
    pub item: ItemType,
    pub occ: Occ,
}

impl SeqType {
    pub fn new(item: ItemType, occ: Occ) -> Self {
        Self { item, occ }
    }

    /// `empty-sequence()`
    pub fn empty() -> Self {
        Self::new(ItemType::AnyItem, Occ::Zero)
    }

    pub fn atomic(t: AtomicType, occ: Occ) -> Self {
        Self::new(ItemType::Atomic(t), occ)
    }

    pub fn nodes(occ: Occ) -> Self {
        Self::new(ItemType::AnyNode, occ)
    }

    pub fn shape(&self) -> Shape {
        Shape::new(self.item.shape_kind(), self.occ)
    }

    pub fn matches(&self, ctx: &QueryContext<'_>, seq: &[XdmItem]) -> bool {
        self.occ.matches(seq.len()) && seq.iter().all(|i| self.item.matches(ctx, i))
    }
}

/// `cast as` / `castable as`
#[derive(Debug, Clone, PartialEq)]
pub struct Cast {
    pub expr: Box<Expr>,
    pub target: AtomicType,
    /// `?` after the target type: the empty sequence is accepted.
    pub optional: bool,
}

impl Cast {
    pub fn new(expr: Expr, target: AtomicType, optional: bool) -> Self {
        Self {
            expr: Box::new(expr),
            target,
            optional,
        }
    }

    fn check_target(&self) -> Result<(), Error> {
        if matches!(self.target, AtomicType::AnyAtomic | AtomicType::Numeric) {
            return Err(Error::type_err(format!(
                "{} is not a valid cast target",
                self.target
            )));
        }
        Ok(())
    }

    pub(crate) fn compile(mut self, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
        self.check_target()?;
        self.expr = Box::new(self.expr.compile(ctx)?);
        check_simple(&self.expr)?;
        if let Expr::Literal(a) = &*self.expr
            && a.atomic_type() == self.target
        {
            return Ok(*self.expr);
        }
        Ok(Expr::Cast(self))
    }

    pub(crate) fn compile_castable(mut self, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
        self.check_target()?;
        self.expr = Box::new(self.expr.compile(ctx)?);
        check_simple(&self.expr)?;
        Ok(Expr::Castable(self))
    }

    pub(crate) fn eval(&self, ctx: &mut QueryContext<'_>) -> Result<Option<XdmAtomicValue>, Error> {
        match self.expr.atomic_opt(ctx)? {
            Some(a) => cast_atomic(a, self.target).map(Some),
            None if self.optional => Ok(None),
            None => Err(Error::type_err(format!(
                "empty sequence cannot be cast to {}",
                self.target
            ))),
        }
    }

    pub(crate) fn eval_castable(&self, ctx: &mut QueryContext<'_>) -> Result<bool, Error> {
        let values = self.expr.atomize_all(ctx)?;
        Ok(match values.len() {
            0 => self.optional,
            1 => values
                .into_iter()
                .next()
                .is_some_and(|a| cast_atomic(a, self.target).is_ok()),
            _ => false,
        })
    }

    pub fn shape(&self) -> Shape {
        let occ = if self.optional { Occ::ZeroOrOne } else { Occ::One };
        Shape::new(atomic_shape(self.target), occ)
    }
}

/// `treat as`
#[derive(Debug, Clone, PartialEq)]
pub struct Treat {
    pub expr: Box<Expr>,
    pub ty: SeqType,
}

impl Treat {
    pub fn new(expr: Expr, ty: SeqType) -> Self {
        Self {
            expr: Box::new(expr),
            ty,
        }
    }

    pub(crate) fn compile(mut self, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
        self.expr = Box::new(self.expr.compile(ctx)?);
        check_simple(&self.expr)?;
        Ok(Expr::Treat(self))
    }

    pub(crate) fn iter<'e>(&'e self, ctx: &mut QueryContext<'_>) -> Result<Iter<'e>, Error> {
        let seq = self.expr.value(ctx)?;
        if !self.ty.occ.matches(seq.len()) {
            return Err(Error::from_code(
                ErrorCode::XPDY0050,
                format!("treat as failed: cardinality mismatch ({} items)", seq.len()),
            ));
        }
        if let Some(bad) = seq.iter().find(|i| !self.ty.item.matches(ctx, i)) {
            return Err(Error::from_code(
                ErrorCode::XPDY0050,
                format!("treat as failed: type mismatch for {bad:?}"),
            )
            .with_value(vec![bad.clone()]));
        }
        Ok(sequence::value(seq))
    }
}

/// `instance of`
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub expr: Box<Expr>,
    pub ty: SeqType,
}

impl Instance {
    pub fn new(expr: Expr, ty: SeqType) -> Self {
        Self {
            expr: Box::new(expr),
            ty,
        }
    }

    pub(crate) fn compile(mut self, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
        self.expr = Box::new(self.expr.compile(ctx)?);
        check_simple(&self.expr)?;
        // a statically known cardinality mismatch decides the test
        let occ = self.expr.shape().occ;
        if !self.expr.has(super::Flag::Ndt)
            && occ != Occ::ZeroOrMore
            && occ.max().is_some_and(|m| m < self.ty.occ.min())
        {
            return Ok(Expr::boolean(false));
        }
        Ok(Expr::Instance(self))
    }

    pub(crate) fn eval(&self, ctx: &mut QueryContext<'_>) -> Result<bool, Error> {
        let seq = self.expr.value(ctx)?;
        Ok(self.ty.matches(ctx, &seq))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeCase {
    pub var: Option<Var>,
    /// Alternatives; empty for the `default` branch.
    pub types: Vec<SeqType>,
    pub ret: Expr,
}

impl TypeCase {
    pub fn new(var: Option<Var>, types: Vec<SeqType>, ret: Expr) -> Self {
        Self { var, types, ret }
    }

    fn matches(&self, ctx: &QueryContext<'_>, seq: &[XdmItem]) -> bool {
        self.types.iter().any(|t| t.matches(ctx, seq))
    }
}

/// `typeswitch`
#[derive(Debug, Clone, PartialEq)]
pub struct TypeSwitch {
    pub operand: Box<Expr>,
    pub cases: Vec<TypeCase>,
    pub default: Box<TypeCase>,
}

impl TypeSwitch {
    pub fn new(operand: Expr, cases: Vec<TypeCase>, default: TypeCase) -> Self {
        Self {
            operand: Box::new(operand),
            cases,
            default: Box::new(default),
        }
    }

    pub(crate) fn compile(mut self, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
        self.operand = Box::new(self.operand.compile(ctx)?);
        check_simple(&self.operand)?;
        for case in self.cases.iter_mut().chain(std::iter::once(&mut *self.default)) {
            case.ret = std::mem::take(&mut case.ret).compile(ctx)?;
        }
        if let Expr::Value(_) | Expr::Literal(_) = &*self.operand {
            let seq = self.operand.value(ctx)?;
            let chosen = self
                .cases
                .iter()
                .find(|c| c.matches(ctx, &seq))
                .unwrap_or(&*self.default);
            if chosen.var.is_none() {
                return Ok(chosen.ret.clone());
            }
        }
        Ok(Expr::TypeSwitch(self))
    }

    pub(crate) fn iter<'e>(&'e self, ctx: &mut QueryContext<'_>) -> Result<Iter<'e>, Error> {
        let seq = self.operand.value(ctx)?;
        let case = self
            .cases
            .iter()
            .find(|c| c.matches(ctx, &seq))
            .unwrap_or(&*self.default);
        let mut scope = ctx.scope();
        if let Some(v) = &case.var {
            scope.bind(v, seq);
        }
        let out = case.ret.value(&mut scope)?;
        Ok(sequence::value(out))
    }
}

fn cast_err(a: &XdmAtomicValue, target: AtomicType) -> Error {
    Error::type_err(format!("cannot cast {} to {}", a.atomic_type(), target))
}

fn lexical_err(s: &str, target: AtomicType) -> Error {
    Error::from_code(
        ErrorCode::FORG0001,
        format!("invalid lexical value \"{s}\" for {target}"),
    )
}

/// Cast a single atomic value to `target`.
pub fn cast_atomic(a: XdmAtomicValue, target: AtomicType) -> Result<XdmAtomicValue, Error> {
    use XdmAtomicValue as V;
    if a.atomic_type() == target {
        return Ok(a);
    }
    match target {
        AtomicType::String => Ok(V::String(a.lexical())),
        AtomicType::UntypedAtomic => Ok(V::UntypedAtomic(a.lexical())),
        AtomicType::AnyUri => match a {
            V::String(s) | V::UntypedAtomic(s) => Ok(V::AnyUri(s.trim().to_string())),
            other => Err(cast_err(&other, target)),
        },
        AtomicType::Boolean => match a {
            V::String(s) | V::UntypedAtomic(s) => match s.trim() {
                "true" | "1" => Ok(V::Boolean(true)),
                "false" | "0" => Ok(V::Boolean(false)),
                _ => Err(lexical_err(&s, target)),
            },
            V::Integer(i) => Ok(V::Boolean(i != 0)),
            V::Decimal(d) | V::Double(d) => Ok(V::Boolean(d != 0.0 && !d.is_nan())),
            V::Float(f) => Ok(V::Boolean(f != 0.0 && !f.is_nan())),
            other => Err(cast_err(&other, target)),
        },
        AtomicType::Integer => match a {
            V::String(s) | V::UntypedAtomic(s) => {
                let t = s.trim();
                t.strip_prefix('+')
                    .unwrap_or(t)
                    .parse::<i64>()
                    .map(V::Integer)
                    .map_err(|_| lexical_err(&s, target))
            }
            V::Boolean(b) => Ok(V::Integer(i64::from(b))),
            V::Decimal(d) | V::Double(d) => float_to_integer(d),
            V::Float(f) => float_to_integer(f64::from(f)),
            other => Err(cast_err(&other, target)),
        },
        AtomicType::Decimal => match a {
            V::String(s) | V::UntypedAtomic(s) => {
                let t = s.trim();
                let valid = !t.is_empty()
                    && t.chars()
                        .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.'));
                match t.parse::<f64>() {
                    Ok(d) if valid => Ok(V::Decimal(d)),
                    _ => Err(lexical_err(&s, target)),
                }
            }
            V::Boolean(b) => Ok(V::Decimal(if b { 1.0 } else { 0.0 })),
            V::Integer(i) => Ok(V::Decimal(i as f64)),
            V::Double(d) if d.is_finite() => Ok(V::Decimal(d)),
            V::Float(f) if f.is_finite() => Ok(V::Decimal(f64::from(f))),
            V::Double(_) | V::Float(_) => Err(Error::from_code(
                ErrorCode::FOCA0002,
                "INF or NaN cannot be cast to xs:decimal",
            )),
            other => Err(cast_err(&other, target)),
        },
        AtomicType::Double | AtomicType::Float => {
            let d = match &a {
                V::String(s) | V::UntypedAtomic(s) => {
                    parse_double(s).ok_or_else(|| lexical_err(s, target))?
                }
                V::Boolean(b) => {
                    if *b {
                        1.0
                    } else {
                        0.0
                    }
                }
                other => other.as_f64().ok_or_else(|| cast_err(other, target))?,
            };
            Ok(if target == AtomicType::Double {
                V::Double(d)
            } else {
                V::Float(d as f32)
            })
        }
        AtomicType::QName => match a {
            V::String(s) | V::UntypedAtomic(s) => {
                let t = s.trim();
                let (prefix, local) = match t.split_once(':') {
                    Some((p, l)) => (Some(p.to_string()), l),
                    None => (None, t),
                };
                if local.is_empty() || !local.chars().all(is_name_char) {
                    return Err(lexical_err(&s, target));
                }
                Ok(V::QName {
                    ns_uri: None,
                    prefix,
                    local: local.to_string(),
                })
            }
            other => Err(cast_err(&other, target)),
        },
        AtomicType::Date | AtomicType::DateTime | AtomicType::Time => cast_temporal(a, target),
        AtomicType::YearMonthDuration => match a {
            V::String(s) | V::UntypedAtomic(s) => {
                parse_year_month_duration(s.trim()).ok_or_else(|| lexical_err(&s, target))
            }
            other => Err(cast_err(&other, target)),
        },
        AtomicType::DayTimeDuration => match a {
            V::String(s) | V::UntypedAtomic(s) => {
                parse_day_time_duration(s.trim()).ok_or_else(|| lexical_err(&s, target))
            }
            other => Err(cast_err(&other, target)),
        },
        AtomicType::AnyAtomic | AtomicType::Numeric => Err(cast_err(&a, target)),
    }
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.')
}

fn float_to_integer(d: f64) -> Result<XdmAtomicValue, Error> {
    if !d.is_finite() {
        return Err(Error::from_code(
            ErrorCode::FOCA0002,
            "INF or NaN cannot be cast to xs:integer",
        ));
    }
    let t = d.trunc();
    if t < i64::MIN as f64 || t > i64::MAX as f64 {
        return Err(Error::from_code(
            ErrorCode::FOAR0002,
            "value out of range for xs:integer",
        ));
    }
    Ok(XdmAtomicValue::Integer(t as i64))
}

fn cast_temporal(a: XdmAtomicValue, target: AtomicType) -> Result<XdmAtomicValue, Error> {
    use XdmAtomicValue as V;
    match a {
        V::String(s) | V::UntypedAtomic(s) => {
            let parsed = match target {
                AtomicType::Date => parse_date(s.trim()),
                AtomicType::Time => parse_time(s.trim()),
                _ => parse_date_time(s.trim()),
            };
            parsed.ok_or_else(|| lexical_err(&s, target))
        }
        V::DateTime(dt) => match target {
            AtomicType::Date => Ok(V::Date {
                date: dt.date_naive(),
                tz: Some(*dt.offset()),
            }),
            AtomicType::Time => Ok(V::Time {
                time: dt.time(),
                tz: Some(*dt.offset()),
            }),
            _ => Ok(V::DateTime(dt)),
        },
        V::Date { date, tz } if target == AtomicType::DateTime => {
            let off = tz.unwrap_or_else(|| Utc.fix());
            date.and_time(NaiveTime::default())
                .and_local_timezone(off)
                .single()
                .map(V::DateTime)
                .ok_or_else(|| Error::from_code(ErrorCode::FORG0001, "invalid date"))
        }
        other => Err(cast_err(&other, target)),
    }
}

/// Split a trailing timezone (`Z`, `+hh:mm`, `-hh:mm`) from a lexical value.
fn split_tz(s: &str) -> Option<(&str, Option<FixedOffset>)> {
    if let Some(rest) = s.strip_suffix('Z') {
        return Some((rest, Some(Utc.fix())));
    }
    let bytes = s.as_bytes();
    if s.len() >= 6 && matches!(bytes[s.len() - 6], b'+' | b'-') && bytes[s.len() - 3] == b':' {
        let (rest, tz) = s.split_at(s.len() - 6);
        let hours: i32 = tz[1..3].parse().ok()?;
        let mins: i32 = tz[4..6].parse().ok()?;
        let secs = (hours * 3600 + mins * 60) * if tz.starts_with('-') { -1 } else { 1 };
        return Some((rest, Some(FixedOffset::east_opt(secs)?)));
    }
    Some((s, None))
}

fn parse_date(s: &str) -> Option<XdmAtomicValue> {
    let (body, tz) = split_tz(s)?;
    let date = NaiveDate::parse_from_str(body, "%Y-%m-%d").ok()?;
    Some(XdmAtomicValue::Date { date, tz })
}

fn parse_time(s: &str) -> Option<XdmAtomicValue> {
    let (body, tz) = split_tz(s)?;
    let time = NaiveTime::parse_from_str(body, "%H:%M:%S%.f").ok()?;
    Some(XdmAtomicValue::Time { time, tz })
}

fn parse_date_time(s: &str) -> Option<XdmAtomicValue> {
    let (body, tz) = split_tz(s)?;
    let naive = NaiveDateTime::parse_from_str(body, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    let dt: DateTime<FixedOffset> = naive
        .and_local_timezone(tz.unwrap_or_else(|| Utc.fix()))
        .single()?;
    Some(XdmAtomicValue::DateTime(dt))
}

fn parse_year_month_duration(s: &str) -> Option<XdmAtomicValue> {
    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let body = body.strip_prefix('P')?;
    let (mut years, mut months, mut cur, mut seen) = (0i32, 0i32, String::new(), false);
    for ch in body.chars() {
        match ch {
            '0'..='9' => cur.push(ch),
            'Y' => {
                years = cur.parse().ok()?;
                cur.clear();
                seen = true;
            }
            'M' => {
                months = cur.parse().ok()?;
                cur.clear();
                seen = true;
            }
            _ => return None,
        }
    }
    if !cur.is_empty() || !seen {
        return None;
    }
    let total = years.checked_mul(12)?.checked_add(months)?;
    Some(XdmAtomicValue::YearMonthDuration(if neg { -total } else { total }))
}

fn parse_day_time_duration(s: &str) -> Option<XdmAtomicValue> {
    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let body = body.strip_prefix('P')?;
    let (mut total, mut cur, mut time_part, mut seen) = (0i64, String::new(), false, false);
    for ch in body.chars() {
        let unit = match ch {
            '0'..='9' => {
                cur.push(ch);
                continue;
            }
            'T' if !time_part && cur.is_empty() => {
                time_part = true;
                continue;
            }
            'D' if !time_part => 86_400,
            'H' if time_part => 3_600,
            'M' if time_part => 60,
            'S' if time_part => 1,
            _ => return None,
        };
        let n: i64 = cur.parse().ok()?;
        total = total.checked_add(n.checked_mul(unit)?)?;
        cur.clear();
        seen = true;
    }
    if !cur.is_empty() || !seen {
        return None;
    }
    Some(XdmAtomicValue::DayTimeDuration(if neg { -total } else { total }))
}

/// Check a bound value against the declared type of its variable.
pub(crate) fn check_declared(
    ctx: &QueryContext<'_>,
    var: &Var,
    seq: &[XdmItem],
) -> Result<(), Error> {
    if let Some(ty) = &var.declared
        && !ty.matches(ctx, seq)
    {
        return Err(Error::type_err(format!(
            "value of ${} does not match its declared type",
            var.name
        )));
    }
    Ok(())
}
