use crate::model::NodeId;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime};
use core::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExpandedName {
    pub ns_uri: Option<String>,
    pub local: String,
}

impl ExpandedName {
    pub fn new(ns_uri: Option<String>, local: impl Into<String>) -> Self {
        Self {
            ns_uri,
            local: local.into(),
        }
    }

    /// Name without namespace.
    pub fn local(local: impl Into<String>) -> Self {
        Self::new(None, local)
    }
}

impl fmt::Display for ExpandedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ns_uri {
            Some(ns) => write!(f, "Q{{{}}}{}", ns, self.local),
            None => f.write_str(&self.local),
        }
    }
}

/// Static tag of an atomic value (the `xs:` type it belongs to).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicType {
    AnyAtomic,
    UntypedAtomic,
    String,
    Boolean,
    Integer,
    Decimal,
    Float,
    Double,
    /// Union of the four numeric types, only used in type tests.
    Numeric,
    AnyUri,
    QName,
    Date,
    DateTime,
    Time,
    DayTimeDuration,
    YearMonthDuration,
}

impl AtomicType {
    pub fn name(self) -> &'static str {
        match self {
            AtomicType::AnyAtomic => "xs:anyAtomicType",
            AtomicType::UntypedAtomic => "xs:untypedAtomic",
            AtomicType::String => "xs:string",
            AtomicType::Boolean => "xs:boolean",
            AtomicType::Integer => "xs:integer",
            AtomicType::Decimal => "xs:decimal",
            AtomicType::Float => "xs:float",
            AtomicType::Double => "xs:double",
            AtomicType::Numeric => "xs:numeric",
            AtomicType::AnyUri => "xs:anyURI",
            AtomicType::QName => "xs:QName",
            AtomicType::Date => "xs:date",
            AtomicType::DateTime => "xs:dateTime",
            AtomicType::Time => "xs:time",
            AtomicType::DayTimeDuration => "xs:dayTimeDuration",
            AtomicType::YearMonthDuration => "xs:yearMonthDuration",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            AtomicType::Integer
                | AtomicType::Decimal
                | AtomicType::Float
                | AtomicType::Double
                | AtomicType::Numeric
        )
    }

    /// `true` if every value of `self` is also an instance of `other`.
    pub fn derives_from(self, other: AtomicType) -> bool {
        if self == other || other == AtomicType::AnyAtomic {
            return true;
        }
        match other {
            AtomicType::Numeric => self.is_numeric(),
            // xs:integer is derived from xs:decimal
            AtomicType::Decimal => self == AtomicType::Integer,
            _ => false,
        }
    }
}

impl fmt::Display for AtomicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum XdmAtomicValue {
    Boolean(bool),
    String(String),
    Integer(i64),
    Decimal(f64),
    Double(f64),
    Float(f32),
    AnyUri(String),
    QName {
        ns_uri: Option<String>,
        prefix: Option<String>,
        local: String,
    },
    UntypedAtomic(String),
    DateTime(DateTime<FixedOffset>),
    Date {
        date: NaiveDate,
        tz: Option<FixedOffset>,
    },
    Time {
        time: NaiveTime,
        tz: Option<FixedOffset>,
    },
    // Durations are kept canonical: total months / total seconds.
    YearMonthDuration(i32),
    DayTimeDuration(i64),
}

impl XdmAtomicValue {
    pub fn atomic_type(&self) -> AtomicType {
        match self {
            XdmAtomicValue::Boolean(_) => AtomicType::Boolean,
            XdmAtomicValue::String(_) => AtomicType::String,
            XdmAtomicValue::Integer(_) => AtomicType::Integer,
            XdmAtomicValue::Decimal(_) => AtomicType::Decimal,
            XdmAtomicValue::Double(_) => AtomicType::Double,
            XdmAtomicValue::Float(_) => AtomicType::Float,
            XdmAtomicValue::AnyUri(_) => AtomicType::AnyUri,
            XdmAtomicValue::QName { .. } => AtomicType::QName,
            XdmAtomicValue::UntypedAtomic(_) => AtomicType::UntypedAtomic,
            XdmAtomicValue::DateTime(_) => AtomicType::DateTime,
            XdmAtomicValue::Date { .. } => AtomicType::Date,
            XdmAtomicValue::Time { .. } => AtomicType::Time,
            XdmAtomicValue::YearMonthDuration(_) => AtomicType::YearMonthDuration,
            XdmAtomicValue::DayTimeDuration(_) => AtomicType::DayTimeDuration,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.atomic_type().is_numeric()
    }

    pub fn is_untyped(&self) -> bool {
        matches!(self, XdmAtomicValue::UntypedAtomic(_))
    }

    /// Strings, URIs and untyped values compare as strings.
    pub fn is_string_like(&self) -> bool {
        matches!(
            self,
            XdmAtomicValue::String(_) | XdmAtomicValue::AnyUri(_) | XdmAtomicValue::UntypedAtomic(_)
        )
    }

    pub fn is_temporal(&self) -> bool {
        matches!(
            self,
            XdmAtomicValue::DateTime(_) | XdmAtomicValue::Date { .. } | XdmAtomicValue::Time { .. }
        )
    }

    /// Numeric value as double; `None` for non-numeric values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            XdmAtomicValue::Integer(i) => Some(*i as f64),
            XdmAtomicValue::Decimal(d) | XdmAtomicValue::Double(d) => Some(*d),
            XdmAtomicValue::Float(f) => Some(*f as f64),
            _ => None,
        }
    }

    /// Canonical lexical representation.
    pub fn lexical(&self) -> String {
        match self {
            XdmAtomicValue::Boolean(b) => b.to_string(),
            XdmAtomicValue::String(s)
            | XdmAtomicValue::AnyUri(s)
            | XdmAtomicValue::UntypedAtomic(s) => s.clone(),
            XdmAtomicValue::Integer(i) => i.to_string(),
            XdmAtomicValue::Decimal(d) => format_decimal(*d),
            XdmAtomicValue::Double(d) => format_double(*d),
            XdmAtomicValue::Float(f) => format_double(*f as f64),
            XdmAtomicValue::QName { prefix, local, .. } => match prefix {
                Some(p) if !p.is_empty() => format!("{p}:{local}"),
                _ => local.clone(),
            },
            XdmAtomicValue::DateTime(dt) => {
                let base = dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string();
                format!("{}{}", base, format_tz(Some(*dt.offset())))
            }
            XdmAtomicValue::Date { date, tz } => {
                format!("{}{}", date.format("%Y-%m-%d"), format_tz(*tz))
            }
            XdmAtomicValue::Time { time, tz } => {
                format!("{}{}", time.format("%H:%M:%S%.f"), format_tz(*tz))
            }
            XdmAtomicValue::YearMonthDuration(months) => format_year_month(*months),
            XdmAtomicValue::DayTimeDuration(secs) => format_day_time(*secs),
        }
    }
}

fn format_tz(tz: Option<FixedOffset>) -> String {
    match tz {
        None => String::new(),
        Some(off) if off.local_minus_utc() == 0 => "Z".to_string(),
        Some(off) => {
            let secs = off.local_minus_utc();
            let sign = if secs < 0 { '-' } else { '+' };
            let secs = secs.abs();
            format!("{}{:02}:{:02}", sign, secs / 3600, (secs % 3600) / 60)
        }
    }
}

fn format_decimal(d: f64) -> String {
    if d.fract() == 0.0 && d.abs() < 1e18 {
        format!("{}", d as i64)
    } else {
        format!("{d}")
    }
}

/// XPath canonical double form: plain notation in `[1e-6, 1e6)`, scientific otherwise.
pub(crate) fn format_double(d: f64) -> String {
    if d.is_nan() {
        return "NaN".into();
    }
    if d.is_infinite() {
        return if d > 0.0 { "INF".into() } else { "-INF".into() };
    }
    if d == 0.0 {
        return if d.is_sign_negative() { "-0".into() } else { "0".into() };
    }
    let abs = d.abs();
    if (1e-6..1e6).contains(&abs) {
        return format!("{d}");
    }
    let s = format!("{d:E}");
    // Rust prints `1E7`; XPath wants a mantissa with a fractional part.
    match s.split_once('E') {
        Some((m, e)) if !m.contains('.') => format!("{m}.0E{e}"),
        _ => s,
    }
}

fn format_year_month(months: i32) -> String {
    if months == 0 {
        return "P0M".into();
    }
    let sign = if months < 0 { "-" } else { "" };
    let m = months.unsigned_abs();
    let (y, rest) = (m / 12, m % 12);
    let mut out = format!("{sign}P");
    if y > 0 {
        out.push_str(&format!("{y}Y"));
    }
    if rest > 0 {
        out.push_str(&format!("{rest}M"));
    }
    out
}

fn format_day_time(secs: i64) -> String {
    if secs == 0 {
        return "PT0S".into();
    }
    let sign = if secs < 0 { "-" } else { "" };
    let s = secs.unsigned_abs();
    let (d, h, m, sec) = (s / 86_400, (s % 86_400) / 3600, (s % 3600) / 60, s % 60);
    let mut out = format!("{sign}P");
    if d > 0 {
        out.push_str(&format!("{d}D"));
    }
    if h > 0 || m > 0 || sec > 0 {
        out.push('T');
        if h > 0 {
            out.push_str(&format!("{h}H"));
        }
        if m > 0 {
            out.push_str(&format!("{m}M"));
        }
        if sec > 0 {
            out.push_str(&format!("{sec}S"));
        }
    }
    out
}

impl From<bool> for XdmAtomicValue {
    fn from(b: bool) -> Self {
        XdmAtomicValue::Boolean(b)
    }
}

impl From<i64> for XdmAtomicValue {
    fn from(i: i64) -> Self {
        XdmAtomicValue::Integer(i)
    }
}

impl From<f64> for XdmAtomicValue {
    fn from(d: f64) -> Self {
        XdmAtomicValue::Double(d)
    }
}

impl From<&str> for XdmAtomicValue {
    fn from(s: &str) -> Self {
        XdmAtomicValue::String(s.to_string())
    }
}

impl From<String> for XdmAtomicValue {
    fn from(s: String) -> Self {
        XdmAtomicValue::String(s)
    }
}

/// Parse the lexical form of `xs:double` (surrounding whitespace allowed).
pub fn parse_double(s: &str) -> Option<f64> {
    let t = s.trim();
    match t {
        "INF" | "+INF" => return Some(f64::INFINITY),
        "-INF" => return Some(f64::NEG_INFINITY),
        "NaN" => return Some(f64::NAN),
        "" => return None,
        _ => {}
    }
    if !t
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'))
    {
        return None;
    }
    t.parse::<f64>().ok()
}

pub type XdmSequence = Vec<XdmItem>;

/// Immutable sequence shared between variable bindings and tuple streams.
pub type SharedSequence = Arc<[XdmItem]>;

#[derive(Debug, Clone, PartialEq)]
pub enum XdmItem {
    Node(NodeId),
    Atomic(XdmAtomicValue),
}

impl XdmItem {
    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            XdmItem::Node(n) => Some(*n),
            XdmItem::Atomic(_) => None,
        }
    }

    pub fn as_atomic(&self) -> Option<&XdmAtomicValue> {
        match self {
            XdmItem::Atomic(a) => Some(a),
            XdmItem::Node(_) => None,
        }
    }

    pub fn is_node(&self) -> bool {
        matches!(self, XdmItem::Node(_))
    }
}

impl From<XdmAtomicValue> for XdmItem {
    fn from(a: XdmAtomicValue) -> Self {
        XdmItem::Atomic(a)
    }
}

impl From<NodeId> for XdmItem {
    fn from(n: NodeId) -> Self {
        XdmItem::Node(n)
    }
}

impl fmt::Display for XdmItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XdmItem::Node(n) => write!(f, "<node {}>", n.0),
            XdmItem::Atomic(a) => f.write_str(&a.lexical()),
        }
    }
}
