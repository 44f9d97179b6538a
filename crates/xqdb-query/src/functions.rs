//! Built-in functions the expression core relies on.
use crate::expr::{Calc, Expr, Flag, Occ, Shape, ShapeKind, atomize, check_simple};
use crate::runtime::{Error, ErrorCode, ErrorKind, QueryContext};
use crate::sequence::{self, Iter};
use crate::xdm::{ExpandedName, XdmAtomicValue, XdmItem, XdmSequence, parse_double};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Position,
    Last,
    Count,
    Not,
    Empty,
    Exists,
    Boolean,
    String,
    Data,
    Sum,
    True,
    False,
    Error,
    Root,
    ZeroOrOne,
    OneOrMore,
    ExactlyOne,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Position => "position",
            Builtin::Last => "last",
            Builtin::Count => "count",
            Builtin::Not => "not",
            Builtin::Empty => "empty",
            Builtin::Exists => "exists",
            Builtin::Boolean => "boolean",
            Builtin::String => "string",
            Builtin::Data => "data",
            Builtin::Sum => "sum",
            Builtin::True => "true",
            Builtin::False => "false",
            Builtin::Error => "error",
            Builtin::Root => "root",
            Builtin::ZeroOrOne => "zero-or-one",
            Builtin::OneOrMore => "one-or-more",
            Builtin::ExactlyOne => "exactly-one",
        }
    }

    /// Accepted argument counts.
    pub fn arity(self) -> (usize, usize) {
        match self {
            Builtin::Position | Builtin::Last | Builtin::True | Builtin::False => (0, 0),
            Builtin::String | Builtin::Data | Builtin::Root => (0, 1),
            Builtin::Sum => (1, 2),
            Builtin::Error => (0, 3),
            _ => (1, 1),
        }
    }

    /// Static properties of a call with `nargs` arguments.
    pub fn has(self, flag: Flag, nargs: usize) -> bool {
        match flag {
            Flag::Pos => self == Builtin::Position,
            Flag::Last => self == Builtin::Last,
            Flag::Ctx => {
                nargs == 0 && matches!(self, Builtin::String | Builtin::Data | Builtin::Root)
            }
            Flag::Ndt => self == Builtin::Error,
            Flag::Upd => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FnCall {
    pub func: Builtin,
    pub args: Vec<Expr>,
}

impl FnCall {
    pub fn new(func: Builtin, args: Vec<Expr>) -> Self {
        Self { func, args }
    }

    pub(crate) fn compile(mut self, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
        let (min, max) = self.func.arity();
        if self.args.len() < min || self.args.len() > max {
            return Err(Error::from_code(
                ErrorCode::XPST0017,
                format!(
                    "fn:{} does not take {} arguments",
                    self.func.name(),
                    self.args.len()
                ),
            ));
        }
        for a in &mut self.args {
            *a = std::mem::take(a).compile(ctx)?;
            check_simple(a)?;
        }
        let single_bool = |e: &Expr| e.shape() == Shape::one(ShapeKind::Boolean);
        let pure = |e: &Expr| !e.has(Flag::Ndt) && !e.has(Flag::Upd);
        match (self.func, self.args.as_slice()) {
            (Builtin::True, _) => return Ok(Expr::boolean(true)),
            (Builtin::False, _) => return Ok(Expr::boolean(false)),
            (Builtin::Boolean, [a]) if single_bool(a) => return Ok(self.args.remove(0)),
            // not(not(e)) is boolean(e)
            (Builtin::Not, [Expr::Call(inner)]) if inner.func == Builtin::Not => {
                let e = inner.args[0].clone();
                return if single_bool(&e) {
                    Ok(e)
                } else {
                    Ok(Expr::Call(FnCall::new(Builtin::Boolean, vec![e])))
                };
            }
            (Builtin::Empty | Builtin::Exists, [a]) if pure(a) => {
                let occ = a.shape().occ;
                let exists = if occ == Occ::Zero {
                    Some(false)
                } else if occ.min() > 0 {
                    Some(true)
                } else {
                    None
                };
                if let Some(e) = exists {
                    return Ok(Expr::boolean(if self.func == Builtin::Exists { e } else { !e }));
                }
            }
            (Builtin::Count, [a]) if pure(a) && a.shape().occ == Occ::Zero => {
                return Ok(Expr::int(0));
            }
            _ => {}
        }
        Ok(Expr::Call(self))
    }

    pub fn shape(&self) -> Shape {
        use ShapeKind as K;
        match self.func {
            Builtin::Position | Builtin::Last | Builtin::Count => Shape::one(K::Numeric),
            Builtin::Not
            | Builtin::Empty
            | Builtin::Exists
            | Builtin::Boolean
            | Builtin::True
            | Builtin::False => Shape::one(K::Boolean),
            Builtin::String => Shape::one(K::String),
            Builtin::Data => Shape::new(K::Atomic, Occ::ZeroOrMore),
            Builtin::Sum => Shape::new(K::Numeric, Occ::ZeroOrOne),
            Builtin::Error => Shape::new(K::Item, Occ::Zero),
            Builtin::Root => Shape::new(K::Node, Occ::ZeroOrOne),
            Builtin::ZeroOrOne => Shape::new(self.arg_kind(), Occ::ZeroOrOne),
            Builtin::OneOrMore => Shape::new(self.arg_kind(), Occ::OneOrMore),
            Builtin::ExactlyOne => Shape::one(self.arg_kind()),
        }
    }

    fn arg_kind(&self) -> ShapeKind {
        self.args.first().map_or(ShapeKind::Item, |a| a.shape().kind)
    }

    /// The first argument, or the context item for the zero-argument form.
    fn arg_or_context(&self, ctx: &mut QueryContext<'_>) -> Result<Option<XdmItem>, Error> {
        match self.args.first() {
            Some(a) => a.item(ctx),
            None => ctx.context_item().cloned().map(Some),
        }
    }

    pub(crate) fn iter<'e>(&'e self, ctx: &mut QueryContext<'_>) -> Result<Iter<'e>, Error> {
        let bool_item = |b: bool| sequence::single(XdmItem::Atomic(XdmAtomicValue::Boolean(b)));
        let int_item = |n: usize| {
            sequence::single(XdmItem::Atomic(XdmAtomicValue::Integer(
                i64::try_from(n).unwrap_or(i64::MAX),
            )))
        };
        match self.func {
            Builtin::Position | Builtin::Last => {
                ctx.context_item()?;
                let f = ctx.focus();
                Ok(int_item(if self.func == Builtin::Position { f.pos } else { f.size }))
            }
            Builtin::Count => {
                let mut it = self.args[0].iter(ctx)?;
                if let Some(n) = it.size() {
                    return Ok(int_item(n));
                }
                let mut n = 0usize;
                while it.next(ctx)?.is_some() {
                    ctx.checkpoint()?;
                    n += 1;
                }
                Ok(int_item(n))
            }
            Builtin::Not => Ok(bool_item(!self.args[0].ebv(ctx)?)),
            Builtin::Boolean => Ok(bool_item(self.args[0].ebv(ctx)?)),
            Builtin::Empty | Builtin::Exists => {
                let mut it = self.args[0].iter(ctx)?;
                let any = match it.size() {
                    Some(n) => n > 0,
                    None => it.next(ctx)?.is_some(),
                };
                Ok(bool_item(if self.func == Builtin::Exists { any } else { !any }))
            }
            Builtin::True => Ok(bool_item(true)),
            Builtin::False => Ok(bool_item(false)),
            Builtin::String => {
                let s = match self.arg_or_context(ctx)? {
                    None => String::new(),
                    Some(XdmItem::Node(n)) => ctx.store().string_value(n),
                    Some(XdmItem::Atomic(a)) => a.lexical(),
                };
                Ok(sequence::single(XdmItem::Atomic(XdmAtomicValue::String(s))))
            }
            Builtin::Data => {
                let items = match self.args.first() {
                    Some(a) => a.atomize_all(ctx)?,
                    None => {
                        let item = ctx.context_item()?.clone();
                        vec![atomize(ctx, item)]
                    }
                };
                Ok(sequence::value(
                    items.into_iter().map(XdmItem::Atomic).collect::<Vec<_>>(),
                ))
            }
            Builtin::Sum => self.sum(ctx),
            Builtin::Error => Err(self.raise(ctx)?),
            Builtin::Root => {
                let Some(item) = self.arg_or_context(ctx)? else {
                    return Ok(sequence::empty());
                };
                let XdmItem::Node(mut node) = item else {
                    return Err(Error::type_err("fn:root expects a node"));
                };
                let store = ctx.store();
                while let Some(p) = store.parent(node) {
                    node = p;
                }
                Ok(sequence::single(XdmItem::Node(node)))
            }
            Builtin::ZeroOrOne | Builtin::OneOrMore | Builtin::ExactlyOne => {
                let seq = self.args[0].value(ctx)?;
                let (ok, code) = match self.func {
                    Builtin::ZeroOrOne => (seq.len() <= 1, ErrorCode::FORG0003),
                    Builtin::OneOrMore => (!seq.is_empty(), ErrorCode::FORG0004),
                    _ => (seq.len() == 1, ErrorCode::FORG0005),
                };
                if !ok {
                    return Err(Error::from_code(
                        code,
                        format!("fn:{} called with {} items", self.func.name(), seq.len()),
                    ));
                }
                Ok(sequence::value(seq))
            }
        }
    }

    fn sum<'e>(&'e self, ctx: &mut QueryContext<'_>) -> Result<Iter<'e>, Error> {
        let values = self.args[0].atomize_all(ctx)?;
        let mut total: Option<XdmAtomicValue> = None;
        for v in values {
            let v = match v {
                XdmAtomicValue::UntypedAtomic(s) => parse_double(&s)
                    .map(XdmAtomicValue::Double)
                    .ok_or_else(|| {
                        Error::from_code(
                            ErrorCode::FORG0001,
                            format!("cannot convert \"{s}\" to a number"),
                        )
                    })?,
                other => other,
            };
            total = Some(match total {
                None if v.is_numeric()
                    || matches!(
                        v,
                        XdmAtomicValue::YearMonthDuration(_) | XdmAtomicValue::DayTimeDuration(_)
                    ) =>
                {
                    v
                }
                None => {
                    return Err(Error::from_code(
                        ErrorCode::FORG0006,
                        format!("fn:sum is not defined for {}", v.atomic_type()),
                    ));
                }
                Some(acc) => Calc::Add.eval(acc, v)?,
            });
        }
        match total {
            Some(t) => Ok(sequence::single(XdmItem::Atomic(t))),
            None => match self.args.get(1) {
                Some(zero) => zero.iter(ctx),
                None => Ok(sequence::single(XdmItem::Atomic(XdmAtomicValue::Integer(0)))),
            },
        }
    }

    /// Build the error raised by `fn:error`.
    fn raise(&self, ctx: &mut QueryContext<'_>) -> Result<Error, Error> {
        let code = match self.args.first() {
            None => None,
            Some(a) => match a.atomic_opt(ctx)? {
                None => None,
                Some(XdmAtomicValue::QName { ns_uri, local, .. }) => {
                    Some(ExpandedName::new(ns_uri, local))
                }
                Some(other) => {
                    return Err(Error::type_err(format!(
                        "fn:error expects an xs:QName, found {}",
                        other.atomic_type()
                    )));
                }
            },
        };
        let message = match self.args.get(1) {
            Some(d) => d.atomic_opt(ctx)?.map(|a| a.lexical()).unwrap_or_default(),
            None => "error raised by fn:error".to_string(),
        };
        let value: Option<XdmSequence> = match self.args.get(2) {
            Some(v) => Some(v.value(ctx)?),
            None => None,
        };
        let mut err = match code {
            Some(code) => Error::new_qname(code, ErrorKind::Dynamic, message),
            None => Error::from_code(ErrorCode::FOER0000, message),
        };
        err.value = value;
        Ok(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simple_store::{doc, elem, text};

    fn call(f: Builtin, args: Vec<Expr>) -> Expr {
        Expr::Call(FnCall::new(f, args))
    }

    #[test]
    fn count_uses_known_sizes() {
        let store = doc().child(elem("a")).build();
        let mut ctx = QueryContext::new(&store);
        let e = call(Builtin::Count, vec![Expr::range(Expr::int(1), Expr::int(1_000_000))]);
        assert_eq!(
            e.value(&mut ctx).unwrap(),
            vec![XdmItem::Atomic(XdmAtomicValue::Integer(1_000_000))]
        );
    }

    #[test]
    fn sum_promotes_and_defaults() {
        let store = doc().child(elem("a").child(text("2.5"))).build();
        let mut ctx = QueryContext::new(&store).with_document_context();
        let e = call(Builtin::Sum, vec![Expr::seq(vec![Expr::int(1), Expr::Root])]);
        assert_eq!(
            e.value(&mut ctx).unwrap(),
            vec![XdmItem::Atomic(XdmAtomicValue::Double(3.5))]
        );
        let empty = call(Builtin::Sum, vec![Expr::empty()]);
        assert_eq!(
            empty.value(&mut ctx).unwrap(),
            vec![XdmItem::Atomic(XdmAtomicValue::Integer(0))]
        );
    }

    #[test]
    fn sum_of_nothing_returns_the_given_zero() {
        let store = doc().child(elem("a")).build();
        let mut ctx = QueryContext::new(&store);
        let e = call(Builtin::Sum, vec![Expr::empty(), Expr::string("none")]);
        assert_eq!(
            e.value(&mut ctx).unwrap(),
            vec![XdmItem::Atomic(XdmAtomicValue::String("none".into()))]
        );
    }

    #[test]
    fn wrong_arity_is_static() {
        let store = doc().child(elem("a")).build();
        let mut ctx = QueryContext::new(&store);
        let err = call(Builtin::Not, vec![]).compile(&mut ctx).unwrap_err();
        assert!(err.is(ErrorCode::XPST0017));
    }

    #[test]
    fn error_carries_code_and_value() {
        let store = doc().child(elem("a")).build();
        let mut ctx = QueryContext::new(&store);
        let code = XdmAtomicValue::QName {
            ns_uri: Some("urn:app".into()),
            prefix: Some("app".into()),
            local: "bad".into(),
        };
        let e = call(
            Builtin::Error,
            vec![Expr::Literal(code), Expr::string("broken"), Expr::int(7)],
        );
        let err = e.value(&mut ctx).unwrap_err();
        assert_eq!(err.code, ExpandedName::new(Some("urn:app".into()), "bad"));
        assert_eq!(err.message, "broken");
        assert_eq!(err.value.as_deref().map(<[XdmItem]>::len), Some(1));
        assert!(!err.is_cancelled());
    }

    #[test]
    fn cardinality_checks() {
        let store = doc().child(elem("a")).build();
        let mut ctx = QueryContext::new(&store);
        let e = call(Builtin::ExactlyOne, vec![Expr::ints(&[1, 2])]);
        assert!(e.value(&mut ctx).unwrap_err().is(ErrorCode::FORG0005));
        let e = call(Builtin::ZeroOrOne, vec![Expr::empty()]);
        assert!(e.value(&mut ctx).unwrap().is_empty());
    }
}
