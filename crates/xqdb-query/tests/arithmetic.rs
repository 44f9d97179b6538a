use rstest::rstest;
use xqdb_query::expr::{Arith, Calc, Cast, CmpOp, CmpV, Path, Step};
use xqdb_query::xdm::AtomicType;
use xqdb_query::{
    Error, ErrorCode, Expr, QueryContext, SimpleStore, XdmAtomicValue, XdmItem, doc, elem,
    evaluate, text,
};

fn store() -> SimpleStore {
    doc().child(elem("r").child(elem("n").child(text("10")))).build()
}

fn run(e: Expr) -> Result<Vec<XdmItem>, Error> {
    let s = store();
    let mut ctx = QueryContext::new(&s).with_document_context();
    evaluate(e, &mut ctx)
}

fn atomic(e: Expr) -> XdmAtomicValue {
    match run(e).unwrap().as_slice() {
        [XdmItem::Atomic(a)] => a.clone(),
        other => panic!("expected one atomic value, got {other:?}"),
    }
}

fn calc(op: Calc, a: Expr, b: Expr) -> Expr {
    Expr::Arith(Arith::new(op, a, b))
}

fn cast(e: Expr, to: AtomicType) -> Expr {
    Expr::Cast(Cast::new(e, to, false))
}

#[rstest]
#[case(Calc::Add, i64::MAX, 1)]
#[case(Calc::Sub, i64::MIN, 1)]
#[case(Calc::Mul, i64::MAX, 2)]
#[case(Calc::IDiv, i64::MIN, -1)]
fn integer_overflow_is_detected(#[case] op: Calc, #[case] a: i64, #[case] b: i64) {
    let err = run(calc(op, Expr::int(a), Expr::int(b))).unwrap_err();
    assert!(err.is(ErrorCode::FOAR0002), "{err}");
}

#[rstest]
fn negating_the_smallest_integer_overflows() {
    let err = run(Expr::Neg(Box::new(Expr::int(i64::MIN)))).unwrap_err();
    assert!(err.is(ErrorCode::FOAR0002));
}

#[rstest]
#[case(Calc::Div)]
#[case(Calc::IDiv)]
#[case(Calc::Mod)]
fn integer_division_by_zero(#[case] op: Calc) {
    let err = run(calc(op, Expr::int(7), Expr::int(0))).unwrap_err();
    assert!(err.is(ErrorCode::FOAR0001));
}

#[rstest]
fn double_division_by_zero_is_infinite() {
    let v = atomic(calc(Calc::Div, Expr::double(1.0), Expr::int(0)));
    assert_eq!(v, XdmAtomicValue::Double(f64::INFINITY));
}

#[rstest]
fn integer_division_yields_a_decimal() {
    assert_eq!(
        atomic(calc(Calc::Div, Expr::int(7), Expr::int(2))),
        XdmAtomicValue::Decimal(3.5)
    );
    assert_eq!(
        atomic(calc(Calc::IDiv, Expr::int(7), Expr::int(2))),
        XdmAtomicValue::Integer(3)
    );
}

#[rstest]
fn untyped_operands_become_doubles() {
    let n = Expr::Path(Path::absolute(vec![Step::child("r"), Step::child("n")]));
    assert_eq!(
        atomic(calc(Calc::Add, n, Expr::int(1))),
        XdmAtomicValue::Double(11.0)
    );
}

#[rstest]
fn arithmetic_on_empty_is_empty() {
    assert!(run(calc(Calc::Add, Expr::empty(), Expr::int(1))).unwrap().is_empty());
}

#[rstest]
#[case("12", AtomicType::Integer, XdmAtomicValue::Integer(12))]
#[case(" true ", AtomicType::Boolean, XdmAtomicValue::Boolean(true))]
#[case("2.5", AtomicType::Double, XdmAtomicValue::Double(2.5))]
fn string_casts(#[case] s: &str, #[case] to: AtomicType, #[case] expected: XdmAtomicValue) {
    assert_eq!(atomic(cast(Expr::string(s), to)), expected);
}

#[rstest]
fn invalid_lexical_value() {
    let err = run(cast(Expr::string("abc"), AtomicType::Integer)).unwrap_err();
    assert!(err.is(ErrorCode::FORG0001));
}

#[rstest]
fn empty_cast_needs_an_optional_target() {
    let err = run(cast(Expr::empty(), AtomicType::Integer)).unwrap_err();
    assert!(err.is(ErrorCode::XPTY0004));
    let optional = Expr::Cast(Cast::new(Expr::empty(), AtomicType::Integer, true));
    assert!(run(optional).unwrap().is_empty());
}

#[rstest]
fn castable_never_fails() {
    let yes = Expr::Castable(Cast::new(Expr::string("42"), AtomicType::Integer, false));
    let no = Expr::Castable(Cast::new(Expr::string("4x2"), AtomicType::Integer, false));
    assert_eq!(atomic(yes), XdmAtomicValue::Boolean(true));
    assert_eq!(atomic(no), XdmAtomicValue::Boolean(false));
}

#[rstest]
#[case(AtomicType::Date, "2024-01-02", "2024-03-01")]
#[case(AtomicType::DayTimeDuration, "PT1H", "PT90M")]
#[case(AtomicType::YearMonthDuration, "P11M", "P1Y")]
fn temporal_values_are_ordered(#[case] ty: AtomicType, #[case] lo: &str, #[case] hi: &str) {
    let e = Expr::CmpV(CmpV::new(
        CmpOp::Lt,
        cast(Expr::string(lo), ty),
        cast(Expr::string(hi), ty),
    ));
    assert_eq!(atomic(e), XdmAtomicValue::Boolean(true));
}
