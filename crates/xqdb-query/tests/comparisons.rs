use rstest::{fixture, rstest};
use xqdb_query::expr::{CmpG, CmpN, CmpOp, CmpV, NodeOp, Path, Step};
use xqdb_query::{
    Error, ErrorCode, Expr, QueryContext, SimpleStore, XdmAtomicValue, XdmItem, doc, elem,
    evaluate, text,
};

#[fixture]
fn store() -> SimpleStore {
    doc()
        .child(elem("r").child(elem("n").child(text("10"))).child(elem("m").child(text("10"))))
        .build()
}

fn run(store: &SimpleStore, e: Expr) -> Result<Vec<XdmItem>, Error> {
    let mut ctx = QueryContext::new(store).with_document_context();
    evaluate(e, &mut ctx)
}

fn boolean(store: &SimpleStore, e: Expr) -> bool {
    match run(store, e).unwrap().as_slice() {
        [XdmItem::Atomic(XdmAtomicValue::Boolean(b))] => *b,
        other => panic!("expected a boolean, got {other:?}"),
    }
}

fn path(names: &[&str]) -> Expr {
    Expr::Path(Path::absolute(names.iter().map(|n| Step::child(n)).collect()))
}

#[rstest]
#[case(CmpOp::Eq, &[1, 2], &[2, 3], true)]
#[case(CmpOp::Eq, &[1, 2], &[3, 4], false)]
#[case(CmpOp::Ne, &[1], &[1], false)]
#[case(CmpOp::Ne, &[1, 2], &[1], true)]
#[case(CmpOp::Lt, &[5, 1], &[2], true)]
#[case(CmpOp::Ge, &[1], &[2, 3], false)]
fn general_comparisons_are_existential(
    store: SimpleStore,
    #[case] op: CmpOp,
    #[case] lhs: &[i64],
    #[case] rhs: &[i64],
    #[case] expected: bool,
) {
    let e = Expr::CmpG(CmpG::new(op, Expr::ints(lhs), Expr::ints(rhs)));
    assert_eq!(boolean(&store, e), expected);
}

#[rstest]
fn general_comparison_with_empty_is_false(store: SimpleStore) {
    let e = Expr::CmpG(CmpG::new(CmpOp::Eq, Expr::empty(), Expr::int(1)));
    assert!(!boolean(&store, e));
}

#[rstest]
fn untyped_values_follow_the_other_operand(store: SimpleStore) {
    let numeric = Expr::CmpG(CmpG::new(CmpOp::Eq, path(&["r", "n"]), Expr::double(10.0)));
    assert!(boolean(&store, numeric));
    let string = Expr::CmpG(CmpG::new(CmpOp::Eq, path(&["r", "n"]), Expr::string("10")));
    assert!(boolean(&store, string));
    let both = Expr::CmpG(CmpG::new(CmpOp::Eq, path(&["r", "n"]), path(&["r", "m"])));
    assert!(boolean(&store, both));
}

#[rstest]
fn invalid_untyped_number_is_a_cast_error() {
    let s = doc().child(elem("r").child(elem("n").child(text("abc")))).build();
    let e = Expr::CmpG(CmpG::new(CmpOp::Eq, path(&["r", "n"]), Expr::int(1)));
    let err = run(&s, e).unwrap_err();
    assert!(err.is(ErrorCode::FORG0001), "{err}");
}

#[rstest]
fn value_comparison_promotes_numbers(store: SimpleStore) {
    let e = Expr::CmpV(CmpV::new(CmpOp::Eq, Expr::int(1), Expr::double(1.0)));
    assert!(boolean(&store, e));
}

#[rstest]
fn value_comparison_of_empty_is_empty(store: SimpleStore) {
    let e = Expr::CmpV(CmpV::new(CmpOp::Eq, Expr::empty(), Expr::int(1)));
    assert!(run(&store, e).unwrap().is_empty());
}

#[rstest]
fn value_comparison_treats_untyped_as_string(store: SimpleStore) {
    let e = Expr::CmpV(CmpV::new(CmpOp::Eq, path(&["r", "n"]), Expr::string("10")));
    assert!(boolean(&store, e));
}

#[rstest]
fn incomparable_types_raise_type_errors(store: SimpleStore) {
    let e = Expr::CmpV(CmpV::new(CmpOp::Eq, Expr::string("a"), Expr::int(1)));
    let err = run(&store, e).unwrap_err();
    assert!(err.is(ErrorCode::XPTY0004));
}

#[rstest]
fn value_comparison_rejects_sequences(store: SimpleStore) {
    let e = Expr::CmpV(CmpV::new(CmpOp::Eq, Expr::ints(&[1, 2]), Expr::int(1)));
    assert!(run(&store, e).unwrap_err().is(ErrorCode::XPTY0004));
}

#[rstest]
#[case(NodeOp::Is, &["r", "n"], &["r", "n"], true)]
#[case(NodeOp::Is, &["r", "n"], &["r", "m"], false)]
#[case(NodeOp::Before, &["r", "n"], &["r", "m"], true)]
#[case(NodeOp::After, &["r", "n"], &["r", "m"], false)]
fn node_comparisons(
    store: SimpleStore,
    #[case] op: NodeOp,
    #[case] lhs: &[&str],
    #[case] rhs: &[&str],
    #[case] expected: bool,
) {
    let e = Expr::CmpN(CmpN::new(op, path(lhs), path(rhs)));
    assert_eq!(boolean(&store, e), expected);
}

#[rstest]
fn node_comparison_of_missing_node_is_empty(store: SimpleStore) {
    let e = Expr::CmpN(CmpN::new(NodeOp::Is, path(&["r", "x"]), path(&["r"])));
    assert!(run(&store, e).unwrap().is_empty());
}
