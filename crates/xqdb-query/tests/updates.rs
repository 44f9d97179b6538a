use rstest::{fixture, rstest};
use xqdb_query::expr::{Axis, Clause, CmpG, CmpOp, Flwor, NodeTest, Path, Step};
use xqdb_query::update::{Delete, Insert, InsertMode, Rename, Replace};
use xqdb_query::{
    Builtin, Error, ErrorCode, Expr, FnCall, QueryContext, SimpleStore, Storage, UpdateCollector, Var,
    XdmAtomicValue, XdmItem, attr, doc, elem, evaluate, text,
};

#[fixture]
fn store() -> SimpleStore {
    doc()
        .child(
            elem("r")
                .child(elem("a").attr(attr("id", "1")).child(text("x")))
                .child(elem("b").child(text("y"))),
        )
        .build()
}

fn path(names: &[&str]) -> Expr {
    Expr::Path(Path::absolute(names.iter().map(|n| Step::child(n)).collect()))
}

fn id_attr() -> Expr {
    Expr::Path(Path::absolute(vec![Step::child("r"), Step::child("a"), Step::attr("id")]))
}

/// Evaluate `e` and return the updates it collected.
fn collect(store: &SimpleStore, e: Expr) -> Result<UpdateCollector, Error> {
    let mut ctx = QueryContext::new(store).with_document_context();
    let out = evaluate(e, &mut ctx)?;
    assert!(out.is_empty(), "updating expressions return nothing: {out:?}");
    Ok(ctx.take_updates())
}

/// Evaluate `e`, apply its updates and serialize the document.
fn updated(mut store: SimpleStore, e: Expr) -> String {
    let mut updates = collect(&store, e).unwrap();
    updates.apply_all(&mut store).unwrap();
    store.to_xml(store.root())
}

#[rstest]
fn deletes_are_invisible_until_applied(store: SimpleStore) {
    let mut store = store;
    let n = Var::new("n");
    let delete_all = Expr::Flwor(Flwor::new(
        vec![Clause::for_in(
            &n,
            Expr::Path(Path::absolute(vec![
                Step::child("r"),
                Step::new(Axis::Child, NodeTest::Wildcard),
            ])),
        )],
        Expr::Delete(Delete::new(Expr::var(&n))),
    ));
    let count = Expr::Call(FnCall::new(Builtin::Count, vec![path(&["r", "a"])]));
    let mut updates = {
        let mut ctx = QueryContext::new(&store).with_document_context();
        evaluate(delete_all.clone(), &mut ctx).unwrap();
        assert_eq!(
            evaluate(count.clone(), &mut ctx).unwrap(),
            [XdmItem::Atomic(XdmAtomicValue::Integer(1))]
        );
        ctx.take_updates()
    };
    assert_eq!(updates.len(), 2);
    assert_eq!(updates.apply_all(&mut store).unwrap(), 2);
    let mut ctx = QueryContext::new(&store).with_document_context();
    assert_eq!(
        evaluate(count, &mut ctx).unwrap(),
        [XdmItem::Atomic(XdmAtomicValue::Integer(0))]
    );
}

#[rstest]
#[case(InsertMode::First, &["r"], r#"<r>new<a id="1">x</a><b>y</b></r>"#)]
#[case(InsertMode::Last, &["r"], r#"<r><a id="1">x</a><b>y</b>new</r>"#)]
#[case(InsertMode::Into, &["r", "b"], r#"<r><a id="1">x</a><b>ynew</b></r>"#)]
#[case(InsertMode::Before, &["r", "b"], r#"<r><a id="1">x</a>new<b>y</b></r>"#)]
#[case(InsertMode::After, &["r", "a"], r#"<r><a id="1">x</a>new<b>y</b></r>"#)]
fn insert_positions(
    store: SimpleStore,
    #[case] mode: InsertMode,
    #[case] target: &[&str],
    #[case] expected: &str,
) {
    let e = Expr::Insert(Insert::new(mode, Expr::string("new"), path(target)));
    assert_eq!(updated(store, e), expected);
}

#[rstest]
fn inserted_nodes_are_copies(store: SimpleStore) {
    let e = Expr::Insert(Insert::new(InsertMode::Into, path(&["r", "b"]), path(&["r", "a"])));
    assert_eq!(updated(store, e), r#"<r><a id="1">x<b>y</b></a><b>y</b></r>"#);
}

#[rstest]
fn attributes_go_to_the_target_element(store: SimpleStore) {
    let e = Expr::Insert(Insert::new(InsertMode::Into, id_attr(), path(&["r", "b"])));
    assert_eq!(updated(store, e), r#"<r><a id="1">x</a><b id="1">y</b></r>"#);
}

#[rstest]
fn rename_and_replace(store: SimpleStore) {
    let e = Expr::seq(vec![
        Expr::Rename(Rename::new(path(&["r", "a"]), Expr::string("z"))),
        Expr::Replace(Replace::value_of(id_attr(), Expr::string("9"))),
        Expr::Replace(Replace::new(path(&["r", "b"]), Expr::string("t"))),
    ]);
    assert_eq!(updated(store, e), r#"<r><z id="9">x</z>t</r>"#);
}

#[rstest]
fn delete_wins_over_rename(store: SimpleStore) {
    let e = Expr::seq(vec![
        Expr::Rename(Rename::new(path(&["r", "a"]), Expr::string("z"))),
        Expr::Delete(Delete::new(path(&["r", "a"]))),
    ]);
    assert_eq!(updated(store, e), "<r><b>y</b></r>");
}

#[rstest]
#[case::rename(
    Expr::Rename(Rename::new(path(&["r", "a"]), Expr::string("p"))),
    Expr::Rename(Rename::new(path(&["r", "a"]), Expr::string("q"))),
    ErrorCode::XUDY0015
)]
#[case::replace(
    Expr::Replace(Replace::new(path(&["r", "b"]), Expr::string("p"))),
    Expr::Replace(Replace::new(path(&["r", "b"]), Expr::string("q"))),
    ErrorCode::XUDY0016
)]
#[case::replace_value(
    Expr::Replace(Replace::value_of(id_attr(), Expr::string("p"))),
    Expr::Replace(Replace::value_of(id_attr(), Expr::string("q"))),
    ErrorCode::XUDY0017
)]
fn conflicting_updates(
    store: SimpleStore,
    #[case] first: Expr,
    #[case] second: Expr,
    #[case] code: ErrorCode,
) {
    let err = collect(&store, Expr::seq(vec![first, second])).unwrap_err();
    assert!(err.is(code), "{err}");
}

#[rstest]
fn insert_into_an_attribute_is_a_type_error(store: SimpleStore) {
    let e = Expr::Insert(Insert::new(InsertMode::Into, Expr::string("v"), id_attr()));
    assert!(collect(&store, e).unwrap_err().is(ErrorCode::XUTY0005));
}

#[rstest]
fn updating_operands_are_rejected(store: SimpleStore) {
    let e = Expr::CmpG(CmpG::new(
        CmpOp::Eq,
        Expr::Delete(Delete::new(path(&["r", "a"]))),
        Expr::int(1),
    ));
    assert!(collect(&store, e).unwrap_err().is(ErrorCode::XUST0001));
}

#[rstest]
fn missing_target_aborts_the_query(store: SimpleStore) {
    let e = Expr::seq(vec![
        Expr::Delete(Delete::new(path(&["r", "a"]))),
        Expr::Rename(Rename::new(path(&["r", "missing"]), Expr::string("z"))),
    ]);
    let err = collect(&store, e).unwrap_err();
    assert!(err.is(ErrorCode::XUDY0027), "{err}");
}

#[rstest]
#[case::empty(Expr::empty(), ErrorCode::BXQU0002)]
#[case::several(Expr::seq(vec![Expr::string("p"), Expr::string("q")]), ErrorCode::XPTY0004)]
fn rename_needs_exactly_one_name(
    store: SimpleStore,
    #[case] name: Expr,
    #[case] code: ErrorCode,
) {
    let e = Expr::Rename(Rename::new(path(&["r", "a"]), name));
    let err = collect(&store, e).unwrap_err();
    assert!(err.is(code), "{err}");
}
