use rstest::{fixture, rstest};
use xqdb_query::expr::{Axis, NodeTest, Path, Step};
use xqdb_query::{
    Error, ErrorCode, Expr, QueryContext, SimpleStore, Storage, XdmItem, doc, elem, evaluate,
    text,
};

#[fixture]
fn store() -> SimpleStore {
    doc()
        .child(
            elem("r")
                .child(elem("a").child(text("1")))
                .child(elem("b").child(text("2")))
                .child(elem("c").child(text("3"))),
        )
        .build()
}

fn child(name: &str) -> Expr {
    Expr::Path(Path::absolute(vec![Step::child("r"), Step::child(name)]))
}

fn all() -> Expr {
    Expr::Path(Path::absolute(vec![Step::child("r"), Step::new(Axis::Child, NodeTest::Wildcard)]))
}

fn run(store: &SimpleStore, e: Expr) -> Result<Vec<XdmItem>, Error> {
    let mut ctx = QueryContext::new(store).with_document_context();
    evaluate(e, &mut ctx)
}

fn names(store: &SimpleStore, e: Expr) -> Vec<String> {
    run(store, e)
        .unwrap()
        .into_iter()
        .map(|i| match i {
            XdmItem::Node(n) => store.name_of(n).map(|q| q.local.clone()).unwrap_or_default(),
            other => panic!("expected a node, got {other:?}"),
        })
        .collect()
}

#[rstest]
fn union_is_in_document_order_without_duplicates(store: SimpleStore) {
    let e = Expr::Union(vec![child("c"), child("a"), child("a"), child("b")]);
    assert_eq!(names(&store, e), ["a", "b", "c"]);
}

#[rstest]
fn intersect_keeps_common_nodes(store: SimpleStore) {
    let e = Expr::Intersect(vec![all(), Expr::Union(vec![child("c"), child("a")])]);
    assert_eq!(names(&store, e), ["a", "c"]);
}

#[rstest]
fn except_removes_nodes(store: SimpleStore) {
    let e = Expr::Except(vec![all(), child("b")]);
    assert_eq!(names(&store, e), ["a", "c"]);
}

#[rstest]
fn operations_with_empty_operands(store: SimpleStore) {
    assert_eq!(names(&store, Expr::Union(vec![Expr::empty(), child("b")])), ["b"]);
    assert!(names(&store, Expr::Intersect(vec![all(), Expr::empty()])).is_empty());
    assert_eq!(names(&store, Expr::Except(vec![all(), Expr::empty()])), ["a", "b", "c"]);
}

#[rstest]
fn atomic_operands_are_rejected(store: SimpleStore) {
    let err = run(&store, Expr::Union(vec![child("a"), Expr::int(1)])).unwrap_err();
    assert!(err.is(ErrorCode::XPTY0004), "{err}");
}

#[rstest]
fn sequence_constructor_keeps_duplicates(store: SimpleStore) {
    let e = Expr::seq(vec![child("c"), child("a"), child("c")]);
    assert_eq!(names(&store, e), ["c", "a", "c"]);
}
