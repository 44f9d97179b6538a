use rstest::{fixture, rstest};
use xqdb_query::expr::{CmpG, CmpOp, Path, Step};
use xqdb_query::update::Delete;
use xqdb_query::{
    Expr, MemIndex, QueryContext, QueryOptions, SimpleStore, XdmItem, attr, comment, doc, elem,
    evaluate, text,
};

#[fixture]
fn store() -> SimpleStore {
    let mut shop = elem("shop");
    for (id, price) in [("a", "10"), ("b", "25"), ("c", "40"), ("d", "55"), ("e", "70")] {
        shop = shop.child(
            elem("item")
                .attr(attr("id", id))
                .child(elem("price").child(text(price))),
        );
    }
    doc().child(shop).build()
}

fn items(pred: Expr) -> Expr {
    Expr::Path(Path::absolute(vec![Step::child("shop"), Step::child("item").pred(pred)]))
}

fn cmp(op: CmpOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::CmpG(CmpG::new(op, lhs, rhs))
}

fn id() -> Expr {
    Expr::Path(Path::relative(vec![Step::attr("id")]))
}

fn price() -> Expr {
    Expr::Path(Path::relative(vec![Step::child("price")]))
}

fn scan(store: &SimpleStore, e: Expr) -> Vec<XdmItem> {
    let mut ctx = QueryContext::new(store).with_document_context();
    evaluate(e, &mut ctx).unwrap()
}

fn starts_at_index(e: &Expr) -> bool {
    matches!(e, Expr::Path(p) if matches!(p.input.as_deref(), Some(Expr::IndexAccess(_) | Expr::Union(_))))
}

#[rstest]
#[case::attribute(cmp(CmpOp::Eq, id(), Expr::string("c")), 1)]
#[case::attribute_choice(cmp(CmpOp::Eq, id(), Expr::seq(vec![Expr::string("a"), Expr::string("e")])), 2)]
#[case::leaf_element(cmp(CmpOp::Eq, price(), Expr::string("25")), 1)]
#[case::numeric_range(cmp(CmpOp::Gt, price(), Expr::int(50)), 2)]
#[case::string_range(cmp(CmpOp::Lt, id(), Expr::string("c")), 2)]
#[case::disjunction(Expr::Or(vec![
    cmp(CmpOp::Eq, id(), Expr::string("a")),
    cmp(CmpOp::Eq, id(), Expr::string("d")),
]), 2)]
fn indexed_paths_match_a_scan(store: SimpleStore, #[case] pred: Expr, #[case] hits: usize) {
    let expected = scan(&store, items(pred.clone()));
    assert_eq!(expected.len(), hits);
    let idx = MemIndex::build(&store);
    let mut ctx = QueryContext::new(&store).with_index(&idx).with_document_context();
    let compiled = items(pred).compile(&mut ctx).unwrap();
    assert!(starts_at_index(&compiled), "not rewritten: {compiled:?}");
    assert_eq!(compiled.clone().compile(&mut ctx).unwrap(), compiled);
    assert_eq!(compiled.value(&mut ctx).unwrap(), expected);
}

#[rstest]
fn conjunction_keeps_the_other_conditions(store: SimpleStore) {
    let pred = Expr::And(vec![
        cmp(CmpOp::Eq, id(), Expr::string("b")),
        cmp(CmpOp::Gt, price(), Expr::int(30)),
    ]);
    let idx = MemIndex::build(&store);
    let mut ctx = QueryContext::new(&store).with_index(&idx).with_document_context();
    let compiled = items(pred).compile(&mut ctx).unwrap();
    assert!(starts_at_index(&compiled));
    assert!(compiled.value(&mut ctx).unwrap().is_empty());
}

#[rstest]
fn mixed_disjunction_is_scanned(store: SimpleStore) {
    let pred = Expr::Or(vec![
        cmp(CmpOp::Eq, id(), Expr::string("a")),
        cmp(CmpOp::Ne, price(), Expr::string("10")),
    ]);
    let expected = scan(&store, items(pred.clone()));
    let idx = MemIndex::build(&store);
    let mut ctx = QueryContext::new(&store).with_index(&idx).with_document_context();
    let compiled = items(pred).compile(&mut ctx).unwrap();
    assert!(!starts_at_index(&compiled));
    assert_eq!(compiled.value(&mut ctx).unwrap(), expected);
}

#[rstest]
fn rewriting_can_be_disabled(store: SimpleStore) {
    let idx = MemIndex::build(&store);
    let options = QueryOptions::builder().with_index_rewrite(false).build();
    let mut ctx = QueryContext::with_options(&store, options)
        .with_index(&idx)
        .with_document_context();
    let compiled = items(cmp(CmpOp::Eq, id(), Expr::string("c")))
        .compile(&mut ctx)
        .unwrap();
    assert!(!starts_at_index(&compiled));
}

#[rstest]
fn stale_statistics_disable_range_rewrites(store: SimpleStore) {
    let mut store = store;
    let mut idx = MemIndex::build(&store);
    let mut updates = {
        let mut ctx = QueryContext::new(&store).with_document_context();
        let first = Expr::Path(Path::absolute(vec![
            Step::child("shop"),
            Step::child("item").pred(cmp(CmpOp::Eq, id(), Expr::string("e"))),
        ]));
        evaluate(Expr::Delete(Delete::new(first)), &mut ctx).unwrap();
        ctx.take_updates()
    };
    assert_eq!(updates.apply_all(&mut store).unwrap(), 1);
    assert!(!idx.is_current(&store));
    idx.refresh(&store);
    assert!(idx.is_current(&store));

    let range = cmp(CmpOp::Gt, price(), Expr::int(50));
    let expected = scan(&store, items(range.clone()));
    assert_eq!(expected.len(), 1);
    let mut ctx = QueryContext::new(&store).with_index(&idx).with_document_context();
    let compiled = items(range.clone()).compile(&mut ctx).unwrap();
    assert!(!starts_at_index(&compiled));
    assert_eq!(compiled.value(&mut ctx).unwrap(), expected);

    idx.optimize(&store);
    let mut ctx = QueryContext::new(&store).with_index(&idx).with_document_context();
    let compiled = items(range).compile(&mut ctx).unwrap();
    assert!(starts_at_index(&compiled));
    assert_eq!(compiled.value(&mut ctx).unwrap(), expected);
}

/// Prices whose string value is not held by a single text node.
fn split_prices() -> SimpleStore {
    doc()
        .child(
            elem("shop")
                .child(
                    elem("item").attr(attr("id", "a")).child(
                        elem("price")
                            .child(text("2"))
                            .child(comment("c"))
                            .child(text("5")),
                    ),
                )
                .child(elem("item").attr(attr("id", "b")).child(elem("price").child(text("25"))))
                .child(elem("item").attr(attr("id", "c")).child(elem("price"))),
        )
        .build()
}

#[rstest]
#[case::split_text(cmp(CmpOp::Eq, price(), Expr::string("25")), 2)]
#[case::empty_value(cmp(CmpOp::Eq, price(), Expr::string("")), 1)]
fn values_outside_single_text_nodes_are_scanned(#[case] pred: Expr, #[case] hits: usize) {
    let store = split_prices();
    let expected = scan(&store, items(pred.clone()));
    assert_eq!(expected.len(), hits);
    let idx = MemIndex::build(&store);
    let mut ctx = QueryContext::new(&store).with_index(&idx).with_document_context();
    let compiled = items(pred).compile(&mut ctx).unwrap();
    assert!(!starts_at_index(&compiled), "rewritten: {compiled:?}");
    assert_eq!(compiled.value(&mut ctx).unwrap(), expected);
}
