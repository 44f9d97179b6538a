use rstest::{fixture, rstest};
use xqdb_query::expr::{Arith, Calc, Catch, CatchCode, CmpG, CmpOp, ErrVars, Path, Step, Try};
use xqdb_query::update::Delete;
use xqdb_query::{
    Builtin, Error, ErrorCode, ExpandedName, Expr, FnCall, QueryContext, SimpleStore, Var,
    XdmAtomicValue, XdmItem, doc, elem, evaluate, text,
};

#[fixture]
fn store() -> SimpleStore {
    doc().child(elem("r").child(elem("a").child(text("x")))).build()
}

fn run(store: &SimpleStore, e: Expr) -> Result<Vec<XdmItem>, Error> {
    let mut ctx = QueryContext::new(store).with_document_context();
    evaluate(e, &mut ctx)
}

fn div_by_zero() -> Expr {
    Expr::Arith(Arith::new(Calc::IDiv, Expr::int(1), Expr::int(0)))
}

fn raise(local: &str, description: &str, value: Expr) -> Expr {
    let code = XdmAtomicValue::QName {
        ns_uri: Some("urn:app".into()),
        prefix: Some("app".into()),
        local: local.into(),
    };
    Expr::Call(FnCall::new(
        Builtin::Error,
        vec![Expr::Literal(code), Expr::string(description), value],
    ))
}

fn string(s: &str) -> XdmItem {
    XdmItem::Atomic(XdmAtomicValue::String(s.into()))
}

#[rstest]
fn successful_body_is_returned(store: SimpleStore) {
    let t = Try::new(Expr::ints(&[1, 2]), vec![Catch::new(vec![CatchCode::Any], Expr::empty())]);
    assert_eq!(
        run(&store, Expr::Try(t)).unwrap(),
        [
            XdmItem::Atomic(XdmAtomicValue::Integer(1)),
            XdmItem::Atomic(XdmAtomicValue::Integer(2))
        ]
    );
}

#[rstest]
fn catch_binds_description_and_value(store: SimpleStore) {
    let desc = Var::new("desc");
    let value = Var::new("value");
    let body = raise("bad", "broken", Expr::ints(&[4, 5]));
    let handler = Expr::seq(vec![
        Expr::var(&desc),
        Expr::Call(FnCall::new(Builtin::Count, vec![Expr::var(&value)])),
    ]);
    let name = ExpandedName::new(Some("urn:app".into()), "bad");
    let t = Try::new(
        body,
        vec![Catch::new(vec![CatchCode::Name(name)], handler).with_vars(ErrVars {
            description: Some(desc.clone()),
            value: Some(value.clone()),
            ..ErrVars::default()
        })],
    );
    assert_eq!(
        run(&store, Expr::Try(t)).unwrap(),
        [string("broken"), XdmItem::Atomic(XdmAtomicValue::Integer(2))]
    );
}

#[rstest]
fn first_matching_catch_wins(store: SimpleStore) {
    let t = Try::new(
        div_by_zero(),
        vec![
            Catch::new(vec![CatchCode::Local("FOAR0002".into())], Expr::string("overflow")),
            Catch::new(
                vec![CatchCode::Namespace(ErrorCode::FOAR0001.qname().ns_uri.unwrap_or_default())],
                Expr::string("standard"),
            ),
            Catch::new(vec![CatchCode::Any], Expr::string("any")),
        ],
    );
    assert_eq!(run(&store, Expr::Try(t)).unwrap(), [string("standard")]);
}

#[rstest]
fn unmatched_errors_propagate(store: SimpleStore) {
    let t = Try::new(
        div_by_zero(),
        vec![Catch::new(vec![CatchCode::Local("XPTY0004".into())], Expr::empty())],
    );
    let err = run(&store, Expr::Try(t)).unwrap_err();
    assert!(err.is(ErrorCode::FOAR0001), "{err}");
}

#[rstest]
fn static_errors_are_not_caught(store: SimpleStore) {
    let a = Expr::Path(Path::absolute(vec![Step::child("r"), Step::child("a")]));
    let body = Expr::CmpG(CmpG::new(CmpOp::Eq, Expr::Delete(Delete::new(a)), Expr::int(1)));
    let t = Try::new(body, vec![Catch::new(vec![CatchCode::Any], Expr::empty())]);
    let err = run(&store, Expr::Try(t)).unwrap_err();
    assert!(err.is(ErrorCode::XUST0001), "{err}");
}

#[rstest]
#[case::failing(true, 0)]
#[case::succeeding(false, 1)]
fn failed_bodies_drop_their_updates(
    store: SimpleStore,
    #[case] fail: bool,
    #[case] pending: usize,
) {
    let a = Expr::Path(Path::absolute(vec![Step::child("r"), Step::child("a")]));
    let mut body = vec![Expr::Delete(Delete::new(a))];
    if fail {
        body.push(raise("stop", "stop", Expr::empty()));
    }
    let t = Try::new(Expr::seq(body), vec![Catch::new(vec![CatchCode::Any], Expr::empty())]);
    let mut ctx = QueryContext::new(&store).with_document_context();
    assert!(evaluate(Expr::Try(t), &mut ctx).unwrap().is_empty());
    assert_eq!(ctx.updates().len(), pending);
}
