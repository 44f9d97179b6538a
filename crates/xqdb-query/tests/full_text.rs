use rstest::rstest;
use xqdb_query::expr::{Clause, Flwor, Path, Step};
use xqdb_query::ft::FTUnit;
use xqdb_query::ft::matching::PosFilter;
use xqdb_query::ft::options::{FTCase, FTOptionsPatch};
use xqdb_query::{
    ErrorCode, Expr, FTContains, FTExpr, FTMode, MemIndex, QueryContext, SimpleStore, Var,
    XdmAtomicValue, XdmItem, doc, elem, evaluate, text,
};

fn store() -> SimpleStore {
    doc()
        .child(
            elem("books")
                .child(elem("title").child(text("The Running Man")))
                .child(elem("title").child(text("Apple banana cherry")))
                .child(elem("title").child(text("Café society"))),
        )
        .build()
}

fn holds(input: &str, ft: FTExpr) -> bool {
    let s = store();
    let mut ctx = QueryContext::new(&s);
    match evaluate(Expr::FTContains(FTContains::new(Expr::string(input), ft)), &mut ctx)
        .unwrap()
        .as_slice()
    {
        [XdmItem::Atomic(XdmAtomicValue::Boolean(b))] => *b,
        other => panic!("expected a boolean, got {other:?}"),
    }
}

fn strings(words: &[&str]) -> Expr {
    Expr::seq(words.iter().map(|w| Expr::string(w)).collect())
}

#[rstest]
#[case("the quick brown fox", "QUICK", true)]
#[case("the quick brown fox", "slow", false)]
#[case("the quick brown fox", "brown fox", true)]
#[case("the quick brown fox", "fox brown", false)]
fn single_words_and_phrases(#[case] input: &str, #[case] query: &str, #[case] expected: bool) {
    assert_eq!(holds(input, FTExpr::word(query)), expected);
}

#[rstest]
#[case(FTMode::Any, true)]
#[case(FTMode::All, false)]
#[case(FTMode::AnyWord, true)]
#[case(FTMode::AllWords, false)]
fn word_modes(#[case] mode: FTMode, #[case] expected: bool) {
    let ft = FTExpr::words(strings(&["fox", "cat"]), mode);
    assert_eq!(holds("the quick brown fox", ft), expected);
}

#[rstest]
fn and_or_combine_matches() {
    let both = FTExpr::And(vec![FTExpr::word("quick"), FTExpr::word("fox")]);
    assert!(holds("the quick brown fox", both));
    let missing = FTExpr::And(vec![FTExpr::word("quick"), FTExpr::word("cat")]);
    assert!(!holds("the quick brown fox", missing));
    let either = FTExpr::Or(vec![FTExpr::word("cat"), FTExpr::word("fox")]);
    assert!(holds("the quick brown fox", either));
}

#[rstest]
#[case(3, true)]
#[case(2, false)]
fn window_limits_the_span(#[case] size: u32, #[case] expected: bool) {
    let ft = FTExpr::select(
        FTExpr::And(vec![FTExpr::word("apple"), FTExpr::word("cherry")]),
        vec![PosFilter::window(size, FTUnit::Words)],
    );
    assert_eq!(holds("apple banana cherry", ft), expected);
}

#[rstest]
fn ordered_requires_query_order() {
    let ft = |a: &str, b: &str| {
        FTExpr::select(
            FTExpr::And(vec![FTExpr::word(a), FTExpr::word(b)]),
            vec![PosFilter::Ordered],
        )
    };
    assert!(holds("apple banana cherry", ft("apple", "cherry")));
    assert!(!holds("apple banana cherry", ft("cherry", "apple")));
}

#[rstest]
fn ftnot_matches_empty_input() {
    let s = store();
    let mut ctx = QueryContext::new(&s);
    let e = Expr::FTContains(FTContains::new(Expr::empty(), FTExpr::not(FTExpr::word("x"))));
    assert_eq!(
        evaluate(e, &mut ctx).unwrap(),
        [XdmItem::Atomic(XdmAtomicValue::Boolean(true))]
    );
}

#[rstest]
fn using_options_change_matching() {
    let sensitive = FTOptionsPatch::default().case(FTCase::Sensitive);
    assert!(!holds("Running", FTExpr::using(sensitive.clone(), FTExpr::word("running"))));
    assert!(holds("Running", FTExpr::using(sensitive, FTExpr::word("Running"))));
    assert!(holds("café", FTExpr::word("cafe")));
    let diacritics = FTOptionsPatch::default().diacritics(true);
    assert!(!holds("café", FTExpr::using(diacritics, FTExpr::word("cafe"))));
    let stemming = FTOptionsPatch::default().stemming(true);
    assert!(holds("jumping", FTExpr::using(stemming, FTExpr::word("jumps"))));
    let wildcards = FTOptionsPatch::default().wildcards(true);
    assert!(holds("running", FTExpr::using(wildcards, FTExpr::word("run.*"))));
}

#[rstest]
fn stop_words_match_any_token() {
    let stop = FTOptionsPatch::default().stop_words(["the"]);
    assert!(holds("a running man", FTExpr::using(stop, FTExpr::word("the running man"))));
}

#[rstest]
fn weight_outside_the_allowed_range() {
    let s = store();
    let mut ctx = QueryContext::new(&s);
    let ft = FTExpr::weighted(FTExpr::word("a"), Expr::double(-1001.0));
    let err = evaluate(Expr::FTContains(FTContains::new(Expr::string("a"), ft)), &mut ctx)
        .unwrap_err();
    assert!(err.is(ErrorCode::FTDY0016), "{err}");
}

fn titles_matching(word: &str) -> Expr {
    Expr::Path(Path::absolute(vec![
        Step::child("books"),
        Step::child("title").pred(Expr::FTContains(FTContains::new(
            Expr::Context,
            FTExpr::word(word),
        ))),
    ]))
}

#[rstest]
fn indexed_and_sequential_results_agree() {
    let s = store();
    let sequential = {
        let mut ctx = QueryContext::new(&s).with_document_context();
        evaluate(titles_matching("banana"), &mut ctx).unwrap()
    };
    let idx = MemIndex::build(&s);
    let mut ctx = QueryContext::new(&s).with_index(&idx).with_document_context();
    let indexed = evaluate(titles_matching("banana"), &mut ctx).unwrap();
    assert_eq!(sequential.len(), 1);
    assert_eq!(indexed, sequential);
}

#[rstest]
fn let_score_binds_relevance() {
    // for $t in /books/title let score $s := $t contains text "banana" return $s
    let s = store();
    let t = Var::new("t");
    let sc = Var::new("s");
    let e = Expr::Flwor(Flwor::new(
        vec![
            Clause::for_in(&t, Expr::Path(Path::absolute(vec![
                Step::child("books"),
                Step::child("title"),
            ]))),
            Clause::Let {
                var: sc.clone(),
                score: true,
                expr: Expr::FTContains(FTContains::new(Expr::var(&t), FTExpr::word("banana"))),
            },
        ],
        Expr::var(&sc),
    ));
    let mut ctx = QueryContext::new(&s).with_document_context();
    let scores: Vec<f64> = evaluate(e, &mut ctx)
        .unwrap()
        .into_iter()
        .map(|i| match i {
            XdmItem::Atomic(XdmAtomicValue::Double(d)) => d,
            other => panic!("expected a double, got {other:?}"),
        })
        .collect();
    assert_eq!(scores.len(), 3);
    assert_eq!(scores[0], 0.0);
    assert!(scores[1] > 0.0 && scores[1] <= 1.0);
    assert_eq!(scores[2], 0.0);
}
