use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use xqdb_query::expr::{Arith, Calc, Clause, CmpG, CmpOp, Flwor, OrderKey, Path, Step};
use xqdb_query::{
    Expr, FTContains, FTExpr, MemIndex, QueryContext, SimpleStore, Var, attr, doc, elem, text,
};

const WORDS: &[&str] = &["alpha", "beta", "gamma", "delta", "epsilon", "zeta"];

fn build_catalog(items: usize) -> SimpleStore {
    let mut catalog = elem("catalog");
    for i in 0..items {
        let title = format!("{} {} {}", WORDS[i % 6], WORDS[(i / 6) % 6], WORDS[(i / 36) % 6]);
        catalog = catalog.child(
            elem("item")
                .attr(attr("id", &format!("item-{i}")))
                .attr(attr("type", if i % 3 == 0 { "a" } else { "b" }))
                .child(elem("price").child(text(&(i % 500).to_string())))
                .child(elem("title").child(text(&title))),
        );
    }
    doc().child(catalog).build()
}

fn items(pred: Expr) -> Expr {
    Expr::Path(Path::absolute(vec![Step::child("catalog"), Step::child("item").pred(pred)]))
}

fn sample_queries() -> Vec<(&'static str, Expr)> {
    let id = Expr::Path(Path::relative(vec![Step::attr("id")]));
    let price = Expr::Path(Path::relative(vec![Step::child("price")]));
    let title = Expr::Path(Path::relative(vec![Step::child("title")]));
    let x = Var::new("x");
    let n = Var::new("n");
    vec![
        (
            "attribute equality",
            items(Expr::CmpG(CmpG::new(CmpOp::Eq, id, Expr::string("item-4242")))),
        ),
        (
            "price range",
            items(Expr::CmpG(CmpG::new(CmpOp::Gt, price.clone(), Expr::int(490)))),
        ),
        (
            "full text",
            items(Expr::FTContains(FTContains::new(
                title,
                FTExpr::And(vec![FTExpr::word("gamma"), FTExpr::word("zeta")]),
            ))),
        ),
        (
            "flwor order by",
            Expr::Flwor(Flwor::new(
                vec![
                    Clause::for_in(
                        &x,
                        Expr::Path(Path::absolute(vec![
                            Step::child("catalog"),
                            Step::child("item"),
                            Step::child("price"),
                        ])),
                    ),
                    Clause::OrderBy(vec![OrderKey::desc(Expr::var(&x))]),
                ],
                Expr::var(&x),
            )),
        ),
        (
            "for over range",
            Expr::Flwor(Flwor::new(
                vec![Clause::for_in(&n, Expr::range(Expr::int(1), Expr::int(10_000)))],
                Expr::Arith(Arith::new(Calc::Mul, Expr::var(&n), Expr::var(&n))),
            )),
        ),
    ]
}

fn benchmark_compiler(c: &mut Criterion) {
    let store = build_catalog(10_000);
    let index = MemIndex::build(&store);
    let queries = sample_queries();
    c.bench_function("compiler/compile", |b| {
        b.iter(|| {
            for (_, q) in &queries {
                let mut ctx = QueryContext::new(&store).with_index(&index).with_document_context();
                let compiled = q.clone().compile(&mut ctx).expect("compile failure");
                black_box(compiled);
            }
        })
    });
}

fn benchmark_evaluator(c: &mut Criterion) {
    let store = build_catalog(10_000);
    let index = MemIndex::build(&store);

    let mut group = c.benchmark_group("evaluator/evaluate");
    for (name, query) in sample_queries() {
        let mut ctx = QueryContext::new(&store).with_document_context();
        let scanned = query.clone().compile(&mut ctx).expect("compile failure");
        group.bench_with_input(BenchmarkId::new("scan", name), &scanned, |b, q| {
            b.iter(|| {
                let mut ctx = QueryContext::new(&store).with_document_context();
                let result = q.value(&mut ctx).expect("eval failure");
                black_box(result.len());
            });
        });

        let mut ctx = QueryContext::new(&store).with_index(&index).with_document_context();
        let indexed = query.compile(&mut ctx).expect("compile failure");
        group.bench_with_input(BenchmarkId::new("indexed", name), &indexed, |b, q| {
            b.iter(|| {
                let mut ctx = QueryContext::new(&store).with_index(&index).with_document_context();
                let result = q.value(&mut ctx).expect("eval failure");
                black_box(result.len());
            });
        });
    }
    group.finish();
}

fn benchmark_index_build(c: &mut Criterion) {
    let store = build_catalog(10_000);
    c.bench_function("index/build", |b| {
        b.iter(|| black_box(MemIndex::build(black_box(&store))))
    });
}

criterion_group!(
    benches,
    benchmark_compiler,
    benchmark_evaluator,
    benchmark_index_build
);
criterion_main!(benches);
