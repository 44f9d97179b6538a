use rstest::rstest;
use xqdb_query::expr::order::EmptyOrder;
use xqdb_query::expr::{
    Arith, Calc, Clause, CmpG, CmpOp, Flwor, GroupSpec, If, OrderKey, Path, Quantified, Step,
    Window, WindowCond, WindowVars,
};
use xqdb_query::sequence::ItemIter;
use xqdb_query::{
    Builtin, Expr, FnCall, QueryContext, QueryOptions, SimpleStore, Var, XdmAtomicValue, XdmItem,
    doc, elem, evaluate,
};

fn store() -> SimpleStore {
    doc().child(elem("r")).build()
}

fn run_with(e: Expr, options: QueryOptions) -> Vec<XdmItem> {
    let s = store();
    let mut ctx = QueryContext::with_options(&s, options);
    evaluate(e, &mut ctx).unwrap()
}

fn run(e: Expr) -> Vec<XdmItem> {
    run_with(e, QueryOptions::default())
}

fn ints(items: &[XdmItem]) -> Vec<i64> {
    items
        .iter()
        .map(|i| match i {
            XdmItem::Atomic(XdmAtomicValue::Integer(n)) => *n,
            other => panic!("expected an integer, got {other:?}"),
        })
        .collect()
}

fn modulo(e: Expr, n: i64) -> Expr {
    Expr::Arith(Arith::new(Calc::Mod, e, Expr::int(n)))
}

fn count(e: Expr) -> Expr {
    Expr::Call(FnCall::new(Builtin::Count, vec![e]))
}

fn cmp(op: CmpOp, lhs: Expr, n: i64) -> Expr {
    Expr::CmpG(CmpG::new(op, lhs, Expr::int(n)))
}

fn add(a: &Var, b: &Var) -> Expr {
    Expr::Arith(Arith::new(Calc::Add, Expr::var(a), Expr::var(b)))
}

fn compiled(e: Expr) -> Expr {
    let s = store();
    let mut ctx = QueryContext::new(&s).with_document_context();
    e.compile(&mut ctx).unwrap()
}

fn clauses(e: &Expr) -> &[Clause] {
    match e {
        Expr::Flwor(f) => &f.clauses,
        other => panic!("expected a flwor, got {other:?}"),
    }
}

#[rstest]
fn order_by_descending() {
    let x = Var::new("x");
    let e = Expr::Flwor(Flwor::new(
        vec![
            Clause::for_in(&x, Expr::ints(&[3, 1, 2])),
            Clause::OrderBy(vec![OrderKey::desc(Expr::var(&x))]),
        ],
        Expr::var(&x),
    ));
    assert_eq!(ints(&run(e)), [3, 2, 1]);
}

#[rstest]
fn order_by_is_stable() {
    let x = Var::new("x");
    let e = Expr::Flwor(Flwor::new(
        vec![
            Clause::for_in(&x, Expr::range(Expr::int(1), Expr::int(6))),
            Clause::OrderBy(vec![OrderKey::asc(modulo(Expr::var(&x), 2))]),
        ],
        Expr::var(&x),
    ));
    assert_eq!(ints(&run(e)), [2, 4, 6, 1, 3, 5]);
}

fn with_empty_keys() -> Expr {
    // for $x in (1, 2, 3, 4)
    // let $k := if ($x = 2) then () else if ($x = 3) then xs:double("NaN") else $x
    // order by $k return $x
    let x = Var::new("x");
    let k = Var::new("k");
    let is = |n: i64| Expr::CmpG(CmpG::new(CmpOp::Eq, Expr::var(&x), Expr::int(n)));
    let key = Expr::If(If::new(
        is(2),
        Expr::empty(),
        Expr::If(If::new(is(3), Expr::double(f64::NAN), Expr::var(&x))),
    ));
    Expr::Flwor(Flwor::new(
        vec![
            Clause::for_in(&x, Expr::ints(&[1, 2, 3, 4])),
            Clause::let_(&k, key),
            Clause::OrderBy(vec![OrderKey::asc(Expr::var(&k))]),
        ],
        Expr::var(&x),
    ))
}

#[rstest]
#[case(EmptyOrder::Least, [2, 3, 1, 4])]
#[case(EmptyOrder::Greatest, [1, 4, 3, 2])]
fn empty_keys_follow_the_configured_order(#[case] order: EmptyOrder, #[case] expected: [i64; 4]) {
    let options = QueryOptions::builder().with_empty_order(order).build();
    assert_eq!(ints(&run_with(with_empty_keys(), options)), expected);
}

#[rstest]
fn group_by_rebinds_the_other_variables() {
    let x = Var::new("x");
    let k = Var::new("k");
    let e = Expr::Flwor(Flwor::new(
        vec![
            Clause::for_in(&x, Expr::range(Expr::int(1), Expr::int(5))),
            Clause::let_(&k, modulo(Expr::var(&x), 2)),
            Clause::GroupBy(vec![GroupSpec {
                var: k.clone(),
                expr: None,
            }]),
            Clause::OrderBy(vec![OrderKey::asc(Expr::var(&k))]),
        ],
        count(Expr::var(&x)),
    ));
    assert_eq!(ints(&run(e)), [2, 3]);
}

#[rstest]
fn count_clause_numbers_tuples() {
    let x = Var::new("x");
    let c = Var::new("c");
    let e = Expr::Flwor(Flwor::new(
        vec![
            Clause::for_in(&x, Expr::ints(&[5, 6, 7])),
            Clause::Count(c.clone()),
            Clause::Where(Expr::CmpG(CmpG::new(CmpOp::Ge, Expr::var(&c), Expr::int(2)))),
        ],
        Expr::var(&x),
    ));
    assert_eq!(ints(&run(e)), [6, 7]);
}

#[rstest]
fn positional_variable() {
    let x = Var::new("x");
    let i = Var::new("i");
    let e = Expr::Flwor(Flwor::new(
        vec![
            Clause::For {
                var: x.clone(),
                pos: Some(i.clone()),
                allowing_empty: false,
                expr: Expr::ints(&[10, 20, 30]),
            },
            Clause::Where(Expr::CmpG(CmpG::new(CmpOp::Eq, Expr::var(&i), Expr::int(2)))),
        ],
        Expr::var(&x),
    ));
    assert_eq!(ints(&run(e)), [20]);
}

#[rstest]
fn for_streams_its_input() {
    let x = Var::new("x");
    let e = Expr::Flwor(Flwor::new(
        vec![Clause::for_in(&x, Expr::range(Expr::int(1), Expr::int(i64::MAX)))],
        Expr::Arith(Arith::new(Calc::Mul, Expr::var(&x), Expr::int(2))),
    ));
    let s = store();
    let mut ctx = QueryContext::new(&s);
    let e = e.compile(&mut ctx).unwrap();
    let mut it = e.iter(&mut ctx).unwrap();
    assert_eq!(
        it.next(&mut ctx).unwrap(),
        Some(XdmItem::Atomic(XdmAtomicValue::Integer(2)))
    );
    assert_eq!(
        it.next(&mut ctx).unwrap(),
        Some(XdmItem::Atomic(XdmAtomicValue::Integer(4)))
    );
}

#[rstest]
fn quantifiers_with_several_bindings() {
    let a = Var::new("a");
    let b = Var::new("b");
    let some = Expr::Quantified(Quantified::some(
        vec![(a.clone(), Expr::ints(&[1, 2])), (b.clone(), Expr::ints(&[2, 3]))],
        Expr::CmpG(CmpG::new(CmpOp::Eq, Expr::var(&a), Expr::var(&b))),
    ));
    assert_eq!(run(some), [XdmItem::Atomic(XdmAtomicValue::Boolean(true))]);
    let every = Expr::Quantified(Quantified::every(
        vec![(a.clone(), Expr::ints(&[1, 2]))],
        Expr::CmpG(CmpG::new(CmpOp::Lt, Expr::var(&a), Expr::int(2))),
    ));
    assert_eq!(run(every), [XdmItem::Atomic(XdmAtomicValue::Boolean(false))]);
}

#[rstest]
fn group_contents_keep_their_order() {
    // for $i in (1, 2, 3) group by $k := ("a", "b", "a")[$i] order by $k return $i
    let i = Var::new("i");
    let k = Var::new("k");
    let keys = ["a", "b", "a"];
    let key = keys
        .iter()
        .enumerate()
        .fold(Expr::empty(), |acc, (n, key)| {
            let pos = i64::try_from(n).unwrap() + 1;
            Expr::If(If::new(
                Expr::CmpG(CmpG::new(CmpOp::Eq, Expr::var(&i), Expr::int(pos))),
                Expr::string(key),
                acc,
            ))
        });
    let e = Expr::Flwor(Flwor::new(
        vec![
            Clause::for_in(&i, Expr::ints(&[1, 2, 3])),
            Clause::GroupBy(vec![GroupSpec {
                var: k.clone(),
                expr: Some(key),
            }]),
            Clause::OrderBy(vec![OrderKey::asc(Expr::var(&k))]),
        ],
        Expr::var(&i),
    ));
    assert_eq!(ints(&run(e)), [1, 3, 2]);
}

#[rstest]
fn recompiling_changes_nothing() {
    let x = Var::new("x");
    let e = Expr::Flwor(Flwor::new(
        vec![
            Clause::for_in(&x, Expr::range(Expr::int(1), Expr::int(5))),
            Clause::Where(Expr::CmpG(CmpG::new(CmpOp::Gt, Expr::var(&x), Expr::int(3)))),
        ],
        Expr::var(&x),
    ));
    let s = store();
    let mut ctx = QueryContext::new(&s);
    let once = e.compile(&mut ctx).unwrap();
    let twice = once.clone().compile(&mut ctx).unwrap();
    assert_eq!(twice, once);
    assert_eq!(ints(&twice.value(&mut ctx).unwrap()), [4, 5]);
}

#[rstest]
fn conjunctive_where_moves_each_part_to_its_clause() {
    // for $a in (1, 2, 3) for $b in (10, 20) where $b = 20 and $a >= 2 return $a + $b
    let (a, b) = (Var::new("a"), Var::new("b"));
    let e = Expr::Flwor(Flwor::new(
        vec![
            Clause::for_in(&a, Expr::ints(&[1, 2, 3])),
            Clause::for_in(&b, Expr::ints(&[10, 20])),
            Clause::Where(Expr::And(vec![
                cmp(CmpOp::Eq, Expr::var(&b), 20),
                cmp(CmpOp::Ge, Expr::var(&a), 2),
            ])),
        ],
        add(&a, &b),
    ));
    let c = compiled(e.clone());
    let filtered = clauses(&c);
    assert_eq!(filtered.len(), 2);
    assert!(
        filtered
            .iter()
            .all(|c| matches!(c, Clause::For { expr: Expr::Filter(_), .. }))
    );
    assert_eq!(ints(&run(e)), [22, 23]);
}

#[rstest]
fn where_stays_below_the_clause_it_reads() {
    // for $a in (1, 2) let $d := $a * 10 where $d > 10 return $d
    let (a, d) = (Var::new("a"), Var::new("d"));
    let e = Expr::Flwor(Flwor::new(
        vec![
            Clause::for_in(&a, Expr::ints(&[1, 2])),
            Clause::let_(&d, Expr::Arith(Arith::new(Calc::Mul, Expr::var(&a), Expr::int(10)))),
            Clause::Where(cmp(CmpOp::Gt, Expr::var(&d), 10)),
        ],
        Expr::Arith(Arith::new(Calc::Add, Expr::var(&d), Expr::int(0))),
    ));
    let c = compiled(e.clone());
    assert!(matches!(clauses(&c).last(), Some(Clause::Where(_))));
    assert_eq!(ints(&run(e)), [20]);
}

fn at_where(op: CmpOp, n: i64, ret: fn(&Var, &Var) -> Expr) -> Expr {
    // for $x at $i in (10, 20, 30) where $i op n return ret($x, $i)
    let (x, i) = (Var::new("x"), Var::new("i"));
    Expr::Flwor(Flwor::new(
        vec![
            Clause::For {
                var: x.clone(),
                pos: Some(i.clone()),
                allowing_empty: false,
                expr: Expr::ints(&[10, 20, 30]),
            },
            Clause::Where(cmp(op, Expr::var(&i), n)),
        ],
        ret(&x, &i),
    ))
}

fn has_where(e: &Expr) -> bool {
    matches!(e, Expr::Flwor(f) if f.clauses.iter().any(|c| matches!(c, Clause::Where(_))))
}

#[rstest]
#[case::equal(CmpOp::Eq, 2, &[21])]
#[case::below(CmpOp::Lt, 3, &[11, 21])]
#[case::above(CmpOp::Ge, 2, &[21, 31])]
#[case::never(CmpOp::Eq, 0, &[])]
fn positional_where_becomes_a_predicate(
    #[case] op: CmpOp,
    #[case] n: i64,
    #[case] expected: &[i64],
) {
    let plus_one = |x: &Var, _: &Var| Expr::Arith(Arith::new(Calc::Add, Expr::var(x), Expr::int(1)));
    let c = compiled(at_where(op, n, plus_one));
    assert!(!has_where(&c), "{c:?}");
    assert_eq!(ints(&run(at_where(op, n, plus_one))), expected);
}

#[rstest]
fn positional_variable_read_elsewhere_keeps_the_where() {
    let c = compiled(at_where(CmpOp::Eq, 2, |_, i| Expr::var(i)));
    assert!(has_where(&c));
    assert_eq!(ints(&run(at_where(CmpOp::Eq, 2, |_, i| Expr::var(i)))), [2]);
}

#[rstest]
fn nested_flwor_in_return_is_unnested() {
    // for $x in (1, 2) return for $y in (10, 20) return $x + $y
    let (x, y) = (Var::new("x"), Var::new("y"));
    let inner = Expr::Flwor(Flwor::new(
        vec![Clause::for_in(&y, Expr::ints(&[10, 20]))],
        add(&x, &y),
    ));
    let e = Expr::Flwor(Flwor::new(vec![Clause::for_in(&x, Expr::ints(&[1, 2]))], inner));
    let c = compiled(e.clone());
    assert_eq!(clauses(&c).len(), 2);
    let Expr::Flwor(f) = &c else { unreachable!() };
    assert!(matches!(*f.ret, Expr::Arith(_)));
    assert_eq!(ints(&run(e)), [11, 21, 12, 22]);
}

#[rstest]
fn nested_flwor_bound_by_for_is_unnested() {
    // for $x in (for $y in (1, 2, 3) return $y * 10) where $x > 10 return $x + 1
    let (x, y) = (Var::new("x"), Var::new("y"));
    let inner = Expr::Flwor(Flwor::new(
        vec![Clause::for_in(&y, Expr::ints(&[1, 2, 3]))],
        Expr::Arith(Arith::new(Calc::Mul, Expr::var(&y), Expr::int(10))),
    ));
    let e = Expr::Flwor(Flwor::new(
        vec![
            Clause::for_in(&x, inner),
            Clause::Where(cmp(CmpOp::Gt, Expr::var(&x), 10)),
        ],
        Expr::Arith(Arith::new(Calc::Add, Expr::var(&x), Expr::int(1))),
    ));
    let c = compiled(e.clone());
    assert!(clauses(&c).iter().all(|c| !matches!(
        c,
        Clause::For { expr: Expr::Flwor(_), .. } | Clause::Let { expr: Expr::Flwor(_), .. }
    )));
    assert_eq!(ints(&run(e)), [21, 31]);
}

#[rstest]
#[case::invariant(false, 0)]
#[case::dependent(true, 1)]
fn let_moves_out_of_the_for_it_does_not_read(#[case] reads_x: bool, #[case] at: usize) {
    // for $x in (1, 2, 3) let $n := count(/r) [+ $x] return $x + $n
    let (x, n) = (Var::new("x"), Var::new("n"));
    let rs = count(Expr::Path(Path::absolute(vec![Step::child("r")])));
    let value = if reads_x {
        Expr::Arith(Arith::new(Calc::Add, rs, Expr::var(&x)))
    } else {
        rs
    };
    let e = Expr::Flwor(Flwor::new(
        vec![Clause::for_in(&x, Expr::ints(&[1, 2, 3])), Clause::let_(&n, value)],
        add(&x, &n),
    ));
    let c = compiled(e.clone());
    assert!(matches!(&clauses(&c)[at], Clause::Let { var, .. } if *var == n));
    let s = store();
    let mut ctx = QueryContext::new(&s).with_document_context();
    let expected: [i64; 3] = if reads_x { [3, 5, 7] } else { [2, 3, 4] };
    assert_eq!(ints(&evaluate(e, &mut ctx).unwrap()), expected);
}

fn window_sizes(w: Window) -> Vec<i64> {
    let v = w.var.clone();
    ints(&run(Expr::Flwor(Flwor::new(vec![Clause::Window(w)], count(Expr::var(&v))))))
}

fn cur(v: &Var) -> WindowVars {
    WindowVars {
        cur: Some(v.clone()),
        ..WindowVars::default()
    }
}

fn at(v: &Var) -> WindowVars {
    WindowVars {
        pos: Some(v.clone()),
        ..WindowVars::default()
    }
}

#[rstest]
fn tumbling_window_starts_close_the_previous_window() {
    // for tumbling window $w in 1 to 7 start $s when $s mod 3 = 1 return count($w)
    let (w, s) = (Var::new("w"), Var::new("s"));
    let start = WindowCond::when(cmp(CmpOp::Eq, modulo(Expr::var(&s), 3), 1)).with_vars(cur(&s));
    let window = Window::tumbling(&w, Expr::range(Expr::int(1), Expr::int(7)), start, None);
    assert_eq!(window_sizes(window), [3, 3, 1]);
}

#[rstest]
#[case::all(false, &[3, 3, 1])]
#[case::only_end(true, &[3, 3])]
fn tumbling_window_with_end(#[case] only_end: bool, #[case] expected: &[i64]) {
    // for tumbling window $w in 1 to 7 start $s when true() [only] end $e when $e - $s = 2
    let (w, s, e) = (Var::new("w"), Var::new("s"), Var::new("e"));
    let start = WindowCond::when(Expr::boolean(true)).with_vars(cur(&s));
    let distance = Expr::Arith(Arith::new(Calc::Sub, Expr::var(&e), Expr::var(&s)));
    let end = WindowCond::when(cmp(CmpOp::Eq, distance, 2)).with_vars(cur(&e));
    let mut window =
        Window::tumbling(&w, Expr::range(Expr::int(1), Expr::int(7)), start, Some(end));
    if only_end {
        window = window.only_end();
    }
    assert_eq!(window_sizes(window), expected);
}

#[rstest]
#[case::all(false, &[2, 2, 2, 1])]
#[case::only_end(true, &[2, 2, 2])]
fn sliding_windows_overlap(#[case] only_end: bool, #[case] expected: &[i64]) {
    // for sliding window $w in (5, 6, 7, 8) start at $i when true() end at $j when $j - $i = 1
    let (w, i, j) = (Var::new("w"), Var::new("i"), Var::new("j"));
    let start = WindowCond::when(Expr::boolean(true)).with_vars(at(&i));
    let distance = Expr::Arith(Arith::new(Calc::Sub, Expr::var(&j), Expr::var(&i)));
    let end = WindowCond::when(cmp(CmpOp::Eq, distance, 1)).with_vars(at(&j));
    let mut window = Window::sliding(&w, Expr::ints(&[5, 6, 7, 8]), start, end);
    if only_end {
        window = window.only_end();
    }
    assert_eq!(window_sizes(window), expected);
}

#[rstest]
fn window_binds_neighbours_of_the_start() {
    // for tumbling window $w in (1, 2, 3) start $s previous $p next $n when true()
    // return count(($p, $n))
    let (w, s, p, n) = (Var::new("w"), Var::new("s"), Var::new("p"), Var::new("n"));
    let vars = WindowVars {
        cur: Some(s.clone()),
        prev: Some(p.clone()),
        next: Some(n.clone()),
        ..WindowVars::default()
    };
    let start = WindowCond::when(Expr::boolean(true)).with_vars(vars);
    let window = Window::tumbling(&w, Expr::ints(&[1, 2, 3]), start, None);
    let e = Expr::Flwor(Flwor::new(
        vec![Clause::Window(window)],
        count(Expr::List(vec![Expr::var(&p), Expr::var(&n)])),
    ));
    assert_eq!(ints(&run(e)), [1, 2, 1]);
}
