//! Which parts of a full-text expression a token index can answer.
//!
//! Each operator reports a plan bottom-up. Positive plans yield a superset of
//! the matching text nodes; negative plans yield exactly the text nodes that
//! must be excluded. Anything else needs a sequential scan.
use super::options::FTOptions;
use super::tokenizer::{TokenMatcher, normalize_query};
use super::{FTExpr, FTMode, FTWords, is_stop_word, phrases};
use crate::expr::Expr;
use crate::index::{IndexProvider, IndexQuery};
use crate::xdm::{XdmAtomicValue, XdmItem};

#[derive(Debug, Clone, PartialEq)]
pub enum FTPlan {
    Positive {
        nodes: Expr,
        /// The lookup accepts exactly the matching text nodes.
        exact: bool,
        cost: usize,
    },
    Negative {
        nodes: Expr,
        cost: usize,
    },
    Sequential,
}

impl FTPlan {
    fn positive(nodes: Expr, exact: bool, cost: usize) -> Self {
        FTPlan::Positive { nodes, exact, cost }
    }

    fn inexact(self) -> Self {
        match self {
            FTPlan::Positive { nodes, cost, .. } => FTPlan::positive(nodes, false, cost),
            _ => FTPlan::Sequential,
        }
    }
}

fn combine(mut nodes: Vec<Expr>, ctor: fn(Vec<Expr>) -> Expr) -> Expr {
    if nodes.len() == 1 {
        return nodes.remove(0);
    }
    ctor(nodes)
}

/// Query options must normalize tokens the same way the index did.
fn compatible(opts: &FTOptions, index: &FTOptions) -> bool {
    !opts.wildcards
        && opts.case == index.case
        && opts.diacritics_sensitive == index.diacritics_sensitive
        && opts.stemming == index.stemming
}

fn literal_strings(e: &Expr) -> Option<Vec<String>> {
    match e {
        Expr::Literal(XdmAtomicValue::String(s)) => Some(vec![s.clone()]),
        Expr::Value(items) => items
            .iter()
            .map(|i| match i {
                XdmItem::Atomic(XdmAtomicValue::String(s)) => Some(s.clone()),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}

fn plan_words(w: &FTWords, opts: &FTOptions, index: &dyn IndexProvider) -> FTPlan {
    let Some(strings) = literal_strings(&w.query) else {
        return FTPlan::Sequential;
    };
    if w.occurs.is_some_and(|(min, _)| min == 0) {
        return FTPlan::Sequential;
    }
    let phrases = phrases(&strings, w.mode, opts);
    if phrases.is_empty() {
        return FTPlan::Sequential;
    }
    let mut exact = w.occurs.is_none() && phrases.len() == 1;
    let mut sets = Vec::with_capacity(phrases.len());
    let mut costs = Vec::with_capacity(phrases.len());
    for phrase in &phrases {
        exact &= phrase.len() == 1;
        let mut leaves = Vec::new();
        let mut cost = usize::MAX;
        for word in phrase {
            if is_stop_word(word, opts) {
                exact = false;
                continue;
            }
            if TokenMatcher::new(word, opts).is_ok_and(|m| !m.is_exact()) {
                return FTPlan::Sequential;
            }
            let query = IndexQuery::Token(normalize_query(word, opts));
            cost = cost.min(index.cost(&query));
            leaves.push(Expr::IndexAccess(query));
        }
        if leaves.is_empty() {
            return FTPlan::Sequential;
        }
        sets.push(combine(leaves, Expr::Intersect));
        costs.push(cost);
    }
    match w.mode {
        FTMode::Any | FTMode::AnyWord => FTPlan::positive(
            combine(sets, Expr::Union),
            exact,
            costs.iter().sum::<usize>().min(index.node_count()),
        ),
        FTMode::All | FTMode::AllWords | FTMode::Phrase => FTPlan::positive(
            combine(sets, Expr::Intersect),
            exact,
            costs.into_iter().min().unwrap_or(0),
        ),
    }
}

impl FTExpr {
    /// Index plan of the expression under the active options `opts`.
    pub fn index_plan(&self, opts: &FTOptions, index: &dyn IndexProvider) -> FTPlan {
        let Some(features) = index.ft_features() else {
            return FTPlan::Sequential;
        };
        if !compatible(opts, features) {
            return match self {
                // inner options may restore compatibility
                FTExpr::Options(patch, e) => e.index_plan(&patch.apply(opts), index),
                _ => FTPlan::Sequential,
            };
        }
        match self {
            FTExpr::Words(w) => plan_words(w, opts, index),
            FTExpr::And(v) => {
                let mut pos = Vec::new();
                let mut negs = Vec::new();
                let mut exact = true;
                let mut cost = usize::MAX;
                let mut sequential = false;
                for e in v {
                    match e.index_plan(opts, index) {
                        FTPlan::Positive { nodes, exact: x, cost: c } => {
                            exact &= x;
                            cost = cost.min(c);
                            pos.push(nodes);
                        }
                        FTPlan::Negative { nodes, .. } => negs.push(nodes),
                        FTPlan::Sequential => sequential = true,
                    }
                }
                if pos.is_empty() {
                    if sequential {
                        return FTPlan::Sequential;
                    }
                    // not a and not b: exclude either
                    let cost = index.node_count();
                    return FTPlan::Negative {
                        nodes: combine(negs, Expr::Union),
                        cost,
                    };
                }
                let mut nodes = combine(pos, Expr::Intersect);
                if !negs.is_empty() {
                    let mut ops = vec![nodes];
                    ops.extend(negs);
                    nodes = Expr::Except(ops);
                }
                FTPlan::positive(nodes, exact && !sequential, cost)
            }
            FTExpr::Or(v) => {
                let plans: Vec<FTPlan> = v.iter().map(|e| e.index_plan(opts, index)).collect();
                if plans.iter().all(|p| matches!(p, FTPlan::Positive { .. })) {
                    let mut exact = true;
                    let mut cost = 0usize;
                    let mut nodes = Vec::with_capacity(plans.len());
                    for p in plans {
                        if let FTPlan::Positive { nodes: n, exact: x, cost: c } = p {
                            exact &= x;
                            cost = cost.saturating_add(c);
                            nodes.push(n);
                        }
                    }
                    return FTPlan::positive(
                        combine(nodes, Expr::Union),
                        exact,
                        cost.min(index.node_count()),
                    );
                }
                if plans.iter().all(|p| matches!(p, FTPlan::Negative { .. })) {
                    // not a or not b: exclude only what both exclude
                    let nodes = plans
                        .into_iter()
                        .filter_map(|p| match p {
                            FTPlan::Negative { nodes, .. } => Some(nodes),
                            _ => None,
                        })
                        .collect();
                    return FTPlan::Negative {
                        nodes: combine(nodes, Expr::Intersect),
                        cost: index.node_count(),
                    };
                }
                // mixed signs cannot be answered by one lookup
                FTPlan::Sequential
            }
            FTExpr::Not(e) => match e.index_plan(opts, index) {
                FTPlan::Positive {
                    nodes,
                    exact: true,
                    cost,
                } => FTPlan::Negative { nodes, cost },
                FTPlan::Negative { nodes, cost } => FTPlan::positive(nodes, true, cost),
                _ => FTPlan::Sequential,
            },
            FTExpr::MildNot(a, _) => a.index_plan(opts, index).inexact(),
            FTExpr::Select(s) => {
                let inner = s.expr.index_plan(opts, index);
                let literal_weight = s.weight.as_deref().is_none_or(Expr::is_value);
                if s.filters.is_empty() && literal_weight {
                    inner
                } else {
                    // positional filters are checked on the candidates
                    inner.inexact()
                }
            }
            FTExpr::Options(patch, e) => e.index_plan(&patch.apply(opts), index),
        }
    }
}
