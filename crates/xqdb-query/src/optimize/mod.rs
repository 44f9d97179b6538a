//! Index rewrites of absolute location paths.
//!
//! A predicate is index-accessible if an index lookup returns the nodes that
//! satisfy it (or a superset of them). The path is then inverted: evaluation
//! starts at the lookup results and walks back to the nodes of the filtered
//! step, checking that the original path prefix could have reached them.
use crate::expr::path::is_positional;
use crate::expr::range::single_step;
use crate::expr::{Axis, CmpG, CmpOp, CmpR, CmpSR, Expr, NodeTest, Path, Step};
use crate::ft::{FTContains, FTPlan};
use crate::index::{IndexContext, IndexKind, IndexName, IndexProvider, IndexQuery};
use crate::model::NodeKind;
use crate::runtime::{Error, QueryContext};
use crate::xdm::{ExpandedName, XdmAtomicValue, XdmItem};

/// An index access answering one predicate of a step.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Lookup returning the nodes that satisfy the predicate.
    pub access: Expr,
    /// Steps leading from the lookup results back to the filtered nodes.
    pub back: Vec<Step>,
    pub info: IndexContext,
}

/// How the left operand of a predicate relates to the filtered node.
enum Operand {
    /// `text()`: text children.
    Text,
    /// `@name`
    Attribute(ExpandedName),
    /// `name`: leaf element children.
    Child(ExpandedName),
    /// `.` on leaf elements.
    Context,
}

fn operand(e: &Expr) -> Option<Operand> {
    if matches!(e, Expr::Context) {
        return Some(Operand::Context);
    }
    let step = single_step(e)?;
    match (step.axis, &step.test) {
        (Axis::Child, NodeTest::Text) => Some(Operand::Text),
        (Axis::Attribute, t) => t.exact_name().cloned().map(Operand::Attribute),
        (Axis::Child, t) => t.exact_name().cloned().map(Operand::Child),
        _ => None,
    }
}

/// `true` if every element named `name` has no element children, according
/// to statistics that are still current.
fn is_leaf(index: &dyn IndexProvider, name: &ExpandedName) -> bool {
    index
        .stats(&IndexName::Element(name.clone()))
        .is_some_and(|s| s.fresh && s.leaf)
}

fn parent(test: &NodeTest) -> Step {
    Step::new(Axis::Parent, test.clone())
}

fn literal_strings(e: &Expr) -> Option<Vec<String>> {
    let atom = |a: &XdmAtomicValue| match a {
        XdmAtomicValue::String(s) | XdmAtomicValue::UntypedAtomic(s) => Some(s.clone()),
        _ => None,
    };
    match e {
        Expr::Literal(a) => Some(vec![atom(a)?]),
        Expr::Value(items) if !items.is_empty() => items
            .iter()
            .map(|i| match i {
                XdmItem::Atomic(a) => atom(a),
                XdmItem::Node(_) => None,
            })
            .collect(),
        _ => None,
    }
}

fn union(mut nodes: Vec<Expr>) -> Expr {
    if nodes.len() == 1 {
        return nodes.remove(0);
    }
    Expr::Union(nodes)
}

/// `lhs = "v"` over text, attribute or leaf element values.
fn equality(c: &CmpG, step: &Step, index: &dyn IndexProvider) -> Option<Candidate> {
    if c.op != CmpOp::Eq {
        return None;
    }
    let values = literal_strings(&c.rhs)?;
    // empty strings have no text node to look up
    if values.iter().any(String::is_empty) {
        return None;
    }
    let (queries, back, exact): (Vec<IndexQuery>, Vec<Step>, bool) = match operand(&c.lhs)? {
        Operand::Text => (
            values.into_iter().map(IndexQuery::Text).collect(),
            vec![parent(&step.test)],
            true,
        ),
        Operand::Attribute(name) => (
            values
                .into_iter()
                .map(|value| IndexQuery::Attribute {
                    value,
                    name: Some(name.clone()),
                })
                .collect(),
            vec![parent(&step.test)],
            true,
        ),
        Operand::Child(name) if is_leaf(index, &name) => (
            values.into_iter().map(IndexQuery::Text).collect(),
            vec![parent(&NodeTest::Name(name)), parent(&step.test)],
            false,
        ),
        Operand::Context if step.test.exact_name().is_some_and(|n| is_leaf(index, n)) => (
            values.into_iter().map(IndexQuery::Text).collect(),
            vec![parent(&step.test)],
            false,
        ),
        _ => return None,
    };
    let kind = queries.first().map_or(IndexKind::Text, IndexQuery::kind);
    let cost = queries
        .iter()
        .map(|q| index.cost(q))
        .fold(0usize, usize::saturating_add);
    let access = union(queries.into_iter().map(Expr::IndexAccess).collect());
    let mut info = IndexContext::new(kind, cost);
    info.exact = exact;
    Some(Candidate { access, back, info })
}

/// Name whose values a range comparison reads.
fn range_target(expr: &Expr, index: &dyn IndexProvider) -> Option<IndexName> {
    match operand(expr)? {
        Operand::Attribute(name) => Some(IndexName::Attribute(name)),
        Operand::Child(name) if is_leaf(index, &name) => Some(IndexName::Element(name)),
        _ => None,
    }
}

fn range(r: &CmpR, step: &Step, index: &dyn IndexProvider) -> Option<Candidate> {
    if r.single {
        return None;
    }
    let name = range_target(&r.expr, index)?;
    let stats = index.stats(&name)?;
    if !stats.fresh || !stats.numeric {
        return None;
    }
    let query = IndexQuery::Range {
        name,
        min: r.min,
        min_incl: r.min_incl,
        max: r.max,
        max_incl: r.max_incl,
    };
    let cost = index.cost(&query);
    Some(Candidate {
        access: Expr::IndexAccess(query),
        back: vec![parent(&step.test)],
        info: IndexContext::new(IndexKind::Range, cost),
    })
}

fn string_range(r: &CmpSR, step: &Step, index: &dyn IndexProvider) -> Option<Candidate> {
    if r.single {
        return None;
    }
    let name = range_target(&r.expr, index)?;
    if !index.stats(&name)?.fresh {
        return None;
    }
    let query = IndexQuery::StringRange {
        name,
        min: r.min.clone(),
        min_incl: r.min_incl,
        max: r.max.clone(),
        max_incl: r.max_incl,
    };
    let cost = index.cost(&query);
    Some(Candidate {
        access: Expr::IndexAccess(query),
        back: vec![parent(&step.test)],
        info: IndexContext::new(IndexKind::Range, cost),
    })
}

fn full_text(
    f: &FTContains,
    step: &Step,
    index: &dyn IndexProvider,
    ctx: &QueryContext<'_>,
) -> Option<Candidate> {
    let exact_input = match operand(&f.input)? {
        Operand::Text => true,
        Operand::Context if step.test.exact_name().is_some_and(|n| is_leaf(index, n)) => false,
        _ => return None,
    };
    match f.ft.index_plan(ctx.ft_options(), index) {
        FTPlan::Positive { nodes, exact, cost } => {
            let mut info = IndexContext::new(IndexKind::FullText, cost);
            info.exact = exact && exact_input;
            Some(Candidate {
                access: nodes,
                back: vec![parent(&step.test)],
                info,
            })
        }
        // a negative plan would have to scan everything that is not excluded
        FTPlan::Negative { .. } | FTPlan::Sequential => None,
    }
}

/// Index access answering `pred` for the nodes selected by `step`.
pub fn index_accessible(
    pred: &Expr,
    step: &Step,
    ctx: &QueryContext<'_>,
) -> Option<Candidate> {
    let index = ctx.index()?;
    if step.test.kind(step.axis.principal()) != Some(NodeKind::Element) {
        return None;
    }
    match pred {
        Expr::CmpG(c) => equality(c, step, index),
        Expr::CmpR(r) => range(r, step, index),
        Expr::CmpSR(r) => string_range(r, step, index),
        Expr::FTContains(f) => full_text(f, step, index, ctx),
        Expr::Or(v) => {
            let mut parts = Vec::with_capacity(v.len());
            for e in v {
                parts.push(index_accessible(e, step, ctx)?);
            }
            let back = parts.first()?.back.clone();
            if parts.iter().any(|p| p.back != back) {
                return None;
            }
            let exact = parts.iter().all(|p| p.info.exact);
            let cost = parts
                .iter()
                .map(|p| p.info.cost)
                .fold(0usize, usize::saturating_add)
                .min(index.node_count());
            let kind = parts[0].info.kind;
            let mut info = IndexContext::new(kind, cost);
            info.exact = exact;
            Some(Candidate {
                access: Expr::Union(parts.into_iter().map(|p| p.access).collect()),
                back,
                info,
            })
        }
        Expr::And(v) => {
            // the cheapest conjunct drives; the others stay as a filter
            let mut best = v
                .iter()
                .filter_map(|e| index_accessible(e, step, ctx))
                .min_by_key(|c| c.info.cost)?;
            best.info.exact = false;
            Some(best)
        }
        _ => None,
    }
}

/// A step that can be walked backwards.
fn invertible(step: &Step) -> bool {
    matches!(
        step.axis,
        Axis::Child | Axis::Descendant | Axis::DescendantOrSelf
    ) && !step.positional()
}

/// Relative path that succeeds from a node selected by `steps[last]` iff the
/// node is reachable from the root through `steps`. `None` if every node of
/// the right kind is reachable.
fn invert_prefix(steps: &[Step]) -> Option<Expr> {
    let mut back = Vec::new();
    for k in (1..steps.len()).rev() {
        let axis = steps[k].axis.invert()?;
        let prev = &steps[k - 1];
        let mut inv = Step::new(axis, prev.test.clone());
        inv.preds = prev.preds.clone();
        back.push(inv);
    }
    if steps.first().is_some_and(|s| s.axis == Axis::Child) {
        back.push(Step::new(Axis::Parent, NodeTest::Document(None)));
    }
    if back.is_empty() {
        None
    } else {
        Some(Expr::Path(Path::relative(back)))
    }
}

/// Rewrite `path` so that it starts at `cand.access` instead of the root,
/// replacing predicate `pred` of step `at`.
pub fn index_equivalent(path: &Path, at: usize, pred: usize, cand: Candidate) -> Expr {
    let step = &path.steps[at];
    let mut preds: Vec<Expr> = step
        .preds
        .iter()
        .enumerate()
        .filter(|(j, _)| *j != pred || !cand.info.exact)
        .map(|(_, p)| p.clone())
        .collect();
    preds.extend(invert_prefix(&path.steps[..=at]));
    let mut steps = cand.back;
    if let Some(last) = steps.last_mut() {
        last.preds = preds;
    }
    steps.extend(path.steps[at + 1..].iter().cloned());
    Expr::Path(Path::new(Some(cand.access), steps))
}

/// Replace the cheapest index-accessible predicate of an absolute path by an
/// index access, if that beats scanning the document.
pub(crate) fn rewrite_path(path: Path, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
    if !ctx.options().index_rewrite || !path.is_absolute() {
        return Ok(Expr::Path(path));
    }
    let Some(index) = ctx.index() else {
        return Ok(Expr::Path(path));
    };
    let mut best: Option<(usize, usize, Candidate)> = None;
    for (i, step) in path.steps.iter().enumerate() {
        if !invertible(step) {
            break;
        }
        for (j, pred) in step.preds.iter().enumerate() {
            if is_positional(pred) {
                continue;
            }
            if let Some(c) = index_accessible(pred, step, ctx)
                && best.as_ref().is_none_or(|(_, _, b)| c.info.cost < b.info.cost)
            {
                best = Some((i, j, c));
            }
        }
    }
    let Some((i, j, cand)) = best else {
        return Ok(Expr::Path(path));
    };
    if cand.info.cost >= index.node_count() {
        tracing::debug!(
            cost = cand.info.cost,
            nodes = index.node_count(),
            "index access is not cheaper than a scan"
        );
        return Ok(Expr::Path(path));
    }
    tracing::debug!(
        kind = ?cand.info.kind,
        cost = cand.info.cost,
        exact = cand.info.exact,
        step = i,
        "rewrote path to index access"
    );
    Ok(index_equivalent(&path, i, j, cand))
}
