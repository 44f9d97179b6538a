//! Index collaborator contract and an in-memory implementation.
//!
//! Lookups return node handles in document order. The optimizer only reads
//! statistics while compiling; [`IndexContext`] records what it found.
use crate::ft::options::FTOptions;
use crate::ft::tokenizer::{normalize_text, tokenize};
use crate::model::{NodeId, NodeKind, Storage};
use crate::xdm::{ExpandedName, parse_double};
use compact_str::CompactString;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    Text,
    Attribute,
    FullText,
    Range,
}

/// Name whose values a range index or statistics entry covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexName {
    Element(ExpandedName),
    Attribute(ExpandedName),
}

/// Value statistics for one element or attribute name.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexStats {
    pub min: f64,
    pub max: f64,
    /// Number of nodes carrying the name.
    pub count: usize,
    /// `false` once the data has changed since the statistics were collected.
    pub fresh: bool,
    /// Every element with this name has no element children.
    pub leaf: bool,
    /// Every value is numeric.
    pub numeric: bool,
}

impl IndexStats {
    /// Estimated number of values inside `[min, max]`, assuming a uniform spread.
    pub fn estimate(&self, min: f64, max: f64) -> usize {
        if !self.numeric || self.count == 0 {
            return self.count;
        }
        let lo = min.max(self.min);
        let hi = max.min(self.max);
        if lo > hi {
            return 0;
        }
        let span = self.max - self.min;
        if span <= 0.0 || !span.is_finite() {
            return self.count;
        }
        let frac = ((hi - lo) / span).clamp(0.0, 1.0);
        ((self.count as f64 * frac).ceil() as usize).clamp(1, self.count)
    }
}

/// A lookup executed by an index access leaf.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexQuery {
    /// Text nodes with exactly this value.
    Text(String),
    /// Attribute nodes with exactly this value, optionally restricted by name.
    Attribute {
        value: String,
        name: Option<ExpandedName>,
    },
    /// Nodes of the given name whose numeric value lies inside the bounds.
    Range {
        name: IndexName,
        min: f64,
        min_incl: bool,
        max: f64,
        max_incl: bool,
    },
    StringRange {
        name: IndexName,
        min: Option<String>,
        min_incl: bool,
        max: Option<String>,
        max_incl: bool,
    },
    /// Text nodes containing a normalized full-text token.
    Token(CompactString),
}

impl IndexQuery {
    pub fn kind(&self) -> IndexKind {
        match self {
            IndexQuery::Text(_) => IndexKind::Text,
            IndexQuery::Attribute { .. } => IndexKind::Attribute,
            IndexQuery::Range { .. } | IndexQuery::StringRange { .. } => IndexKind::Range,
            IndexQuery::Token(_) => IndexKind::FullText,
        }
    }

    /// Kind of the nodes the lookup returns.
    pub fn node_kind(&self) -> Option<NodeKind> {
        match self {
            IndexQuery::Text(_) | IndexQuery::Token(_) => Some(NodeKind::Text),
            IndexQuery::Attribute { .. } => Some(NodeKind::Attribute),
            IndexQuery::Range { name, .. } | IndexQuery::StringRange { name, .. } => match name {
                IndexName::Element(_) => Some(NodeKind::Element),
                IndexName::Attribute(_) => Some(NodeKind::Attribute),
            },
        }
    }
}

/// Compile-time record of a usable index: which kind answers a predicate and
/// how many results it is expected to return.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexContext {
    pub kind: IndexKind,
    pub cost: usize,
    pub fresh: bool,
    /// The lookup returns exactly the nodes the predicate accepts; no
    /// post-filtering is needed.
    pub exact: bool,
}

impl IndexContext {
    pub fn new(kind: IndexKind, cost: usize) -> Self {
        Self {
            kind,
            cost,
            fresh: true,
            exact: true,
        }
    }
}

/// Index collaborator consumed by the optimizer and by index access leaves.
pub trait IndexProvider {
    fn text_lookup(&self, value: &str) -> Vec<NodeId>;
    fn attribute_lookup(&self, value: &str, name: Option<&ExpandedName>) -> Vec<NodeId>;
    fn range_lookup(
        &self,
        name: &IndexName,
        min: f64,
        min_incl: bool,
        max: f64,
        max_incl: bool,
    ) -> Vec<NodeId>;
    fn string_range_lookup(
        &self,
        name: &IndexName,
        min: Option<&str>,
        min_incl: bool,
        max: Option<&str>,
        max_incl: bool,
    ) -> Vec<NodeId>;
    /// Text nodes containing `token`, normalized with [`ft_features`](Self::ft_features).
    fn token_lookup(&self, token: &str) -> Vec<NodeId>;
    /// Options the full-text index was built with; `None` if there is none.
    fn ft_features(&self) -> Option<&FTOptions>;
    fn stats(&self, name: &IndexName) -> Option<IndexStats>;
    /// Number of nodes covered, the upper bound of every cost estimate.
    fn node_count(&self) -> usize;

    fn lookup(&self, query: &IndexQuery) -> Vec<NodeId> {
        match query {
            IndexQuery::Text(v) => self.text_lookup(v),
            IndexQuery::Attribute { value, name } => self.attribute_lookup(value, name.as_ref()),
            IndexQuery::Range {
                name,
                min,
                min_incl,
                max,
                max_incl,
            } => self.range_lookup(name, *min, *min_incl, *max, *max_incl),
            IndexQuery::StringRange {
                name,
                min,
                min_incl,
                max,
                max_incl,
            } => self.string_range_lookup(
                name,
                min.as_deref(),
                *min_incl,
                max.as_deref(),
                *max_incl,
            ),
            IndexQuery::Token(t) => self.token_lookup(t),
        }
    }

    /// Estimated number of results of a lookup.
    fn cost(&self, query: &IndexQuery) -> usize {
        match query {
            IndexQuery::Range {
                name, min, max, ..
            } => match self.stats(name) {
                Some(s) => s.estimate(*min, *max).min(self.node_count()),
                None => self.node_count(),
            },
            IndexQuery::StringRange { name, .. } => self
                .stats(name)
                .map_or(self.node_count(), |s| s.count.min(self.node_count())),
            other => self.lookup(other).len(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct StatsAcc {
    min: f64,
    max: f64,
    count: usize,
    leaf: bool,
    numeric: bool,
}

impl StatsAcc {
    fn add(&mut self, value: &str, leaf: bool) {
        if self.count == 0 {
            self.min = f64::INFINITY;
            self.max = f64::NEG_INFINITY;
            self.leaf = true;
            self.numeric = true;
        }
        self.count += 1;
        self.leaf &= leaf;
        match parse_double(value) {
            Some(v) if !v.is_nan() => {
                self.min = self.min.min(v);
                self.max = self.max.max(v);
            }
            _ => self.numeric = false,
        }
    }
}

/// In-memory value, attribute, range and token index over a [`Storage`].
#[derive(Debug, Clone, Default)]
pub struct MemIndex {
    texts: HashMap<String, Vec<NodeId>>,
    attrs: HashMap<String, Vec<NodeId>>,
    tokens: HashMap<CompactString, Vec<NodeId>>,
    values: HashMap<IndexName, Vec<(NodeId, String)>>,
    stats: HashMap<IndexName, IndexStats>,
    ft: FTOptions,
    nodes: usize,
    version: u64,
}

impl MemIndex {
    pub fn build(store: &dyn Storage) -> Self {
        Self::with_ft_options(store, FTOptions::default())
    }

    pub fn with_ft_options(store: &dyn Storage, ft: FTOptions) -> Self {
        let mut index = MemIndex {
            ft,
            ..MemIndex::default()
        };
        index.optimize(store);
        index
    }

    /// Rebuild the lookup structures after updates. Statistics are kept but
    /// marked stale until [`optimize`](Self::optimize) runs.
    pub fn refresh(&mut self, store: &dyn Storage) {
        let old = std::mem::take(&mut self.stats);
        self.rebuild(store);
        self.stats = old
            .into_iter()
            .map(|(k, mut s)| {
                s.fresh = false;
                (k, s)
            })
            .collect();
        tracing::debug!(version = self.version, "index refreshed, statistics stale");
    }

    /// Full rebuild including statistics.
    pub fn optimize(&mut self, store: &dyn Storage) {
        let acc = self.rebuild(store);
        self.stats = acc
            .into_iter()
            .map(|(k, a)| {
                (
                    k,
                    IndexStats {
                        min: a.min,
                        max: a.max,
                        count: a.count,
                        fresh: true,
                        leaf: a.leaf,
                        numeric: a.numeric && a.count > 0,
                    },
                )
            })
            .collect();
        tracing::debug!(
            version = self.version,
            names = self.stats.len(),
            "index optimized"
        );
    }

    /// `true` if the index was built from the current store version.
    pub fn is_current(&self, store: &dyn Storage) -> bool {
        self.version == store.version()
    }

    fn rebuild(&mut self, store: &dyn Storage) -> HashMap<IndexName, StatsAcc> {
        self.texts.clear();
        self.attrs.clear();
        self.tokens.clear();
        self.values.clear();
        self.nodes = 0;
        self.version = store.version();
        let mut acc: HashMap<IndexName, StatsAcc> = HashMap::new();
        let mut stack = vec![store.root()];
        while let Some(node) = stack.pop() {
            self.nodes += 1;
            match store.kind(node) {
                NodeKind::Element => {
                    if let Some(q) = store.name_of(node) {
                        let name = IndexName::Element(q.expanded());
                        let value = store.string_value(node);
                        // the string value must live in at most one text node
                        let kids = store.children(node);
                        let leaf = kids.iter().all(|&c| store.kind(c) != NodeKind::Element)
                            && kids
                                .iter()
                                .filter(|&&c| store.kind(c) == NodeKind::Text)
                                .count()
                                <= 1;
                        acc.entry(name.clone()).or_default().add(&value, leaf);
                        self.values.entry(name).or_default().push((node, value));
                    }
                    for &a in store.attributes(node) {
                        self.nodes += 1;
                        let value = store.text_of(a).to_string();
                        if let Some(q) = store.name_of(a) {
                            let name = IndexName::Attribute(q.expanded());
                            acc.entry(name.clone()).or_default().add(&value, true);
                            self.values.entry(name).or_default().push((a, value.clone()));
                        }
                        self.attrs.entry(value).or_default().push(a);
                    }
                }
                NodeKind::Text => {
                    let value = store.text_of(node);
                    self.texts.entry(value.to_string()).or_default().push(node);
                    let mut seen: Vec<CompactString> = Vec::new();
                    for tok in tokenize(value) {
                        let norm = normalize_text(&tok.text, &self.ft);
                        if !seen.contains(&norm) {
                            seen.push(norm.clone());
                            self.tokens.entry(norm).or_default().push(node);
                        }
                    }
                }
                _ => {}
            }
            stack.extend(store.children(node).iter().rev());
        }
        acc
    }
}

fn in_bounds<T: PartialOrd>(v: &T, min: Option<&T>, min_incl: bool, max: Option<&T>, max_incl: bool) -> bool {
    let lo = match min {
        Some(m) if min_incl => v >= m,
        Some(m) => v > m,
        None => true,
    };
    let hi = match max {
        Some(m) if max_incl => v <= m,
        Some(m) => v < m,
        None => true,
    };
    lo && hi
}

impl IndexProvider for MemIndex {
    fn text_lookup(&self, value: &str) -> Vec<NodeId> {
        self.texts.get(value).cloned().unwrap_or_default()
    }

    fn attribute_lookup(&self, value: &str, name: Option<&ExpandedName>) -> Vec<NodeId> {
        let Some(hits) = self.attrs.get(value) else {
            return Vec::new();
        };
        match name {
            None => hits.clone(),
            Some(n) => {
                let key = IndexName::Attribute(n.clone());
                let named = self.values.get(&key);
                hits.iter()
                    .copied()
                    .filter(|h| named.is_some_and(|v| v.iter().any(|(id, _)| id == h)))
                    .collect()
            }
        }
    }

    fn range_lookup(
        &self,
        name: &IndexName,
        min: f64,
        min_incl: bool,
        max: f64,
        max_incl: bool,
    ) -> Vec<NodeId> {
        self.values
            .get(name)
            .map(|vals| {
                vals.iter()
                    .filter(|(_, v)| {
                        parse_double(v).is_some_and(|d| {
                            in_bounds(&d, Some(&min), min_incl, Some(&max), max_incl)
                        })
                    })
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn string_range_lookup(
        &self,
        name: &IndexName,
        min: Option<&str>,
        min_incl: bool,
        max: Option<&str>,
        max_incl: bool,
    ) -> Vec<NodeId> {
        self.values
            .get(name)
            .map(|vals| {
                vals.iter()
                    .filter(|(_, v)| in_bounds(&v.as_str(), min.as_ref(), min_incl, max.as_ref(), max_incl))
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn token_lookup(&self, token: &str) -> Vec<NodeId> {
        self.tokens.get(token).cloned().unwrap_or_default()
    }

    fn ft_features(&self) -> Option<&FTOptions> {
        Some(&self.ft)
    }

    fn stats(&self, name: &IndexName) -> Option<IndexStats> {
        self.stats.get(name).cloned()
    }

    fn node_count(&self) -> usize {
        self.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StorageMut;
    use crate::simple_store::{attr, doc, elem, text};

    fn store() -> crate::simple_store::SimpleStore {
        doc()
            .child(
                elem("shop")
                    .child(elem("item").attr(attr("id", "a")).child(elem("price").child(text("10"))))
                    .child(elem("item").attr(attr("id", "b")).child(elem("price").child(text("25"))))
                    .child(elem("item").attr(attr("id", "c")).child(elem("price").child(text("40")))),
            )
            .build()
    }

    #[test]
    fn lookups_return_document_order() {
        let s = store();
        let idx = MemIndex::build(&s);
        let price = IndexName::Element(ExpandedName::local("price"));
        let hits = idx.range_lookup(&price, 10.0, false, 40.0, true);
        assert_eq!(hits.len(), 2);
        assert_eq!(s.compare_order(hits[0], hits[1]), core::cmp::Ordering::Less);
        assert_eq!(idx.text_lookup("25").len(), 1);
        assert_eq!(idx.attribute_lookup("b", Some(&ExpandedName::local("id"))).len(), 1);
        assert!(idx.attribute_lookup("b", Some(&ExpandedName::local("x"))).is_empty());
        let stats = idx.stats(&price).unwrap();
        assert!(stats.leaf && stats.numeric && stats.fresh);
        assert_eq!((stats.min, stats.max, stats.count), (10.0, 40.0, 3));
    }

    #[test]
    fn refresh_marks_statistics_stale() {
        let mut s = store();
        let mut idx = MemIndex::build(&s);
        assert!(idx.is_current(&s));
        let shop = s.children(s.root())[0];
        s.insert_children(shop, 0, &[elem("item").into()]).unwrap();
        assert!(!idx.is_current(&s));
        idx.refresh(&s);
        let price = IndexName::Element(ExpandedName::local("price"));
        assert!(!idx.stats(&price).unwrap().fresh);
        idx.optimize(&s);
        assert!(idx.stats(&price).unwrap().fresh);
    }

    #[test]
    fn range_estimate_is_bounded() {
        let stats = IndexStats {
            min: 0.0,
            max: 100.0,
            count: 50,
            fresh: true,
            leaf: true,
            numeric: true,
        };
        assert_eq!(stats.estimate(200.0, 300.0), 0);
        assert_eq!(stats.estimate(f64::NEG_INFINITY, f64::INFINITY), 50);
        assert_eq!(stats.estimate(0.0, 50.0), 25);
    }
}
