//! Lazy, pull-based item sequences.
//!
//! An [`ItemIter`] yields one item per [`ItemIter::next`] call. Iterators that
//! know their length report it through [`ItemIter::size`] and then also
//! support direct access through [`ItemIter::get`]; multi-pass consumers use
//! [`ItemIter::rewind`] or wrap a single-pass iterator in [`BufferedIter`].
use crate::model::NodeId;
use crate::runtime::{Error, QueryContext};
use crate::xdm::{SharedSequence, XdmAtomicValue, XdmItem, XdmSequence};
use core::cmp::Ordering;

pub trait ItemIter {
    fn next(&mut self, ctx: &mut QueryContext<'_>) -> Result<Option<XdmItem>, Error>;

    /// Exact number of items, if known without iterating.
    fn size(&self) -> Option<usize> {
        None
    }

    /// Item at `index` (0-based). Only meaningful when [`size`](Self::size) is known.
    fn get(&self, _index: usize) -> Option<XdmItem> {
        None
    }

    /// Restart at the first item. Returns `false` if the iterator cannot rewind.
    fn rewind(&mut self) -> bool {
        false
    }
}

pub type Iter<'e> = Box<dyn ItemIter + 'e>;

/// Drain an iterator into a vector.
pub fn collect(mut iter: Iter<'_>, ctx: &mut QueryContext<'_>) -> Result<XdmSequence, Error> {
    let mut out = match iter.size() {
        Some(n) => Vec::with_capacity(n),
        None => Vec::new(),
    };
    while let Some(item) = iter.next(ctx)? {
        out.push(item);
    }
    Ok(out)
}

pub struct EmptyIter;

impl ItemIter for EmptyIter {
    fn next(&mut self, _ctx: &mut QueryContext<'_>) -> Result<Option<XdmItem>, Error> {
        Ok(None)
    }
    fn size(&self) -> Option<usize> {
        Some(0)
    }
    fn rewind(&mut self) -> bool {
        true
    }
}

pub fn empty<'e>() -> Iter<'e> {
    Box::new(EmptyIter)
}

/// Iterator over a materialized sequence.
pub struct ValueIter {
    items: SharedSequence,
    pos: usize,
}

impl ValueIter {
    pub fn new(items: impl Into<SharedSequence>) -> Self {
        Self {
            items: items.into(),
            pos: 0,
        }
    }
}

impl ItemIter for ValueIter {
    fn next(&mut self, _ctx: &mut QueryContext<'_>) -> Result<Option<XdmItem>, Error> {
        let item = self.items.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        Ok(item)
    }
    fn size(&self) -> Option<usize> {
        Some(self.items.len())
    }
    fn get(&self, index: usize) -> Option<XdmItem> {
        self.items.get(index).cloned()
    }
    fn rewind(&mut self) -> bool {
        self.pos = 0;
        true
    }
}

pub fn value<'e>(items: impl Into<SharedSequence>) -> Iter<'e> {
    Box::new(ValueIter::new(items))
}

pub fn single<'e>(item: XdmItem) -> Iter<'e> {
    value(vec![item])
}

/// Integer range `from to to` with known size.
pub struct RangeIter {
    from: i64,
    to: i64,
    /// Next value; `None` once the range is exhausted.
    cur: Option<i64>,
}

impl RangeIter {
    pub fn new(from: i64, to: i64) -> Self {
        Self {
            from,
            to,
            cur: (from <= to).then_some(from),
        }
    }
}

impl ItemIter for RangeIter {
    fn next(&mut self, ctx: &mut QueryContext<'_>) -> Result<Option<XdmItem>, Error> {
        let Some(v) = self.cur else {
            return Ok(None);
        };
        ctx.checkpoint()?;
        self.cur = if v < self.to { Some(v + 1) } else { None };
        Ok(Some(XdmItem::Atomic(XdmAtomicValue::Integer(v))))
    }
    fn size(&self) -> Option<usize> {
        if self.to < self.from {
            return Some(0);
        }
        let span = i128::from(self.to) - i128::from(self.from) + 1;
        usize::try_from(span).ok()
    }
    fn get(&self, index: usize) -> Option<XdmItem> {
        let v = self.from.checked_add(i64::try_from(index).ok()?)?;
        (v <= self.to).then_some(XdmItem::Atomic(XdmAtomicValue::Integer(v)))
    }
    fn rewind(&mut self) -> bool {
        self.cur = (self.from <= self.to).then_some(self.from);
        true
    }
}

/// Buffers the items of a single-pass iterator so the sequence can be rewound.
pub struct BufferedIter<'e> {
    source: Option<Iter<'e>>,
    cache: Vec<XdmItem>,
    pos: usize,
}

impl<'e> BufferedIter<'e> {
    pub fn new(source: Iter<'e>) -> Self {
        Self {
            source: Some(source),
            cache: Vec::new(),
            pos: 0,
        }
    }
}

impl ItemIter for BufferedIter<'_> {
    fn next(&mut self, ctx: &mut QueryContext<'_>) -> Result<Option<XdmItem>, Error> {
        if let Some(item) = self.cache.get(self.pos) {
            self.pos += 1;
            return Ok(Some(item.clone()));
        }
        let Some(src) = self.source.as_mut() else {
            return Ok(None);
        };
        match src.next(ctx)? {
            Some(item) => {
                self.cache.push(item.clone());
                self.pos += 1;
                Ok(Some(item))
            }
            None => {
                self.source = None;
                Ok(None)
            }
        }
    }
    fn size(&self) -> Option<usize> {
        match &self.source {
            None => Some(self.cache.len()),
            Some(_) => None,
        }
    }
    fn get(&self, index: usize) -> Option<XdmItem> {
        self.source
            .is_none()
            .then(|| self.cache.get(index).cloned())
            .flatten()
    }
    fn rewind(&mut self) -> bool {
        self.pos = 0;
        true
    }
}

/// Make an iterator rewindable, buffering only if it cannot rewind itself.
pub fn rewindable<'e>(mut iter: Iter<'e>) -> Iter<'e> {
    if iter.rewind() {
        iter
    } else {
        Box::new(BufferedIter::new(iter))
    }
}

fn expect_node(item: XdmItem) -> Result<NodeId, Error> {
    match item {
        XdmItem::Node(n) => Ok(n),
        XdmItem::Atomic(_) => Err(Error::type_err("set operation expects nodes")),
    }
}

fn next_node(iter: &mut Iter<'_>, ctx: &mut QueryContext<'_>) -> Result<Option<NodeId>, Error> {
    iter.next(ctx)?.map(expect_node).transpose()
}

/// Multi-way document-order merge with duplicate removal. Every input must
/// already be in document order and duplicate free.
pub struct UnionIter<'e> {
    inputs: Vec<Iter<'e>>,
    heads: Vec<Option<NodeId>>,
    started: bool,
}

impl<'e> UnionIter<'e> {
    pub fn new(inputs: Vec<Iter<'e>>) -> Self {
        let heads = vec![None; inputs.len()];
        Self {
            inputs,
            heads,
            started: false,
        }
    }
}

impl ItemIter for UnionIter<'_> {
    fn next(&mut self, ctx: &mut QueryContext<'_>) -> Result<Option<XdmItem>, Error> {
        if !self.started {
            self.started = true;
            for (i, it) in self.inputs.iter_mut().enumerate() {
                self.heads[i] = next_node(it, ctx)?;
            }
        }
        let store = ctx.store();
        let mut min: Option<NodeId> = None;
        for head in self.heads.iter().flatten() {
            min = match min {
                Some(m) if store.compare_order(*head, m) != Ordering::Less => Some(m),
                _ => Some(*head),
            };
        }
        let Some(min) = min else {
            return Ok(None);
        };
        // advance every input positioned on the smallest node
        for i in 0..self.inputs.len() {
            if self.heads[i] == Some(min) {
                self.heads[i] = next_node(&mut self.inputs[i], ctx)?;
            }
        }
        Ok(Some(XdmItem::Node(min)))
    }
}

/// Document-order merge intersection of ordered, duplicate-free inputs.
pub struct IntersectIter<'e> {
    inputs: Vec<Iter<'e>>,
}

impl<'e> IntersectIter<'e> {
    pub fn new(inputs: Vec<Iter<'e>>) -> Self {
        Self { inputs }
    }
}

impl ItemIter for IntersectIter<'_> {
    fn next(&mut self, ctx: &mut QueryContext<'_>) -> Result<Option<XdmItem>, Error> {
        if self.inputs.is_empty() {
            return Ok(None);
        }
        let mut heads = Vec::with_capacity(self.inputs.len());
        for it in self.inputs.iter_mut() {
            match next_node(it, ctx)? {
                Some(n) => heads.push(n),
                None => return Ok(None),
            }
        }
        loop {
            ctx.checkpoint()?;
            let store = ctx.store();
            let mut max = heads[0];
            for &h in &heads[1..] {
                if store.compare_order(h, max) == Ordering::Greater {
                    max = h;
                }
            }
            let mut all_equal = true;
            for (i, it) in self.inputs.iter_mut().enumerate() {
                while store.compare_order(heads[i], max) == Ordering::Less {
                    match next_node(it, ctx)? {
                        Some(n) => heads[i] = n,
                        None => return Ok(None),
                    }
                }
                if heads[i] != max {
                    all_equal = false;
                }
            }
            if all_equal {
                return Ok(Some(XdmItem::Node(max)));
            }
        }
    }
}

/// Nodes of the first input that occur in none of the others.
pub struct ExceptIter<'e> {
    first: Iter<'e>,
    others: UnionIter<'e>,
    other_head: Option<NodeId>,
    started: bool,
}

impl<'e> ExceptIter<'e> {
    pub fn new(first: Iter<'e>, others: Vec<Iter<'e>>) -> Self {
        Self {
            first,
            others: UnionIter::new(others),
            other_head: None,
            started: false,
        }
    }
}

impl ItemIter for ExceptIter<'_> {
    fn next(&mut self, ctx: &mut QueryContext<'_>) -> Result<Option<XdmItem>, Error> {
        if !self.started {
            self.started = true;
            self.other_head = self.others.next(ctx)?.and_then(|i| i.as_node());
        }
        while let Some(node) = next_node(&mut self.first, ctx)? {
            let store = ctx.store();
            while let Some(o) = self.other_head {
                if store.compare_order(o, node) == Ordering::Less {
                    self.other_head = self.others.next(ctx)?.and_then(|i| i.as_node());
                } else {
                    break;
                }
            }
            if self.other_head != Some(node) {
                return Ok(Some(XdmItem::Node(node)));
            }
        }
        Ok(None)
    }
}

/// Sort nodes into document order and remove duplicates. Atomic items are a type error.
pub fn doc_order_distinct(
    ctx: &QueryContext<'_>,
    items: XdmSequence,
) -> Result<XdmSequence, Error> {
    let mut nodes = items
        .into_iter()
        .map(expect_node)
        .collect::<Result<Vec<_>, _>>()?;
    sort_nodes(ctx, &mut nodes);
    Ok(nodes.into_iter().map(XdmItem::Node).collect())
}

/// Sort node handles into document order, dropping duplicates.
pub fn sort_nodes(ctx: &QueryContext<'_>, nodes: &mut Vec<NodeId>) {
    let store = ctx.store();
    let ordered = nodes
        .windows(2)
        .all(|w| store.compare_order(w[0], w[1]) == Ordering::Less);
    if !ordered {
        nodes.sort_by(|a, b| store.compare_order(*a, *b));
        nodes.dedup();
    }
}
