//! `for tumbling window` and `for sliding window` clauses.
//!
//! Windows are computed over the fully evaluated binding sequence, so a
//! FLWOR containing one is always evaluated over materialized tuples.
use super::flwor::{Tuple, counter, with_binds};
use super::{Expr, Var};
use crate::runtime::{Error, QueryContext};
use crate::xdm::{SharedSequence, XdmItem};

/// Variables a window condition binds for the item it is tested on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowVars {
    pub cur: Option<Var>,
    pub pos: Option<Var>,
    pub prev: Option<Var>,
    pub next: Option<Var>,
}

impl WindowVars {
    fn all(&self) -> impl Iterator<Item = &Var> {
        [&self.cur, &self.pos, &self.prev, &self.next]
            .into_iter()
            .flatten()
    }

    fn bind(&self, tuple: &mut Tuple, items: &[XdmItem], at: usize) {
        let item = |i: Option<usize>| -> SharedSequence {
            i.and_then(|i| items.get(i))
                .cloned()
                .into_iter()
                .collect::<Vec<_>>()
                .into()
        };
        if let Some(v) = &self.cur {
            tuple.push((v.id, item(Some(at))));
        }
        if let Some(v) = &self.pos {
            tuple.push((v.id, counter(at + 1)));
        }
        if let Some(v) = &self.prev {
            tuple.push((v.id, item(at.checked_sub(1))));
        }
        if let Some(v) = &self.next {
            tuple.push((v.id, item(Some(at + 1))));
        }
    }
}

/// `start|end $cur at $pos previous $prev next $next when expr`
#[derive(Debug, Clone, PartialEq)]
pub struct WindowCond {
    pub vars: WindowVars,
    pub when: Expr,
}

impl WindowCond {
    pub fn when(when: Expr) -> Self {
        Self {
            vars: WindowVars::default(),
            when,
        }
    }

    pub fn with_vars(mut self, vars: WindowVars) -> Self {
        self.vars = vars;
        self
    }

    fn holds(
        &self,
        ctx: &mut QueryContext<'_>,
        base: &Tuple,
        items: &[XdmItem],
        at: usize,
    ) -> Result<bool, Error> {
        let mut t = base.clone();
        self.vars.bind(&mut t, items, at);
        with_binds(ctx, &t, |c| self.when.ebv(c))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub sliding: bool,
    pub var: Var,
    pub expr: Expr,
    pub start: WindowCond,
    /// Required for sliding windows. A tumbling window without one ends
    /// before the next start.
    pub end: Option<WindowCond>,
    /// `only end`: drop windows whose end condition never held.
    pub only_end: bool,
}

impl Window {
    pub fn tumbling(var: &Var, expr: Expr, start: WindowCond, end: Option<WindowCond>) -> Self {
        Self {
            sliding: false,
            var: var.clone(),
            expr,
            start,
            end,
            only_end: false,
        }
    }

    pub fn sliding(var: &Var, expr: Expr, start: WindowCond, end: WindowCond) -> Self {
        Self {
            sliding: true,
            ..Self::tumbling(var, expr, start, Some(end))
        }
    }

    pub fn only_end(mut self) -> Self {
        self.only_end = true;
        self
    }

    pub fn exprs(&self) -> Vec<&Expr> {
        let mut out = vec![&self.expr, &self.start.when];
        out.extend(self.end.as_ref().map(|e| &e.when));
        out
    }

    pub fn exprs_mut(&mut self) -> Vec<&mut Expr> {
        let mut out = vec![&mut self.expr, &mut self.start.when];
        out.extend(self.end.as_mut().map(|e| &mut e.when));
        out
    }

    pub fn vars(&self) -> Vec<&Var> {
        std::iter::once(&self.var)
            .chain(self.start.vars.all())
            .chain(self.end.iter().flat_map(|e| e.vars.all()))
            .collect()
    }

    /// Extend `outer` with one tuple per window over `items`, in order of the window starts.
    pub(crate) fn tuples(
        &self,
        ctx: &mut QueryContext<'_>,
        outer: &Tuple,
        items: &[XdmItem],
    ) -> Result<Vec<Tuple>, Error> {
        let n = items.len();
        let mut out = Vec::new();
        let mut i = 0;
        while i < n {
            ctx.checkpoint()?;
            if !self.start.holds(ctx, outer, items, i)? {
                i += 1;
                continue;
            }
            let mut opened = outer.clone();
            self.start.vars.bind(&mut opened, items, i);
            let Some(end) = &self.end else {
                // the next start closes this window
                let mut j = i + 1;
                while j < n && !self.start.holds(ctx, outer, items, j)? {
                    j += 1;
                }
                out.push(self.emit(opened, items, i, j - 1, None));
                i = j;
                continue;
            };
            let mut closed = None;
            for j in i..n {
                if end.holds(ctx, &opened, items, j)? {
                    closed = Some(j);
                    break;
                }
            }
            match closed {
                Some(j) => out.push(self.emit(opened, items, i, j, Some(end))),
                None if self.only_end => {}
                None => out.push(self.emit(opened, items, i, n - 1, Some(end))),
            }
            i = match (self.sliding, closed) {
                (true, _) => i + 1,
                (false, Some(j)) => j + 1,
                (false, None) => n,
            };
        }
        Ok(out)
    }

    fn emit(
        &self,
        mut tuple: Tuple,
        items: &[XdmItem],
        from: usize,
        to: usize,
        end: Option<&WindowCond>,
    ) -> Tuple {
        tuple.push((self.var.id, items[from..=to].to_vec().into()));
        if let Some(end) = end {
            end.vars.bind(&mut tuple, items, to);
        }
        tuple
    }
}
