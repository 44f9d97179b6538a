use super::Expr;
use super::compare::CmpOp;

/// Inclusive range of context positions, `1 <= min <= max`.
/// `max == Pos::OPEN` leaves the range unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pos {
    min: usize,
    max: usize,
}

impl Pos {
    pub const OPEN: usize = usize::MAX;

    /// `None` if the range is empty.
    pub fn new(min: usize, max: usize) -> Option<Pos> {
        let min = min.max(1);
        (min <= max).then_some(Pos { min, max })
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn at(pos: usize) -> Option<Pos> {
        Pos::new(pos, pos)
    }

    pub fn matches(&self, pos: usize) -> bool {
        pos >= self.min && pos <= self.max
    }

    pub fn is_single(&self) -> bool {
        self.min == self.max
    }

    pub fn intersect(&self, other: &Pos) -> Option<Pos> {
        Pos::new(self.min.max(other.min), self.max.min(other.max))
    }

    /// Union of two ranges; `None` if they neither overlap nor touch.
    pub fn union(&self, other: &Pos) -> Option<Pos> {
        let touching = self.min <= other.max.saturating_add(1)
            && other.min <= self.max.saturating_add(1);
        touching.then(|| Pos {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        })
    }

    /// Rewrite `position() op value`. `None` if the comparison has no range form.
    pub(crate) fn from_cmp(op: CmpOp, value: f64) -> Option<Expr> {
        if value.is_nan() {
            return (op != CmpOp::Ne).then(|| Expr::boolean(false));
        }
        let integral = value.fract() == 0.0;
        let range = match op {
            CmpOp::Eq if integral && value >= 1.0 => Pos::at(value as usize),
            CmpOp::Eq => None,
            CmpOp::Lt => {
                let max = if integral { value - 1.0 } else { value.floor() };
                if max < 1.0 { None } else { Pos::new(1, max as usize) }
            }
            CmpOp::Le => {
                let max = value.floor();
                if max < 1.0 { None } else { Pos::new(1, max as usize) }
            }
            CmpOp::Gt => {
                let min = if integral { value + 1.0 } else { value.ceil() };
                Pos::new(min.max(1.0) as usize, Pos::OPEN)
            }
            CmpOp::Ge => Pos::new(value.ceil().max(1.0) as usize, Pos::OPEN),
            CmpOp::Ne => return None,
        };
        Some(range.map_or_else(|| Expr::boolean(false), Expr::Pos))
    }
}
