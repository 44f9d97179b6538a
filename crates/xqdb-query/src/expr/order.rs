//! Stable multi-key sorting for `order by`.
use super::compare::atomic_ordering;
use crate::runtime::Error;
use crate::xdm::XdmAtomicValue;
use core::cmp::Ordering;

/// Placement of empty keys (and NaN) relative to all other values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyOrder {
    #[default]
    Least,
    Greatest,
}

/// Direction and empty placement of one sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySpec {
    pub descending: bool,
    pub empty: EmptyOrder,
}

/// Key treated as empty for ordering purposes.
fn is_void(k: &Option<XdmAtomicValue>) -> bool {
    match k {
        None => true,
        Some(v) => v.as_f64().is_some_and(f64::is_nan),
    }
}

fn normalize(v: &XdmAtomicValue) -> XdmAtomicValue {
    match v {
        XdmAtomicValue::UntypedAtomic(s) => XdmAtomicValue::String(s.clone()),
        other => other.clone(),
    }
}

/// Compare two key tuples; later keys break ties of earlier ones.
pub fn compare_keys(
    a: &[Option<XdmAtomicValue>],
    b: &[Option<XdmAtomicValue>],
    specs: &[KeySpec],
) -> Result<Ordering, Error> {
    for ((x, y), spec) in a.iter().zip(b).zip(specs) {
        let ord = match (is_void(x), is_void(y)) {
            (true, true) => {
                // NaN sits between the empty sequence and every other value
                let nan = |k: &Option<XdmAtomicValue>| k.is_some();
                match spec.empty {
                    EmptyOrder::Least => nan(x).cmp(&nan(y)),
                    EmptyOrder::Greatest => nan(y).cmp(&nan(x)),
                }
            }
            (true, false) => match spec.empty {
                EmptyOrder::Least => Ordering::Less,
                EmptyOrder::Greatest => Ordering::Greater,
            },
            (false, true) => match spec.empty {
                EmptyOrder::Least => Ordering::Greater,
                EmptyOrder::Greatest => Ordering::Less,
            },
            (false, false) => match (x, y) {
                (Some(x), Some(y)) => {
                    atomic_ordering(&normalize(x), &normalize(y))?.unwrap_or(Ordering::Equal)
                }
                _ => Ordering::Equal,
            },
        };
        let ord = if spec.descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return Ok(ord);
        }
    }
    Ok(Ordering::Equal)
}

const INSERTION_THRESHOLD: usize = 8;

/// Stable sort with a fallible comparator: a median-of-three quicksort over
/// positions, with ties broken by original position.
pub fn stable_sort<T>(
    items: Vec<T>,
    mut cmp: impl FnMut(&T, &T) -> Result<Ordering, Error>,
) -> Result<Vec<T>, Error> {
    let mut idx: Vec<usize> = (0..items.len()).collect();
    {
        let mut less = |a: usize, b: usize| -> Result<bool, Error> {
            Ok(cmp(&items[a], &items[b])?.then(a.cmp(&b)) == Ordering::Less)
        };
        quicksort(&mut idx, &mut less)?;
    }
    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    Ok(idx.into_iter().filter_map(|i| slots[i].take()).collect())
}

fn quicksort(
    v: &mut [usize],
    less: &mut impl FnMut(usize, usize) -> Result<bool, Error>,
) -> Result<(), Error> {
    let mut v = v;
    loop {
        if v.len() <= INSERTION_THRESHOLD {
            return insertion_sort(v, less);
        }
        let p = partition(v, less)?;
        let (left, right) = std::mem::take(&mut v).split_at_mut(p);
        let right = &mut right[1..];
        // recurse into the smaller half to bound the stack depth
        if left.len() < right.len() {
            quicksort(left, less)?;
            v = right;
        } else {
            quicksort(right, less)?;
            v = left;
        }
    }
}

fn insertion_sort(
    v: &mut [usize],
    less: &mut impl FnMut(usize, usize) -> Result<bool, Error>,
) -> Result<(), Error> {
    for i in 1..v.len() {
        let mut j = i;
        while j > 0 && less(v[j], v[j - 1])? {
            v.swap(j, j - 1);
            j -= 1;
        }
    }
    Ok(())
}

/// Lomuto partition around the median of the first, middle and last element.
/// Returns the final pivot position.
fn partition(
    v: &mut [usize],
    less: &mut impl FnMut(usize, usize) -> Result<bool, Error>,
) -> Result<usize, Error> {
    let last = v.len() - 1;
    let mid = v.len() / 2;
    if less(v[mid], v[0])? {
        v.swap(mid, 0);
    }
    if less(v[last], v[0])? {
        v.swap(last, 0);
    }
    if less(v[last], v[mid])? {
        v.swap(last, mid);
    }
    v.swap(mid, last);
    let pivot = v[last];
    let mut store = 0;
    for i in 0..last {
        if less(v[i], pivot)? {
            v.swap(i, store);
            store += 1;
        }
    }
    v.swap(store, last);
    Ok(store)
}
