//! Match model of full-text evaluation: every operator produces the set of
//! ways the searched text satisfies it, plus a score.
use super::tokenizer::{Token, TokenMatcher};
use crate::runtime::{Error, QueryContext};
use compact_str::CompactString;
use smallvec::SmallVec;

/// A run of text tokens matched by one query operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Position of the operand in the query, used by `ordered`.
    pub query: u32,
    pub start: u32,
    pub end: u32,
    pub sentences: (u32, u32),
    pub paragraphs: (u32, u32),
}

impl Span {
    fn of(tokens: &[Token], query: u32, start: usize, end: usize) -> Self {
        let (first, last) = (&tokens[start], &tokens[end]);
        Span {
            query,
            start: first.pos,
            end: last.pos,
            sentences: (first.sentence, last.sentence),
            paragraphs: (first.paragraph, last.paragraph),
        }
    }

    fn bounds(&self, unit: FTUnit) -> (u32, u32) {
        match unit {
            FTUnit::Words => (self.start, self.end),
            FTUnit::Sentences => self.sentences,
            FTUnit::Paragraphs => self.paragraphs,
        }
    }
}

/// One way of satisfying a full-text expression.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Match {
    pub spans: SmallVec<[Span; 4]>,
}

impl Match {
    fn single(span: Span) -> Self {
        Match {
            spans: SmallVec::from_elem(span, 1),
        }
    }

    fn join(&self, other: &Match) -> Match {
        let mut spans = self.spans.clone();
        spans.extend(other.spans.iter().copied());
        Match { spans }
    }

    /// `true` if every token position of `self` lies inside a span of `other`.
    pub fn covered_by(&self, other: &Match) -> bool {
        !other.spans.is_empty()
            && self.spans.iter().all(|s| {
                (s.start..=s.end).all(|p| other.spans.iter().any(|o| o.start <= p && p <= o.end))
            })
    }
}

/// All matches of an expression and the relevance of the best reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Matches {
    pub matches: Vec<Match>,
    pub score: f64,
}

impl Matches {
    pub fn none() -> Self {
        Matches {
            matches: Vec::new(),
            score: 0.0,
        }
    }

    /// A successful result without positions, as produced by `ftnot`.
    pub fn trivial() -> Self {
        Matches {
            matches: vec![Match::default()],
            score: 1.0,
        }
    }

    pub fn is_match(&self) -> bool {
        !self.matches.is_empty() && self.score > 0.0
    }
}

/// Pairwise combination of two match sets.
pub fn product(a: &[Match], b: &[Match], ctx: &mut QueryContext<'_>) -> Result<Vec<Match>, Error> {
    let mut out = Vec::with_capacity(a.len() * b.len());
    for x in a {
        ctx.checkpoint()?;
        out.extend(b.iter().map(|y| x.join(y)));
    }
    Ok(out)
}

/// Unit of `window` and `distance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FTUnit {
    Words,
    Sentences,
    Paragraphs,
}

/// Unit of `same`/`different` scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FTBigUnit {
    Sentence,
    Paragraph,
}

impl From<FTBigUnit> for FTUnit {
    fn from(u: FTBigUnit) -> Self {
        match u {
            FTBigUnit::Sentence => FTUnit::Sentences,
            FTBigUnit::Paragraph => FTUnit::Paragraphs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FTContent {
    AtStart,
    AtEnd,
    Entire,
}

/// Positional restriction applied by `FTSelect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PosFilter {
    Ordered,
    Window { size: u32, unit: FTUnit },
    /// Number of units between consecutive matched operands.
    Distance {
        min: u32,
        max: Option<u32>,
        unit: FTUnit,
    },
    Scope { same: bool, unit: FTBigUnit },
    Content(FTContent),
}

impl PosFilter {
    pub fn window(size: u32, unit: FTUnit) -> Self {
        PosFilter::Window { size, unit }
    }

    pub fn distance(min: u32, max: Option<u32>, unit: FTUnit) -> Self {
        PosFilter::Distance { min, max, unit }
    }

    pub fn same(unit: FTBigUnit) -> Self {
        PosFilter::Scope { same: true, unit }
    }

    pub fn different(unit: FTBigUnit) -> Self {
        PosFilter::Scope { same: false, unit }
    }

    /// `true` if `m` satisfies the filter in a text of `len` tokens.
    pub fn accepts(&self, m: &Match, len: u32) -> bool {
        let spans = &m.spans;
        match *self {
            PosFilter::Ordered => {
                let mut by_query: SmallVec<[&Span; 4]> = spans.iter().collect();
                by_query.sort_by_key(|s| (s.query, s.start));
                by_query.windows(2).all(|w| w[0].start <= w[1].start)
            }
            PosFilter::Window { size, unit } => {
                let lo = spans.iter().map(|s| s.bounds(unit).0).min();
                let hi = spans.iter().map(|s| s.bounds(unit).1).max();
                match (lo, hi) {
                    (Some(lo), Some(hi)) => hi - lo < size,
                    _ => true,
                }
            }
            PosFilter::Distance { min, max, unit } => {
                let mut sorted: SmallVec<[&Span; 4]> = spans.iter().collect();
                sorted.sort_by_key(|s| s.start);
                sorted.windows(2).all(|w| {
                    let (_, prev_end) = w[0].bounds(unit);
                    let (next_start, _) = w[1].bounds(unit);
                    let gap = match unit {
                        FTUnit::Words => next_start.saturating_sub(prev_end + 1),
                        _ => next_start.saturating_sub(prev_end),
                    };
                    gap >= min && max.is_none_or(|m| gap <= m)
                })
            }
            PosFilter::Scope { same, unit } => {
                let unit = FTUnit::from(unit);
                if same {
                    let lo = spans.iter().map(|s| s.bounds(unit).0).min();
                    let hi = spans.iter().map(|s| s.bounds(unit).1).max();
                    lo == hi
                } else {
                    let mut seen: SmallVec<[u32; 4]> = SmallVec::new();
                    spans.iter().all(|s| {
                        let (a, b) = s.bounds(unit);
                        if a != b || seen.contains(&a) {
                            return false;
                        }
                        seen.push(a);
                        true
                    })
                }
            }
            PosFilter::Content(c) => {
                let last = len.saturating_sub(1);
                match c {
                    FTContent::AtStart => spans.iter().any(|s| s.start == 0),
                    FTContent::AtEnd => len > 0 && spans.iter().any(|s| s.end == last),
                    FTContent::Entire => {
                        len > 0
                            && (0..len).all(|p| spans.iter().any(|s| s.start <= p && p <= s.end))
                    }
                }
            }
        }
    }
}

/// Query word of a phrase; stop words match any single token.
pub(crate) enum PhraseWord {
    Word(TokenMatcher),
    Any,
}

/// Every occurrence of `phrase` as consecutive tokens.
pub(crate) fn find_phrase(
    phrase: &[PhraseWord],
    normalized: &[CompactString],
    tokens: &[Token],
    query: u32,
    ctx: &mut QueryContext<'_>,
) -> Result<Vec<Match>, Error> {
    let mut out = Vec::new();
    if phrase.is_empty() || phrase.len() > normalized.len() {
        return Ok(out);
    }
    'start: for start in 0..=normalized.len() - phrase.len() {
        ctx.checkpoint()?;
        for (offset, word) in phrase.iter().enumerate() {
            if let PhraseWord::Word(m) = word
                && !m.matches(&normalized[start + offset])?
            {
                continue 'start;
            }
        }
        out.push(Match::single(Span::of(
            tokens,
            query,
            start,
            start + phrase.len() - 1,
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(query: u32, start: u32, end: u32, sentence: u32) -> Span {
        Span {
            query,
            start,
            end,
            sentences: (sentence, sentence),
            paragraphs: (0, 0),
        }
    }

    fn of(spans: &[Span]) -> Match {
        Match {
            spans: spans.iter().copied().collect(),
        }
    }

    #[test]
    fn ordered_compares_query_order_with_text_order() {
        let m = of(&[span(0, 1, 1, 0), span(1, 4, 4, 0)]);
        assert!(PosFilter::Ordered.accepts(&m, 10));
        let m = of(&[span(0, 4, 4, 0), span(1, 1, 1, 0)]);
        assert!(!PosFilter::Ordered.accepts(&m, 10));
    }

    #[test]
    fn window_and_distance_count_words() {
        let m = of(&[span(0, 2, 2, 0), span(1, 5, 5, 0)]);
        assert!(PosFilter::window(4, FTUnit::Words).accepts(&m, 10));
        assert!(!PosFilter::window(3, FTUnit::Words).accepts(&m, 10));
        assert!(PosFilter::distance(2, Some(2), FTUnit::Words).accepts(&m, 10));
        assert!(!PosFilter::distance(0, Some(1), FTUnit::Words).accepts(&m, 10));
    }

    #[test]
    fn sentence_scopes() {
        let m = of(&[span(0, 0, 0, 0), span(1, 5, 5, 1)]);
        assert!(!PosFilter::same(FTBigUnit::Sentence).accepts(&m, 8));
        assert!(PosFilter::different(FTBigUnit::Sentence).accepts(&m, 8));
    }

    #[test]
    fn content_anchors() {
        let m = of(&[span(0, 0, 1, 0)]);
        assert!(PosFilter::Content(FTContent::AtStart).accepts(&m, 2));
        assert!(PosFilter::Content(FTContent::AtEnd).accepts(&m, 2));
        assert!(PosFilter::Content(FTContent::Entire).accepts(&m, 2));
        assert!(!PosFilter::Content(FTContent::Entire).accepts(&m, 3));
    }

    #[test]
    fn coverage_is_positional() {
        let york = of(&[span(0, 1, 1, 0)]);
        let new_york = of(&[span(1, 0, 1, 0)]);
        assert!(york.covered_by(&new_york));
        assert!(!new_york.covered_by(&york));
    }
}
