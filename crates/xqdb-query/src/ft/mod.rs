//! Full-text predicates: `contains text` and the scoring operator algebra
//! below it.
pub mod analysis;
pub mod matching;
pub mod options;
pub mod scoring;
pub mod tokenizer;

use crate::expr::{Expr, check_simple};
use crate::runtime::{Error, ErrorCode, QueryContext};
use crate::xdm::{XdmAtomicValue, XdmItem};
use compact_str::CompactString;
use matching::{Match, Matches, PhraseWord, PosFilter, find_phrase, product};
use options::{FTOptions, FTOptionsPatch};
use scoring::Scoring;
use tokenizer::{Token, TokenMatcher, normalize_query, normalize_text, query_words, tokenize};

pub use analysis::FTPlan;
pub use matching::{FTBigUnit, FTContent, FTUnit};

/// How the strings of a word query combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FTMode {
    /// Each string is a phrase; one must match.
    #[default]
    Any,
    /// Each string is a phrase; all must match.
    All,
    /// All strings form a single phrase.
    Phrase,
    AnyWord,
    AllWords,
}

/// Word query leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct FTWords {
    pub query: Box<Expr>,
    pub mode: FTMode,
    /// `occurs at least/most` bounds on the number of matches.
    pub occurs: Option<(u32, Option<u32>)>,
}

impl FTWords {
    pub fn new(query: Expr, mode: FTMode) -> Self {
        Self {
            query: Box::new(query),
            mode,
            occurs: None,
        }
    }

    pub fn occurs(mut self, min: u32, max: Option<u32>) -> Self {
        self.occurs = Some((min, max));
        self
    }
}

/// Positional filters and weight applied to a full-text expression.
#[derive(Debug, Clone, PartialEq)]
pub struct FTSelect {
    pub expr: Box<FTExpr>,
    pub filters: Vec<PosFilter>,
    pub weight: Option<Box<Expr>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FTExpr {
    Words(FTWords),
    And(Vec<FTExpr>),
    Or(Vec<FTExpr>),
    /// `ftnot`: presence inversion.
    Not(Box<FTExpr>),
    /// `not in`: drops left matches that lie inside a right match.
    MildNot(Box<FTExpr>, Box<FTExpr>),
    Select(FTSelect),
    /// `using ...` options for the inner expression.
    Options(FTOptionsPatch, Box<FTExpr>),
}

impl FTExpr {
    /// Single string searched in `any` mode.
    pub fn word(s: &str) -> Self {
        FTExpr::Words(FTWords::new(Expr::string(s), FTMode::Any))
    }

    pub fn words(query: Expr, mode: FTMode) -> Self {
        FTExpr::Words(FTWords::new(query, mode))
    }

    pub fn not(e: FTExpr) -> Self {
        FTExpr::Not(Box::new(e))
    }

    pub fn mild_not(e: FTExpr, not_in: FTExpr) -> Self {
        FTExpr::MildNot(Box::new(e), Box::new(not_in))
    }

    pub fn select(e: FTExpr, filters: Vec<PosFilter>) -> Self {
        FTExpr::Select(FTSelect {
            expr: Box::new(e),
            filters,
            weight: None,
        })
    }

    pub fn weighted(e: FTExpr, weight: Expr) -> Self {
        FTExpr::Select(FTSelect {
            expr: Box::new(e),
            filters: Vec::new(),
            weight: Some(Box::new(weight)),
        })
    }

    pub fn using(patch: FTOptionsPatch, e: FTExpr) -> Self {
        FTExpr::Options(patch, Box::new(e))
    }

    /// Embedded XQuery expressions (search strings and weights).
    pub fn exprs(&self) -> Vec<&Expr> {
        let mut out = Vec::new();
        self.collect_exprs(&mut out);
        out
    }

    fn collect_exprs<'e>(&'e self, out: &mut Vec<&'e Expr>) {
        match self {
            FTExpr::Words(w) => out.push(&w.query),
            FTExpr::And(v) | FTExpr::Or(v) => v.iter().for_each(|e| e.collect_exprs(out)),
            FTExpr::Not(e) | FTExpr::Options(_, e) => e.collect_exprs(out),
            FTExpr::MildNot(a, b) => {
                a.collect_exprs(out);
                b.collect_exprs(out);
            }
            FTExpr::Select(s) => {
                s.expr.collect_exprs(out);
                out.extend(s.weight.as_deref());
            }
        }
    }

    pub fn exprs_mut(&mut self) -> Vec<&mut Expr> {
        let mut out = Vec::new();
        self.collect_exprs_mut(&mut out);
        out
    }

    fn collect_exprs_mut<'e>(&'e mut self, out: &mut Vec<&'e mut Expr>) {
        match self {
            FTExpr::Words(w) => out.push(&mut w.query),
            FTExpr::And(v) | FTExpr::Or(v) => v.iter_mut().for_each(|e| e.collect_exprs_mut(out)),
            FTExpr::Not(e) | FTExpr::Options(_, e) => e.collect_exprs_mut(out),
            FTExpr::MildNot(a, b) => {
                a.collect_exprs_mut(out);
                b.collect_exprs_mut(out);
            }
            FTExpr::Select(s) => {
                s.expr.collect_exprs_mut(out);
                out.extend(s.weight.as_deref_mut());
            }
        }
    }

    fn contains_not(&self) -> bool {
        match self {
            FTExpr::Not(_) => true,
            FTExpr::Words(_) => false,
            FTExpr::And(v) | FTExpr::Or(v) => v.iter().any(FTExpr::contains_not),
            FTExpr::Options(_, e) => e.contains_not(),
            FTExpr::MildNot(a, b) => a.contains_not() || b.contains_not(),
            FTExpr::Select(s) => s.expr.contains_not(),
        }
    }

    pub(crate) fn compile(self, ctx: &mut QueryContext<'_>) -> Result<FTExpr, Error> {
        fn compile_all(v: Vec<FTExpr>, ctx: &mut QueryContext<'_>) -> Result<Vec<FTExpr>, Error> {
            v.into_iter().map(|e| e.compile(ctx)).collect()
        }
        Ok(match self {
            FTExpr::Words(mut w) => {
                w.query = Box::new(w.query.compile(ctx)?);
                check_simple(&w.query)?;
                FTExpr::Words(w)
            }
            FTExpr::And(v) => flatten(compile_all(v, ctx)?, true),
            FTExpr::Or(v) => flatten(compile_all(v, ctx)?, false),
            FTExpr::Not(e) => match e.compile(ctx)? {
                FTExpr::Not(inner) => *inner,
                e => FTExpr::not(e),
            },
            FTExpr::MildNot(a, b) => {
                let b = b.compile(ctx)?;
                if b.contains_not() {
                    return Err(Error::from_code(
                        ErrorCode::FTDY0017,
                        "'not in' operand must not contain 'ftnot'",
                    ));
                }
                FTExpr::mild_not(a.compile(ctx)?, b)
            }
            FTExpr::Select(mut s) => {
                s.expr = Box::new(s.expr.compile(ctx)?);
                if let Some(w) = s.weight.take() {
                    let w = w.compile(ctx)?;
                    check_simple(&w)?;
                    if let Expr::Literal(lit) = &w {
                        check_weight(lit)?;
                    }
                    s.weight = Some(Box::new(w));
                }
                if s.filters.is_empty() && s.weight.is_none() {
                    *s.expr
                } else {
                    FTExpr::Select(s)
                }
            }
            FTExpr::Options(patch, e) => FTExpr::Options(patch, Box::new(e.compile(ctx)?)),
        })
    }

    /// Evaluate against the tokens of one searched text. `query` numbers the
    /// word operands in query order.
    pub(crate) fn eval(
        &self,
        tokens: &[Token],
        query: &mut u32,
        ctx: &mut QueryContext<'_>,
    ) -> Result<Matches, Error> {
        let scoring = ctx.scoring();
        match self {
            FTExpr::Words(w) => eval_words(w, tokens, query, ctx),
            FTExpr::And(v) => {
                let mut acc: Option<Matches> = None;
                for e in v {
                    let m = e.eval(tokens, query, ctx)?;
                    if !m.is_match() {
                        return Ok(Matches::none());
                    }
                    acc = Some(match acc {
                        None => m,
                        Some(prev) => Matches {
                            matches: product(&prev.matches, &m.matches, ctx)?,
                            score: scoring.and(prev.score, m.score),
                        },
                    });
                }
                Ok(acc.unwrap_or_else(Matches::none))
            }
            FTExpr::Or(v) => {
                let mut out = Matches::none();
                for e in v {
                    let m = e.eval(tokens, query, ctx)?;
                    if m.is_match() {
                        out.score = scoring.or(out.score, m.score);
                        out.matches.extend(m.matches);
                    }
                }
                Ok(out)
            }
            FTExpr::Not(e) => {
                let m = e.eval(tokens, query, ctx)?;
                let score = scoring.not(if m.is_match() { m.score } else { 0.0 });
                Ok(if score > 0.0 {
                    Matches::trivial()
                } else {
                    Matches::none()
                })
            }
            FTExpr::MildNot(a, b) => {
                let left = a.eval(tokens, query, ctx)?;
                if !left.is_match() {
                    return Ok(Matches::none());
                }
                let right = b.eval(tokens, query, ctx)?;
                let kept: Vec<Match> = left
                    .matches
                    .into_iter()
                    .filter(|m| !right.matches.iter().any(|r| m.covered_by(r)))
                    .collect();
                Ok(if kept.is_empty() {
                    Matches::none()
                } else {
                    Matches {
                        matches: kept,
                        score: left.score,
                    }
                })
            }
            FTExpr::Select(s) => {
                // weights are validated before the operand is evaluated
                let weight = match &s.weight {
                    Some(w) => Some(check_weight(&w.atomic_one(ctx)?)?),
                    None => None,
                };
                let mut m = s.expr.eval(tokens, query, ctx)?;
                let len = u32::try_from(tokens.len()).unwrap_or(u32::MAX);
                m.matches
                    .retain(|mt| s.filters.iter().all(|f| f.accepts(mt, len)));
                if m.matches.is_empty() {
                    return Ok(Matches::none());
                }
                if let Some(w) = weight {
                    // a weighted match stays a match
                    m.score = (m.score * w).clamp(f64::MIN_POSITIVE, 1.0);
                }
                Ok(m)
            }
            FTExpr::Options(patch, e) => {
                let opts = patch.apply(ctx.ft_options());
                let mut scope = ctx.ft_scope(opts);
                e.eval(tokens, query, &mut scope)
            }
        }
    }
}

fn flatten(v: Vec<FTExpr>, and: bool) -> FTExpr {
    let mut out = Vec::with_capacity(v.len());
    for e in v {
        match e {
            FTExpr::And(inner) if and => out.extend(inner),
            FTExpr::Or(inner) if !and => out.extend(inner),
            other => out.push(other),
        }
    }
    if out.len() == 1
        && let Some(only) = out.pop()
    {
        return only;
    }
    if and { FTExpr::And(out) } else { FTExpr::Or(out) }
}

fn check_weight(w: &XdmAtomicValue) -> Result<f64, Error> {
    match w.as_f64() {
        Some(v) if (0.0..=1000.0).contains(&v) => Ok(v),
        _ => Err(Error::from_code(
            ErrorCode::FTDY0016,
            format!("weight {} is outside [0, 1000]", w.lexical()),
        )),
    }
}

/// Search phrases of a word query, one entry per phrase.
pub(crate) fn phrases(strings: &[String], mode: FTMode, opts: &FTOptions) -> Vec<Vec<CompactString>> {
    let mut out: Vec<Vec<CompactString>> = match mode {
        FTMode::Any | FTMode::All => strings.iter().map(|s| query_words(s, opts)).collect(),
        FTMode::Phrase => vec![strings.iter().flat_map(|s| query_words(s, opts)).collect()],
        FTMode::AnyWord | FTMode::AllWords => strings
            .iter()
            .flat_map(|s| query_words(s, opts))
            .map(|w| vec![w])
            .collect(),
    };
    out.retain(|p| !p.is_empty());
    out
}

pub(crate) fn is_stop_word(word: &str, opts: &FTOptions) -> bool {
    !opts.stop_words.is_empty() && opts.is_stop_word(&normalize_query(word, opts))
}

fn eval_words(
    w: &FTWords,
    tokens: &[Token],
    query: &mut u32,
    ctx: &mut QueryContext<'_>,
) -> Result<Matches, Error> {
    let strings: Vec<String> = w
        .query
        .atomize_all(ctx)?
        .into_iter()
        .map(|a| a.lexical())
        .collect();
    let opts = ctx.ft_options().clone();
    let phrases = phrases(&strings, w.mode, &opts);
    if phrases.is_empty() {
        return Ok(Matches::none());
    }
    let normalized: Vec<CompactString> =
        tokens.iter().map(|t| normalize_text(&t.text, &opts)).collect();
    let conjunctive = matches!(w.mode, FTMode::All | FTMode::AllWords);
    let mut acc: Option<Vec<Match>> = None;
    for phrase in &phrases {
        let words = phrase
            .iter()
            .map(|word| {
                if is_stop_word(word, &opts) {
                    Ok(PhraseWord::Any)
                } else {
                    TokenMatcher::new(word, &opts).map(PhraseWord::Word)
                }
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let found = find_phrase(&words, &normalized, tokens, *query, ctx)?;
        *query += 1;
        acc = Some(match acc {
            None => found,
            Some(prev) if conjunctive => product(&prev, &found, ctx)?,
            Some(mut prev) => {
                prev.extend(found);
                prev
            }
        });
        if conjunctive && acc.as_ref().is_some_and(Vec::is_empty) {
            return Ok(Matches::none());
        }
    }
    let matches = acc.unwrap_or_default();
    let n = u32::try_from(matches.len()).unwrap_or(u32::MAX);
    if let Some((min, max)) = w.occurs
        && (n < min || max.is_some_and(|m| n > m))
    {
        return Ok(Matches::none());
    }
    if matches.is_empty() {
        return Ok(Matches::none());
    }
    Ok(Matches {
        score: Scoring::words(matches.len(), tokens.len()),
        matches,
    })
}

/// `input contains text ft`.
#[derive(Debug, Clone, PartialEq)]
pub struct FTContains {
    pub input: Box<Expr>,
    pub ft: FTExpr,
}

impl FTContains {
    pub fn new(input: Expr, ft: FTExpr) -> Self {
        Self {
            input: Box::new(input),
            ft,
        }
    }

    pub(crate) fn compile(mut self, ctx: &mut QueryContext<'_>) -> Result<Expr, Error> {
        self.input = Box::new(self.input.compile(ctx)?);
        check_simple(&self.input)?;
        self.ft = self.ft.compile(ctx)?;
        if self.input.is_empty_value() && !self.ft.contains_not() {
            return Ok(Expr::boolean(false));
        }
        Ok(Expr::FTContains(self))
    }

    /// Best score over the input items; 0 if no item matches.
    pub fn score(&self, ctx: &mut QueryContext<'_>) -> Result<f64, Error> {
        let scoring = ctx.scoring();
        let mut it = self.input.iter(ctx)?;
        let mut best = 0.0;
        let mut any = false;
        while let Some(item) = it.next(ctx)? {
            ctx.checkpoint()?;
            any = true;
            let text = match item {
                XdmItem::Node(n) => ctx.store().string_value(n),
                XdmItem::Atomic(a) => a.lexical(),
            };
            let tokens = tokenize(&text);
            let mut query = 0;
            let m = self.ft.eval(&tokens, &mut query, ctx)?;
            if m.is_match() {
                best = scoring.or(best, m.score);
            }
        }
        if !any {
            // an empty input is searched as an empty text
            let mut query = 0;
            let m = self.ft.eval(&[], &mut query, ctx)?;
            if m.is_match() {
                best = m.score;
            }
        }
        Ok(best)
    }
}
