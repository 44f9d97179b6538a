/// Combinators that merge full-text scores. All scores lie in `[0, 1]`;
/// 0 means "no match".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scoring {
    /// `and` averages two matching scores, `or` keeps the better one.
    #[default]
    Mean,
    /// Scores are treated as independent probabilities.
    Probabilistic,
}

impl Scoring {
    pub fn and(self, a: f64, b: f64) -> f64 {
        if a <= 0.0 || b <= 0.0 {
            return 0.0;
        }
        match self {
            Scoring::Mean => (a + b) / 2.0,
            Scoring::Probabilistic => a * b,
        }
    }

    pub fn or(self, a: f64, b: f64) -> f64 {
        match self {
            Scoring::Mean => a.max(b),
            Scoring::Probabilistic => a + b - a * b,
        }
    }

    /// Presence inversion, not numeric negation.
    pub fn not(self, a: f64) -> f64 {
        if a > 0.0 { 0.0 } else { 1.0 }
    }

    /// Score of a word query that matched `hits` of the `tokens` words of a text.
    pub fn words(hits: usize, tokens: usize) -> f64 {
        if hits == 0 || tokens == 0 {
            return 0.0;
        }
        (hits as f64 / tokens as f64).sqrt().clamp(f64::MIN_POSITIVE, 1.0)
    }

    /// Mean score of a sequence, used by scoring `let` clauses.
    pub fn mean<I: IntoIterator<Item = f64>>(scores: I) -> f64 {
        let (sum, n) = scores
            .into_iter()
            .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
        if n == 0 { 0.0 } else { sum / n as f64 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn and_requires_both_sides() {
        assert_eq!(Scoring::Mean.and(0.5, 0.0), 0.0);
        assert!((Scoring::Mean.and(0.4, 0.8) - 0.6).abs() < 1e-9);
        assert_eq!(Scoring::Probabilistic.and(0.5, 0.5), 0.25);
    }

    #[test]
    fn or_and_not() {
        assert_eq!(Scoring::Mean.or(0.2, 0.7), 0.7);
        assert_eq!(Scoring::Probabilistic.or(0.5, 0.5), 0.75);
        assert_eq!(Scoring::Mean.not(0.3), 0.0);
        assert_eq!(Scoring::Mean.not(0.0), 1.0);
        assert_eq!(Scoring::mean([0.5, 1.0]), 0.75);
        assert_eq!(Scoring::mean(Vec::new()), 0.0);
    }
}
