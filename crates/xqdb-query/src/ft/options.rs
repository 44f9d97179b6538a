use std::sync::Arc;

/// Case matching mode (`using case ...` / `lowercase` / `uppercase`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FTCase {
    #[default]
    Insensitive,
    Sensitive,
    /// Query tokens are lower-cased and matched case-sensitively.
    Lower,
    /// Query tokens are upper-cased and matched case-sensitively.
    Upper,
}

/// Full-text match options in effect for a sub-expression.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FTOptions {
    pub case: FTCase,
    pub diacritics_sensitive: bool,
    pub stemming: bool,
    pub wildcards: bool,
    /// Tokens never matched; compared after case folding.
    pub stop_words: Arc<[String]>,
    pub language: Option<String>,
}

impl FTOptions {
    pub fn is_stop_word(&self, normalized: &str) -> bool {
        self.stop_words.iter().any(|w| w.eq_ignore_ascii_case(normalized))
    }
}

/// Partial option set attached to an `using` clause; unset fields inherit
/// the enclosing options.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FTOptionsPatch {
    pub case: Option<FTCase>,
    pub diacritics_sensitive: Option<bool>,
    pub stemming: Option<bool>,
    pub wildcards: Option<bool>,
    pub stop_words: Option<Vec<String>>,
    pub language: Option<String>,
}

impl FTOptionsPatch {
    pub fn case(mut self, case: FTCase) -> Self {
        self.case = Some(case);
        self
    }

    pub fn diacritics(mut self, sensitive: bool) -> Self {
        self.diacritics_sensitive = Some(sensitive);
        self
    }

    pub fn stemming(mut self, on: bool) -> Self {
        self.stemming = Some(on);
        self
    }

    pub fn wildcards(mut self, on: bool) -> Self {
        self.wildcards = Some(on);
        self
    }

    pub fn stop_words<I: IntoIterator<Item = S>, S: Into<String>>(mut self, words: I) -> Self {
        self.stop_words = Some(words.into_iter().map(Into::into).collect());
        self
    }

    pub fn language(mut self, lang: impl Into<String>) -> Self {
        self.language = Some(lang.into());
        self
    }

    pub fn apply(&self, base: &FTOptions) -> FTOptions {
        FTOptions {
            case: self.case.unwrap_or(base.case),
            diacritics_sensitive: self.diacritics_sensitive.unwrap_or(base.diacritics_sensitive),
            stemming: self.stemming.unwrap_or(base.stemming),
            wildcards: self.wildcards.unwrap_or(base.wildcards),
            stop_words: match &self.stop_words {
                Some(w) => w.clone().into(),
                None => base.stop_words.clone(),
            },
            language: self.language.clone().or_else(|| base.language.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_inherits_unset_fields() {
        let base = FTOptions {
            stemming: true,
            ..FTOptions::default()
        };
        let opts = FTOptionsPatch::default().case(FTCase::Sensitive).apply(&base);
        assert_eq!(opts.case, FTCase::Sensitive);
        assert!(opts.stemming);
        assert!(!opts.wildcards);
    }
}
