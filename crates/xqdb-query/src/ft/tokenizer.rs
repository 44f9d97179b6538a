//! Word tokenization and token normalization.
use super::options::{FTCase, FTOptions};
use crate::runtime::Error;
use compact_str::{CompactString, ToCompactString};
use fancy_regex::Regex;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// A word of the searched text with its position information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: CompactString,
    /// Word position, starting at 0.
    pub pos: u32,
    pub sentence: u32,
    pub paragraph: u32,
}

/// Split `text` into words. Sentences end at `.`, `!` or `?`; paragraphs at
/// line breaks.
pub fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut cur = CompactString::default();
    let (mut sentence, mut paragraph) = (0u32, 0u32);
    let mut sentence_has_words = false;
    let mut paragraph_has_words = false;
    fn flush(cur: &mut CompactString, tokens: &mut Vec<Token>, sentence: u32, paragraph: u32) {
        if !cur.is_empty() {
            tokens.push(Token {
                text: std::mem::take(cur),
                pos: tokens.len() as u32,
                sentence,
                paragraph,
            });
        }
    }
    for ch in text.chars() {
        if ch.is_alphanumeric() || (is_combining_mark(ch) && !cur.is_empty()) {
            cur.push(ch);
            sentence_has_words = true;
            paragraph_has_words = true;
            continue;
        }
        flush(&mut cur, &mut tokens, sentence, paragraph);
        match ch {
            '.' | '!' | '?' if sentence_has_words => {
                sentence += 1;
                sentence_has_words = false;
            }
            '\n' if paragraph_has_words => {
                paragraph += 1;
                paragraph_has_words = false;
                if sentence_has_words {
                    sentence += 1;
                    sentence_has_words = false;
                }
            }
            _ => {}
        }
    }
    flush(&mut cur, &mut tokens, sentence, paragraph);
    tokens
}

/// Split a query string into words, ignoring positions.
pub fn words(text: &str) -> Vec<CompactString> {
    tokenize(text).into_iter().map(|t| t.text).collect()
}

/// Split a search string into query words. With wildcards enabled the
/// wildcard syntax must survive, so words are separated by whitespace only.
pub fn query_words(text: &str, opts: &FTOptions) -> Vec<CompactString> {
    if opts.wildcards {
        text.split_whitespace()
            .map(|w| w.trim_matches(|c: char| matches!(c, ',' | ';' | ':' | '!' | '"')))
            .filter(|w| !w.is_empty())
            .map(CompactString::from)
            .collect()
    } else {
        words(text)
    }
}

fn strip_diacritics(word: &str) -> CompactString {
    word.nfd().filter(|c| !is_combining_mark(*c)).collect()
}

/// Normalize a token of the searched text.
pub fn normalize_text(word: &str, opts: &FTOptions) -> CompactString {
    let mut w = match opts.case {
        FTCase::Insensitive => word.to_lowercase().to_compact_string(),
        _ => word.to_compact_string(),
    };
    if !opts.diacritics_sensitive {
        w = strip_diacritics(&w);
    }
    if opts.stemming {
        w = stem(&w);
    }
    w
}

/// Normalize a query token; `lowercase`/`uppercase` modes rewrite the query
/// side only.
pub fn normalize_query(word: &str, opts: &FTOptions) -> CompactString {
    let mut w = match opts.case {
        FTCase::Insensitive | FTCase::Lower => word.to_lowercase().to_compact_string(),
        FTCase::Upper => word.to_uppercase().to_compact_string(),
        FTCase::Sensitive => word.to_compact_string(),
    };
    if !opts.diacritics_sensitive {
        w = strip_diacritics(&w);
    }
    if opts.stemming && !opts.wildcards {
        w = stem(&w);
    }
    w
}

/// Light suffix-stripping stemmer for English.
pub fn stem(word: &str) -> CompactString {
    const RULES: &[(&str, &str)] = &[
        ("sses", "ss"),
        ("ies", "y"),
        ("ational", "ate"),
        ("ness", ""),
        ("ing", ""),
        ("edly", ""),
        ("ed", ""),
        ("ly", ""),
        ("es", ""),
        ("s", ""),
    ];
    for (suffix, repl) in RULES {
        if let Some(base) = word.strip_suffix(suffix)
            && base.chars().count() >= 3
            && !(*suffix == "s" && base.ends_with('s'))
        {
            let mut out = CompactString::from(base);
            out.push_str(repl);
            return out;
        }
    }
    word.to_compact_string()
}

/// Matches a single query word against normalized text tokens.
#[derive(Debug, Clone)]
pub enum TokenMatcher {
    Exact(CompactString),
    Wildcard(Regex),
}

impl TokenMatcher {
    pub fn new(query_word: &str, opts: &FTOptions) -> Result<Self, Error> {
        let word = normalize_query(query_word, opts);
        if opts.wildcards && (word.contains('.') || word.contains('\\')) {
            let pattern = wildcard_pattern(&word);
            return Ok(TokenMatcher::Wildcard(Regex::new(&pattern)?));
        }
        Ok(TokenMatcher::Exact(word))
    }

    pub fn matches(&self, normalized: &str) -> Result<bool, Error> {
        match self {
            TokenMatcher::Exact(w) => Ok(w == normalized),
            TokenMatcher::Wildcard(re) => Ok(re.is_match(normalized)?),
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, TokenMatcher::Exact(_))
    }
}

/// Translate full-text wildcard syntax (`.`, `.?`, `.*`, `.+`, `.{n,m}`,
/// backslash escapes) into an anchored regular expression.
fn wildcard_pattern(word: &str) -> String {
    let mut out = String::from("^(?:");
    let chars: Vec<char> = word.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                out.push_str(&fancy_regex::escape(&chars[i + 1].to_string()));
                i += 2;
                continue;
            }
            '.' => {
                out.push('.');
                match chars.get(i + 1) {
                    Some(q @ ('?' | '*' | '+')) => {
                        out.push(*q);
                        i += 1;
                    }
                    Some('{') => {
                        if let Some(end) = chars[i + 1..].iter().position(|c| *c == '}') {
                            let quant: String = chars[i + 1..=i + 1 + end].iter().collect();
                            out.push_str(&quant);
                            i += end + 1;
                        }
                    }
                    _ => {}
                }
            }
            c => out.push_str(&fancy_regex::escape(&c.to_string())),
        }
        i += 1;
    }
    out.push_str(")$");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_tracks_sentences() {
        let toks = tokenize("Hello world. Second sentence!\nNew para");
        let texts: Vec<&str> = toks.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, ["Hello", "world", "Second", "sentence", "New", "para"]);
        assert_eq!(toks[1].sentence, 0);
        assert_eq!(toks[2].sentence, 1);
        assert_eq!(toks[4].sentence, 2);
        assert_eq!(toks[4].paragraph, 1);
        assert_eq!(toks[5].pos, 5);
    }

    #[test]
    fn normalization_folds_case_and_diacritics() {
        let opts = FTOptions::default();
        assert_eq!(normalize_text("Café", &opts), "cafe");
        let sensitive = FTOptions {
            diacritics_sensitive: true,
            ..FTOptions::default()
        };
        assert_eq!(normalize_text("Café", &sensitive), "café");
    }

    #[test]
    fn stemmer_strips_common_suffixes() {
        assert_eq!(stem("running"), "runn");
        assert_eq!(stem("ponies"), "pony");
        assert_eq!(stem("class"), "class");
        assert_eq!(stem("books"), "book");
    }

    #[test]
    fn wildcards_translate_to_regex() {
        let opts = FTOptions {
            wildcards: true,
            ..FTOptions::default()
        };
        let m = TokenMatcher::new("data.*", &opts).unwrap();
        assert!(m.matches("database").unwrap());
        assert!(!m.matches("dat").unwrap());
        let m = TokenMatcher::new("h.llo", &opts).unwrap();
        assert!(m.matches("hello").unwrap());
        let m = TokenMatcher::new("x.{1,2}", &opts).unwrap();
        assert!(m.matches("xab").unwrap());
        assert!(!m.matches("xabc").unwrap());
    }
}
