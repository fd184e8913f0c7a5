//! Fulltext search strings
//!
//! Grammar accepted in `ecm:fulltext = '...'`:
//! - space separated terms are ANDed
//! - a bare `OR` between terms splits the string into alternatives
//! - `-term` excludes a term, `"some words"` is a phrase
//! - a trailing `*` on a word is a prefix match
//!
//! Alternatives made only of exclusions cannot be searched and are dropped.

/// Analyzed fulltext query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FulltextQuery {
    Word(String),
    Phrase(String),
    And(Vec<FulltextQuery>),
    Or(Vec<FulltextQuery>),
    Not(Box<FulltextQuery>),
}

#[derive(Debug)]
enum Token {
    Or,
    Term {
        text: String,
        phrase: bool,
        negated: bool,
    },
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '*' || c == '\'' || c == '-'
}

fn clean_word(raw: &str) -> String {
    raw.trim_matches(|c: char| !(c.is_alphanumeric() || c == '*'))
        .to_string()
}

fn lex(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut negated = false;
        if c == '-' {
            chars.next();
            match chars.peek() {
                Some(n) if !n.is_whitespace() => negated = true,
                _ => continue,
            }
        }
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut phrase = String::new();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                phrase.push(c);
            }
            let phrase = phrase.split_whitespace().collect::<Vec<_>>().join(" ");
            if !phrase.is_empty() {
                tokens.push(Token::Term {
                    text: phrase,
                    phrase: true,
                    negated,
                });
            }
            continue;
        }
        let mut word = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() || c == '"' {
                break;
            }
            word.push(c);
            chars.next();
        }
        if word == "OR" && !negated {
            tokens.push(Token::Or);
            continue;
        }
        let word = clean_word(&word);
        if !word.is_empty() && word.chars().any(|c| c != '*') {
            tokens.push(Token::Term {
                text: word,
                phrase: false,
                negated,
            });
        }
    }
    tokens
}

fn group(terms: Vec<(FulltextQuery, bool)>) -> Option<FulltextQuery> {
    if !terms.iter().any(|(_, negated)| !negated) {
        return None;
    }
    let mut parts: Vec<FulltextQuery> = terms
        .into_iter()
        .map(|(q, negated)| {
            if negated {
                FulltextQuery::Not(Box::new(q))
            } else {
                q
            }
        })
        .collect();
    if parts.len() == 1 {
        parts.pop()
    } else {
        Some(FulltextQuery::And(parts))
    }
}

/// Analyze a fulltext search string; `None` when nothing is searchable.
pub fn analyze(text: &str) -> Option<FulltextQuery> {
    let mut alternatives = Vec::new();
    let mut current = Vec::new();
    for token in lex(text) {
        match token {
            Token::Or => {
                alternatives.extend(group(std::mem::take(&mut current)));
            }
            Token::Term {
                text,
                phrase,
                negated,
            } => {
                let q = if phrase {
                    FulltextQuery::Phrase(text)
                } else {
                    FulltextQuery::Word(text)
                };
                current.push((q, negated));
            }
        }
    }
    alternatives.extend(group(current));
    match alternatives.len() {
        0 => None,
        1 => alternatives.pop(),
        _ => Some(FulltextQuery::Or(alternatives)),
    }
}

/// Lower-cased words of a text, in order.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !is_word_char(c) || c == '-')
        .map(clean_word)
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Crude suffix stripping so that `documents` finds `document`.
pub fn stem(word: &str) -> &str {
    for suffix in ["ies", "es", "s"] {
        if word.len() > suffix.len() + 2 {
            if let Some(stripped) = word.strip_suffix(suffix) {
                return stripped;
            }
        }
    }
    word
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(s: &str) -> FulltextQuery {
        FulltextQuery::Word(s.into())
    }

    #[test]
    fn test_and_or_not() {
        assert_eq!(
            analyze("pete OR world"),
            Some(FulltextQuery::Or(vec![word("pete"), word("world")]))
        );
        assert_eq!(
            analyze("world Oyster"),
            Some(FulltextQuery::And(vec![word("world"), word("Oyster")]))
        );
        assert_eq!(
            analyze("Kangaroo -oyster"),
            Some(FulltextQuery::And(vec![
                word("Kangaroo"),
                FulltextQuery::Not(Box::new(word("oyster")))
            ]))
        );
    }

    #[test]
    fn test_phrases() {
        assert_eq!(
            analyze("\"Learn  commerce\""),
            Some(FulltextQuery::Phrase("Learn commerce".into()))
        );
        assert_eq!(
            analyze("Bobby -\"commerce easily\""),
            Some(FulltextQuery::And(vec![
                word("Bobby"),
                FulltextQuery::Not(Box::new(FulltextQuery::Phrase("commerce easily".into())))
            ]))
        );
    }

    #[test]
    fn test_unsearchable() {
        assert_eq!(analyze("   "), None);
        assert_eq!(analyze("-oyster"), None);
        assert_eq!(analyze("-a OR b"), Some(word("b")));
    }

    #[test]
    fn test_tokenize_and_stem() {
        assert_eq!(tokenize("Hello, World!"), vec!["hello", "world"]);
        assert_eq!(stem("documents"), "document");
        assert_eq!(stem("is"), "is");
    }
}
