//! Evaluation of compiled query trees over stored elements

use std::cmp::Ordering;

use crate::codec::{self, WireType, NULL_TYPE};
use crate::fulltext;
use crate::query::{wildcard_match, ElementPath, MatchOptions, QueryNode, RangeOp, Step};
use crate::tree::Element;

/// Elements reached by `path` below `root`.
pub(crate) fn select<'e>(root: &'e Element, path: &ElementPath) -> Vec<&'e Element> {
    let mut current = vec![root];
    for step in path.steps() {
        current = current
            .into_iter()
            .flat_map(|el| -> Vec<&'e Element> {
                match step {
                    Step::Element(name) => el.children_named(name).collect(),
                    Step::Item(None) => el.children.iter().filter(|c| c.is_array_item()).collect(),
                    Step::Item(Some(n)) => el
                        .children
                        .iter()
                        .filter(|c| c.is_array_item())
                        .nth(*n)
                        .into_iter()
                        .collect(),
                }
            })
            .collect();
    }
    current
}

/// Scalar texts at `path`, looking through list elements into their items.
fn leaf_values<'e>(root: &'e Element, path: &ElementPath) -> Vec<&'e str> {
    let mut out = Vec::new();
    for el in select(root, path) {
        if el.children.iter().any(Element::is_array_item) {
            for item in el.children.iter().filter(|c| c.is_array_item()) {
                push_leaf(item, &mut out);
            }
        } else {
            push_leaf(el, &mut out);
        }
    }
    out
}

fn push_leaf<'e>(el: &'e Element, out: &mut Vec<&'e str>) {
    match el.type_attr() {
        Some(NULL_TYPE) => {}
        Some(_) if el.is_leaf() => out.push(&el.text),
        None if el.is_leaf() && !el.text.is_empty() => out.push(&el.text),
        _ => {}
    }
}

fn is_empty_array(el: &Element) -> bool {
    el.is_leaf() && el.type_attr().is_none() && el.text.is_empty()
}

fn value_matches(text: &str, values: &[String], options: MatchOptions) -> bool {
    values.iter().any(|v| {
        if options.wildcarded {
            wildcard_match(v, text, options.case_insensitive)
        } else if options.case_insensitive {
            v.to_lowercase() == text.to_lowercase()
        } else {
            v == text
        }
    })
}

/// Typed comparison of stored text against query text.
pub(crate) fn compare_typed(wire_type: WireType, stored: &str, wanted: &str) -> Option<Ordering> {
    match wire_type {
        WireType::Long | WireType::Double => {
            let a: f64 = stored.parse().ok()?;
            let b: f64 = wanted.parse().ok()?;
            a.partial_cmp(&b)
        }
        WireType::Calendar => {
            let a = codec::parse_calendar(stored).ok()?;
            let b = codec::parse_calendar(wanted).ok()?;
            Some(a.cmp(&b))
        }
        WireType::Boolean => {
            let a = WireType::Boolean.parse(stored).ok()?.as_bool()?;
            let b = WireType::Boolean.parse(wanted).ok()?.as_bool()?;
            Some(a.cmp(&b))
        }
        WireType::String => Some(stored.cmp(wanted)),
    }
}

fn range_holds(op: RangeOp, ordering: Ordering) -> bool {
    match op {
        RangeOp::Eq => ordering.is_eq(),
        RangeOp::Ne => ordering.is_ne(),
        RangeOp::Lt => ordering.is_lt(),
        RangeOp::Le => ordering.is_le(),
        RangeOp::Gt => ordering.is_gt(),
        RangeOp::Ge => ordering.is_ge(),
    }
}

fn words_of(el: &Element) -> Vec<String> {
    el.leaf_texts()
        .into_iter()
        .flat_map(fulltext::tokenize)
        .map(|w| fulltext::stem(&w).to_string())
        .collect()
}

fn word_matches(term: &str, word: &str) -> bool {
    match term.strip_suffix('*') {
        Some(prefix) => word.starts_with(prefix),
        None => term == word,
    }
}

/// Number of occurrences of a word or phrase among `words`.
///
/// Several words in one term only match as a sequence.
fn occurrences(words: &[String], text: &str) -> usize {
    let terms: Vec<String> = fulltext::tokenize(text)
        .into_iter()
        .map(|w| match w.strip_suffix('*') {
            Some(prefix) => format!("{}*", fulltext::stem(prefix)),
            None => fulltext::stem(&w).to_string(),
        })
        .collect();
    match terms.as_slice() {
        [] => 0,
        [term] => words.iter().filter(|w| word_matches(term, w)).count(),
        _ => count_sequence(words, &terms),
    }
}

fn count_sequence(words: &[String], terms: &[String]) -> usize {
    if words.len() < terms.len() {
        return 0;
    }
    words
        .windows(terms.len())
        .filter(|window| window.iter().zip(terms).all(|(w, t)| word_matches(t, w)))
        .count()
}

/// Evaluates one query tree against one document, accumulating relevance.
pub(crate) struct Matcher {
    pub score: f64,
}

impl Matcher {
    pub fn new() -> Self {
        Self { score: 0.0 }
    }

    pub fn matches(&mut self, root: &Element, node: &QueryNode) -> bool {
        match node {
            QueryNode::And(children) => {
                let mut all = true;
                for child in children {
                    all &= self.matches(root, child);
                }
                all
            }
            QueryNode::Or(children) => {
                let mut any = false;
                for child in children {
                    any |= self.matches(root, child);
                }
                any
            }
            QueryNode::Not(inner) => {
                let mut inner_matcher = Matcher::new();
                !inner_matcher.matches(root, inner)
            }
            QueryNode::Value {
                path,
                values,
                options,
            } => leaf_values(root, path)
                .iter()
                .any(|text| value_matches(text, values, *options)),
            QueryNode::Range {
                path,
                wire_type,
                op,
                value,
                ..
            } => leaf_values(root, path).iter().any(|text| {
                compare_typed(*wire_type, text, value)
                    .map(|ord| range_holds(*op, ord))
                    .unwrap_or(false)
            }),
            QueryNode::Exists { path } => select(root, path).iter().any(|el| !is_empty_array(el)),
            QueryNode::Scoped { prefix, query } => {
                let mut found = false;
                for scope in select(root, prefix) {
                    if self.matches(scope, query) {
                        found = true;
                    }
                }
                found
            }
            QueryNode::Word { path, text, .. } => {
                let words: Vec<String> = match path {
                    None => words_of(root),
                    Some(p) => select(root, p).into_iter().flat_map(words_of).collect(),
                };
                let hits = occurrences(&words, text);
                self.score += hits as f64;
                hits > 0
            }
        }
    }
}

/// First scalar at `path`, used as the sort key.
pub(crate) fn sort_key<'e>(root: &'e Element, path: &ElementPath) -> Option<&'e str> {
    leaf_values(root, path).first().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{State, Value};
    use crate::tree;

    fn doc(state: &State) -> Element {
        tree::state_to_element(tree::ROOT, state)
    }

    #[test]
    fn test_value_through_list_items() {
        let el = doc(&State::new().with("tags", Value::Array(vec!["a".into(), "b".into()])));
        let mut m = Matcher::new();
        assert!(m.matches(&el, &QueryNode::value(ElementPath::field("tags"), "b")));
        assert!(!m.matches(&el, &QueryNode::value(ElementPath::field("tags"), "c")));
    }

    #[test]
    fn test_exists_ignores_empty_arrays() {
        let el = doc(&State::new().with("tags", Value::Array(Vec::new())));
        let mut m = Matcher::new();
        assert!(!m.matches(&el, &QueryNode::exists(ElementPath::field("tags"))));
    }

    #[test]
    fn test_typed_range() {
        let el = doc(&State::new().with("size", 12i64));
        let node = QueryNode::Range {
            path: ElementPath::field("size"),
            wire_type: WireType::Long,
            op: RangeOp::Gt,
            value: "9".into(),
            list: false,
        };
        assert!(Matcher::new().matches(&el, &node));
    }

    #[test]
    fn test_words_and_phrases() {
        let el = doc(&State::new().with("dc:title", "Learn commerce easily"));
        let mut m = Matcher::new();
        let word = |text: &str, phrase| QueryNode::Word {
            path: None,
            text: text.into(),
            phrase,
        };
        assert!(m.matches(&el, &word("Commerce", false)));
        assert!(m.matches(&el, &word("learn commerce", true)));
        assert!(!m.matches(&el, &word("commerce learn", true)));
        assert!(m.matches(&el, &word("eas*", false)));
        assert!(m.score > 0.0);
    }
}
