//! Translates a parsed query AST (`LabelMatch`/`LineFilter`/`DataFilter`
//! nodes, the predicate *shape* a LogQL parser would produce — the
//! grammar itself is out of scope) into a `ReadOptions`: label-equality
//! pruning, a `contains` pruning hint list, and a single conjoined
//! per-record filter closure.

use crate::entry::{LogEntry, ReadOptions};
use regex::Regex;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabelOp {
    Eq,
    Ne,
    Match,
    NotMatch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineOp {
    Contains,
    NotContains,
    Match,
    NotMatch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataOp {
    Eq,
    Ne,
    Match,
    NotMatch,
    Ge,
    Gt,
    Le,
    Lt,
}

#[derive(Clone, Debug)]
pub enum Predicate {
    LabelMatch { key: String, op: LabelOp, value: String },
    LineFilter { op: LineOp, value: String },
    /// `path` is a gjson-style dotted path (`"meta.count"`,
    /// `"items.0.name"`); see `gjson_lookup`.
    DataFilter { path: String, op: DataOp, value: String },
}

/// Compiles `predicates` into `opts`, preserving any `filter_func`
/// already set on `opts` by ANDing it in last (so a caller-supplied
/// filter and the compiled predicate filters both apply).
pub fn compile(predicates: &[Predicate], mut opts: ReadOptions) -> Result<ReadOptions, regex::Error> {
    let mut filters: Vec<Arc<dyn Fn(&LogEntry) -> bool + Send + Sync>> = Vec::new();

    for p in predicates {
        match p {
            Predicate::LabelMatch { key, op, value } => match op {
                LabelOp::Eq => {
                    opts.labels.insert(key.clone(), value.clone());
                }
                LabelOp::Ne => {
                    let key = key.clone();
                    let value = value.clone();
                    filters.push(Arc::new(move |e: &LogEntry| {
                        e.labels.get(&key).is_some_and(|v| v != &value)
                    }));
                }
                LabelOp::Match => {
                    let re = Regex::new(value)?;
                    let key = key.clone();
                    filters.push(Arc::new(move |e: &LogEntry| {
                        e.labels.get(&key).is_some_and(|v| re.is_match(v))
                    }));
                    push_literal_hint(&mut opts.contains, value);
                }
                LabelOp::NotMatch => {
                    let re = Regex::new(value)?;
                    let key = key.clone();
                    filters.push(Arc::new(move |e: &LogEntry| {
                        e.labels.get(&key).is_some_and(|v| !re.is_match(v))
                    }));
                    // !~ must never contribute a contains hint: a record
                    // lacking the pattern entirely is still a match, so
                    // requiring the substring would drop true positives.
                }
            },
            Predicate::LineFilter { op, value } => match op {
                LineOp::Contains => {
                    let value = value.clone();
                    filters.push(Arc::new(move |e: &LogEntry| {
                        contains_bytes(&e.data, value.as_bytes())
                    }));
                    opts.contains.push(value);
                }
                LineOp::NotContains => {
                    let value = value.clone();
                    filters.push(Arc::new(move |e: &LogEntry| {
                        !contains_bytes(&e.data, value.as_bytes())
                    }));
                }
                LineOp::Match => {
                    let re = Regex::new(value)?;
                    filters.push(Arc::new(move |e: &LogEntry| {
                        re.is_match(&String::from_utf8_lossy(&e.data))
                    }));
                    push_literal_hint(&mut opts.contains, value);
                }
                LineOp::NotMatch => {
                    let re = Regex::new(value)?;
                    filters.push(Arc::new(move |e: &LogEntry| {
                        !re.is_match(&String::from_utf8_lossy(&e.data))
                    }));
                }
            },
            Predicate::DataFilter { path, op, value } => {
                let path_key = path.clone();
                match op {
                    DataOp::Eq => {
                        let filter_value = value.clone();
                        filters.push(Arc::new(move |e: &LogEntry| {
                            gjson_lookup(&e.data, &path_key)
                                .is_some_and(|v| json_as_string(&v) == filter_value)
                        }));
                        // both the path's key literal(s) and the matched
                        // value are guaranteed present in a true match.
                        opts.contains.push(path.clone());
                        opts.contains.push(value.clone());
                    }
                    DataOp::Ne => {
                        let value = value.clone();
                        filters.push(Arc::new(move |e: &LogEntry| {
                            gjson_lookup(&e.data, &path_key).is_some_and(|v| json_as_string(&v) != value)
                        }));
                    }
                    DataOp::Match => {
                        let re = Regex::new(value)?;
                        filters.push(Arc::new(move |e: &LogEntry| {
                            gjson_lookup(&e.data, &path_key).is_some_and(|v| re.is_match(&json_as_string(&v)))
                        }));
                        opts.contains.push(path.clone());
                        push_literal_hint(&mut opts.contains, value);
                    }
                    DataOp::NotMatch => {
                        let re = Regex::new(value)?;
                        filters.push(Arc::new(move |e: &LogEntry| {
                            gjson_lookup(&e.data, &path_key)
                                .is_some_and(|v| !re.is_match(&json_as_string(&v)))
                        }));
                    }
                    DataOp::Ge | DataOp::Gt | DataOp::Le | DataOp::Lt => {
                        let threshold: f64 = value.parse().unwrap_or(f64::NAN);
                        let op = *op;
                        filters.push(Arc::new(move |e: &LogEntry| {
                            let Some(v) = gjson_lookup(&e.data, &path_key) else {
                                return false;
                            };
                            let Some(n) = v.as_f64() else { return false };
                            match op {
                                DataOp::Ge => n >= threshold,
                                DataOp::Gt => n > threshold,
                                DataOp::Le => n <= threshold,
                                DataOp::Lt => n < threshold,
                                _ => unreachable!(),
                            }
                        }));
                        // numeric comparisons aren't substring predicates;
                        // no contains hint.
                    }
                }
            }
        }
    }

    if let Some(existing) = opts.filter_func.take() {
        filters.push(existing);
    }
    if !filters.is_empty() {
        opts.filter_func = Some(Arc::new(move |e: &LogEntry| filters.iter().all(|f| f(e))));
    }
    Ok(opts)
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn json_as_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Minimal gjson-style dotted path lookup: `"a.b.0.c"` walks object key
/// `a`, object key `b`, array index `0`, object key `c`.
pub fn gjson_lookup(data: &[u8], path: &str) -> Option<serde_json::Value> {
    let root: serde_json::Value = serde_json::from_slice(data).ok()?;
    let mut cur = &root;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        cur = if let Ok(idx) = segment.parse::<usize>() {
            cur.as_array()?.get(idx)?
        } else {
            cur.as_object()?.get(segment)?
        };
    }
    Some(cur.clone())
}

/// Appends a literal substring extracted from `pattern` to `contains`,
/// if one can be extracted with a zero-false-negative guarantee: runs
/// of plain characters, stopping at any regex metacharacter and
/// discarding a trailing character made optional by a following `?` or
/// `*` (since that character is not guaranteed present). The longest
/// such safe run found anywhere in the pattern is kept; patterns with no
/// safe literal run (pure metacharacters, fully optional) contribute
/// nothing.
fn push_literal_hint(contains: &mut Vec<String>, pattern: &str) {
    if let Some(hint) = extract_literal_hint(pattern) {
        if !hint.is_empty() {
            contains.push(hint);
        }
    }
}

fn extract_literal_hint(pattern: &str) -> Option<String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut best = String::new();
    let mut current = String::new();
    let mut i = 0;
    let is_plain = |c: char| c.is_alphanumeric() || c == '_' || c == ' ' || c == '-';

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        if c == '\\' && next.is_some() {
            let escaped = next.unwrap();
            if matches!(chars.get(i + 2), Some('?') | Some('*')) {
                if current.len() > best.len() {
                    best = current.clone();
                }
                current.clear();
                i += 3;
                continue;
            }
            current.push(escaped);
            i += 2;
            continue;
        }
        if is_plain(c) {
            if matches!(next, Some('?') | Some('*')) {
                if current.len() > best.len() {
                    best = current.clone();
                }
                current.clear();
                i += 2;
                continue;
            }
            current.push(c);
            i += 1;
            continue;
        }
        // any other metacharacter (anchors, groups, alternation, classes,
        // `+` applied to the previous char, etc.) ends the current run
        // without contributing it past this point.
        if current.len() > best.len() {
            best = current.clone();
        }
        current.clear();
        i += 1;
    }
    if current.len() > best.len() {
        best = current;
    }
    if best.is_empty() { None } else { Some(best) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn entry(labels: &[(&str, &str)], data: &str) -> LogEntry {
        let mut m = BTreeMap::new();
        for (k, v) in labels {
            m.insert(k.to_string(), v.to_string());
        }
        LogEntry {
            labels: m,
            time_ns: 0,
            data: data.as_bytes().to_vec(),
        }
    }

    #[test]
    fn label_eq_populates_opts_labels() {
        let preds = vec![Predicate::LabelMatch {
            key: "app".to_string(),
            op: LabelOp::Eq,
            value: "a".to_string(),
        }];
        let opts = compile(&preds, ReadOptions::new(|_| {})).unwrap();
        assert_eq!(opts.labels.get("app").unwrap(), "a");
        assert!(opts.contains.is_empty());
    }

    #[test]
    fn line_contains_populates_hint_and_filter() {
        let preds = vec![Predicate::LineFilter {
            op: LineOp::Contains,
            value: "alpha".to_string(),
        }];
        let opts = compile(&preds, ReadOptions::new(|_| {})).unwrap();
        assert_eq!(opts.contains, vec!["alpha".to_string()]);
        let f = opts.filter_func.unwrap();
        assert!(f(&entry(&[], r#"{"msg":"alpha"}"#)));
        assert!(!f(&entry(&[], r#"{"msg":"beta"}"#)));
    }

    #[test]
    fn not_match_never_contributes_contains_hint() {
        let preds = vec![Predicate::LineFilter {
            op: LineOp::NotMatch,
            value: "alpha".to_string(),
        }];
        let opts = compile(&preds, ReadOptions::new(|_| {})).unwrap();
        assert!(opts.contains.is_empty());
    }

    #[test]
    fn data_filter_numeric_ge() {
        let preds = vec![Predicate::DataFilter {
            path: "count".to_string(),
            op: DataOp::Ge,
            value: "3".to_string(),
        }];
        let opts = compile(&preds, ReadOptions::new(|_| {})).unwrap();
        let f = opts.filter_func.unwrap();
        assert!(f(&entry(&[], r#"{"count":5}"#)));
        assert!(!f(&entry(&[], r#"{"count":1}"#)));
    }

    #[test]
    fn literal_hint_strips_optional_suffix() {
        assert_eq!(extract_literal_hint("colou?r"), Some("colo".to_string()));
        assert_eq!(extract_literal_hint("ab*cd"), Some("cd".to_string()));
        assert_eq!(extract_literal_hint(".*"), None);
        assert_eq!(extract_literal_hint("abc"), Some("abc".to_string()));
    }

    #[test]
    fn existing_filter_func_is_anded_last() {
        let mut opts = ReadOptions::new(|_| {});
        opts.filter_func = Some(Arc::new(|e: &LogEntry| e.time_ns > 100));
        let preds = vec![Predicate::LineFilter {
            op: LineOp::Contains,
            value: "x".to_string(),
        }];
        let opts = compile(&preds, opts).unwrap();
        let f = opts.filter_func.unwrap();
        let mut e = entry(&[], r#"{"x":1}"#);
        e.time_ns = 50;
        assert!(!f(&e));
        e.time_ns = 200;
        assert!(f(&e));
    }
}
