//! Label matcher injection for PromQL and LogQL expressions
//!
//! The rewriter is a single-pass scanner rather than a full parser. It only
//! needs to find vector/stream selectors, so it tracks string literals,
//! comments, range brackets, grouping label lists, and function calls, and
//! copies everything else through untouched.
//!
//! Every selector gets the injected matcher appended after any caller-supplied
//! matcher on the same label is removed. In PromQL a bare metric name such as
//! `up` is a selector too and becomes `up{namespace="ns"}`.

use thiserror::Error;

/// Malformed query text
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    /// A string literal runs to the end of the query
    #[error("unterminated string literal at offset {0}")]
    UnterminatedString(usize),
    /// A `{`, `(` or `[` is never closed
    #[error("unclosed '{delim}' at offset {offset}")]
    Unclosed {
        /// Opening delimiter
        delim: char,
        /// Byte offset of the delimiter
        offset: usize,
    },
    /// A matcher inside braces is not `label op "value"`
    #[error("invalid label matcher '{0}'")]
    InvalidMatcher(String),
}

/// Query dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Prometheus: bare metric names and `{}` selectors
    PromQl,
    /// Loki: `{}` stream selectors only
    LogQl,
}

/// Render the matcher pinning `label` to `namespace`
///
/// A namespace containing `*` is a glob and becomes a regex matcher.
pub fn namespace_matcher(label: &str, namespace: &str) -> String {
    if namespace.contains('*') {
        format!("{}=~{}", label, quote(&glob_to_regex(namespace)))
    } else {
        format!("{}={}", label, quote(namespace))
    }
}

/// Translate a glob into an anchored-by-upstream regex body
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 4);
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '.' | '+' | '?' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

/// Double-quote `value` as a query string literal
fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Inject `matcher` (already rendered, e.g. `namespace="ns"`) into every
/// selector of `query`
pub fn inject(
    dialect: Dialect,
    query: &str,
    label: &str,
    matcher: &str,
) -> Result<String, SelectorError> {
    Scanner {
        src: query,
        pos: 0,
        out: String::with_capacity(query.len() + matcher.len() * 2),
        dialect,
        label,
        matcher,
    }
    .run()
}

/// Keywords that look like identifiers but are never metric names
const KEYWORDS: &[&str] = &[
    "and", "or", "unless", "atan2", "bool", "offset", "inf", "nan", "sum", "min", "max", "avg",
    "group", "stddev", "stdvar", "count", "count_values", "bottomk", "topk", "quantile",
    "limitk", "limit_ratio",
];

/// Keywords followed by an optional parenthesised label list
const GROUPING_KEYWORDS: &[&str] = &["by", "without", "on", "ignoring", "group_left", "group_right"];

struct Scanner<'a> {
    src: &'a str,
    pos: usize,
    out: String,
    dialect: Dialect,
    label: &'a str,
    matcher: &'a str,
}

impl Scanner<'_> {
    fn run(mut self) -> Result<String, SelectorError> {
        while let Some(c) = self.peek() {
            match c {
                '"' | '\'' | '`' => {
                    let end = string_end(self.src, self.pos)?;
                    self.copy_to(end);
                }
                '#' => {
                    let end = self.src[self.pos..]
                        .find('\n')
                        .map_or(self.src.len(), |i| self.pos + i);
                    self.copy_to(end);
                }
                '{' => self.selector()?,
                '[' if self.dialect == Dialect::PromQl => {
                    let end = closing(self.src, self.pos, '[', ']')?;
                    self.copy_to(end);
                }
                c if self.dialect == Dialect::PromQl && c.is_ascii_digit() => self.number(),
                '.' if self.dialect == Dialect::PromQl && self.next_is_digit() => self.number(),
                c if self.dialect == Dialect::PromQl && is_ident_start(c) => self.identifier()?,
                c => {
                    self.out.push(c);
                    self.pos += c.len_utf8();
                }
            }
        }
        Ok(self.out)
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn next_is_digit(&self) -> bool {
        self.src[self.pos + 1..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit())
    }

    fn copy_to(&mut self, end: usize) {
        self.out.push_str(&self.src[self.pos..end]);
        self.pos = end;
    }

    fn skip_whitespace(&mut self) {
        let rest = &self.src[self.pos..];
        let trimmed = rest.trim_start();
        self.copy_to(self.pos + rest.len() - trimmed.len());
    }

    /// Numbers and durations (`5m`, `1h30m`, `1e3`, `0x1f`)
    fn number(&mut self) {
        let len = self.src[self.pos..]
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '.' || c == '_'))
            .unwrap_or(self.src.len() - self.pos);
        self.copy_to(self.pos + len);
    }

    fn identifier(&mut self) -> Result<(), SelectorError> {
        let start = self.pos;
        let len = self.src[start..]
            .find(|c: char| !is_ident_char(c))
            .unwrap_or(self.src.len() - start);
        let ident = &self.src[start..start + len];
        self.copy_to(start + len);

        let lower = ident.to_ascii_lowercase();
        if GROUPING_KEYWORDS.contains(&lower.as_str()) {
            self.skip_whitespace();
            if self.peek() == Some('(') {
                let end = closing(self.src, self.pos, '(', ')')?;
                self.copy_to(end);
            }
            return Ok(());
        }
        if KEYWORDS.contains(&lower.as_str()) {
            return Ok(());
        }

        let rest = self.src[self.pos..].trim_start();
        match rest.chars().next() {
            // Function call
            Some('(') => Ok(()),
            // Selector with a metric name; braces handled by the main loop
            Some('{') => Ok(()),
            _ => {
                self.out.push('{');
                self.out.push_str(self.matcher);
                self.out.push('}');
                Ok(())
            }
        }
    }

    fn selector(&mut self) -> Result<(), SelectorError> {
        let open = self.pos;
        let close = closing(self.src, open, '{', '}')?;
        let body = &self.src[open + 1..close - 1];

        let mut matchers = Vec::new();
        for item in split_matchers(body, open + 1)? {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            match matcher_label(item)? {
                Some(name) if name == self.label => {}
                _ => matchers.push(item),
            }
        }

        self.out.push('{');
        for m in &matchers {
            self.out.push_str(m);
            self.out.push(',');
        }
        self.out.push_str(self.matcher);
        self.out.push('}');
        self.pos = close;
        Ok(())
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == ':'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == ':'
}

/// Byte offset just past the string literal starting at `start`
fn string_end(src: &str, start: usize) -> Result<usize, SelectorError> {
    let mut chars = src[start..].char_indices();
    let Some((_, quote)) = chars.next() else {
        return Err(SelectorError::UnterminatedString(start));
    };
    let mut escaped = false;
    for (i, c) in chars {
        if escaped {
            escaped = false;
        } else if c == '\\' && quote != '`' {
            escaped = true;
        } else if c == quote {
            return Ok(start + i + c.len_utf8());
        }
    }
    Err(SelectorError::UnterminatedString(start))
}

/// Byte offset just past the delimiter closing the one at `start`,
/// skipping string literals
fn closing(src: &str, start: usize, open: char, close: char) -> Result<usize, SelectorError> {
    let mut depth = 0usize;
    let mut i = start;
    while let Some(c) = src[i..].chars().next() {
        match c {
            '"' | '\'' | '`' => {
                i = string_end(src, i)?;
                continue;
            }
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i + c.len_utf8());
                }
            }
            _ => {}
        }
        i += c.len_utf8();
    }
    Err(SelectorError::Unclosed {
        delim: open,
        offset: start,
    })
}

/// Split brace contents on top-level commas
fn split_matchers(body: &str, base: usize) -> Result<Vec<&str>, SelectorError> {
    let mut items = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while let Some(c) = body[i..].chars().next() {
        match c {
            '"' | '\'' | '`' => {
                i = string_end(body, i).map_err(|_| SelectorError::UnterminatedString(base + i))?;
                continue;
            }
            ',' => {
                items.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += c.len_utf8();
    }
    items.push(&body[start..]);
    Ok(items)
}

/// Label name of one matcher, `None` for a lone quoted metric name
fn matcher_label(item: &str) -> Result<Option<String>, SelectorError> {
    let invalid = || SelectorError::InvalidMatcher(item.to_string());

    let (name, rest) = match item.chars().next() {
        Some('"') | Some('\'') | Some('`') => {
            let end = string_end(item, 0).map_err(|_| invalid())?;
            let name = unquote(&item[..end]);
            (name, item[end..].trim_start())
        }
        Some(c) if is_ident_start(c) => {
            let len = item.find(|c: char| !is_ident_char(c)).unwrap_or(item.len());
            (item[..len].to_string(), item[len..].trim_start())
        }
        _ => return Err(invalid()),
    };

    if rest.is_empty() && item.starts_with(['"', '\'', '`']) {
        return Ok(None);
    }

    let value = ["=~", "!~", "!=", "="]
        .iter()
        .find_map(|op| rest.strip_prefix(op))
        .ok_or_else(invalid)?
        .trim();

    match value.chars().next() {
        Some('"') | Some('\'') | Some('`') => {
            let end = string_end(value, 0).map_err(|_| invalid())?;
            if end != value.len() {
                return Err(invalid());
            }
        }
        _ => return Err(invalid()),
    }

    Ok(Some(name))
}

/// Strip quotes and resolve simple escapes
fn unquote(literal: &str) -> String {
    let inner = &literal[1..literal.len() - 1];
    if literal.starts_with('`') {
        return inner.to_string();
    }
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prom(query: &str) -> String {
        inject(Dialect::PromQl, query, "namespace", r#"namespace="team-a""#).unwrap()
    }

    fn loki(query: &str) -> String {
        inject(
            Dialect::LogQl,
            query,
            "kubernetes_namespace_name",
            r#"kubernetes_namespace_name="team-a""#,
        )
        .unwrap()
    }

    #[test]
    fn bare_metric_gets_selector() {
        assert_eq!(prom("up"), r#"up{namespace="team-a"}"#);
    }

    #[test]
    fn existing_selector_is_extended() {
        assert_eq!(
            prom(r#"up{job="api"}"#),
            r#"up{job="api",namespace="team-a"}"#
        );
        assert_eq!(prom("up{}"), r#"up{namespace="team-a"}"#);
        assert_eq!(prom(r#"{__name__="up"}"#), r#"{__name__="up",namespace="team-a"}"#);
    }

    #[test]
    fn caller_matcher_on_label_is_replaced() {
        assert_eq!(
            prom(r#"up{namespace="team-b", job="api"}"#),
            r#"up{job="api",namespace="team-a"}"#
        );
        assert_eq!(
            prom(r#"up{namespace=~".+"}"#),
            r#"up{namespace="team-a"}"#
        );
    }

    #[test]
    fn functions_ranges_and_aggregations() {
        assert_eq!(
            prom(r#"sum by (pod) (rate(http_requests_total{code="500"}[5m]))"#),
            r#"sum by (pod) (rate(http_requests_total{code="500",namespace="team-a"}[5m]))"#
        );
        assert_eq!(
            prom("histogram_quantile(0.9, rate(latency_bucket[1m:30s] offset 1h))"),
            r#"histogram_quantile(0.9, rate(latency_bucket{namespace="team-a"}[1m:30s] offset 1h))"#
        );
    }

    #[test]
    fn binary_expressions_inject_both_sides() {
        assert_eq!(
            prom("a / on(instance) group_left(node) b"),
            r#"a{namespace="team-a"} / on(instance) group_left(node) b{namespace="team-a"}"#
        );
        assert_eq!(
            prom("a > bool 1 or b"),
            r#"a{namespace="team-a"} > bool 1 or b{namespace="team-a"}"#
        );
    }

    #[test]
    fn strings_and_comments_are_untouched() {
        assert_eq!(
            prom(r#"label_replace(up, "dst", "$1", "src", "(.*)") # up"#),
            r#"label_replace(up{namespace="team-a"}, "dst", "$1", "src", "(.*)") # up"#
        );
        assert_eq!(prom("1 + 2.5e3"), "1 + 2.5e3");
    }

    #[test]
    fn quoted_metric_name_is_kept() {
        assert_eq!(
            prom(r#"{"http.requests", job="x"}"#),
            r#"{"http.requests",job="x",namespace="team-a"}"#
        );
    }

    #[test]
    fn malformed_queries_fail() {
        let inject_prom = |q| inject(Dialect::PromQl, q, "namespace", r#"namespace="a""#);
        assert!(matches!(
            inject_prom(r#"up{job="x""#),
            Err(SelectorError::Unclosed { delim: '{', .. })
        ));
        assert!(matches!(
            inject_prom(r#"up{job="x}"#),
            Err(SelectorError::UnterminatedString(_))
        ));
        assert!(matches!(
            inject_prom(r#"up{job}"#),
            Err(SelectorError::InvalidMatcher(_))
        ));
        assert!(matches!(
            inject_prom(r#"up{job="x" extra}"#),
            Err(SelectorError::InvalidMatcher(_))
        ));
    }

    #[test]
    fn logql_rewrites_stream_selectors_only() {
        assert_eq!(
            loki(r#"{app="api"} |= "error" | json | level="warn""#),
            r#"{app="api",kubernetes_namespace_name="team-a"} |= "error" | json | level="warn""#
        );
        assert_eq!(
            loki(r#"sum by (app) (count_over_time({app="api"}[5m]))"#),
            r#"sum by (app) (count_over_time({app="api",kubernetes_namespace_name="team-a"}[5m]))"#
        );
        assert_eq!(
            loki(r#"{app="x"} | line_format "{{.msg}}""#),
            r#"{app="x",kubernetes_namespace_name="team-a"} | line_format "{{.msg}}""#
        );
    }

    #[test]
    fn glob_namespace_becomes_regex() {
        assert_eq!(namespace_matcher("namespace", "team-a"), r#"namespace="team-a""#);
        assert_eq!(namespace_matcher("namespace", "team-*"), r#"namespace=~"team-.*""#);
        assert_eq!(namespace_matcher("namespace", "a.b*"), r#"namespace=~"a\\.b.*""#);
        assert_eq!(namespace_matcher("namespace", "*"), r#"namespace=~".*""#);
    }
}
