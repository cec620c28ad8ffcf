//! Structural completeness checks for generated source text.
//!
//! The scanner is language-agnostic: it understands the common string and
//! comment syntaxes closely enough to count brackets reliably, then applies
//! the checks in a fixed order so the reported reason is deterministic.

use crate::errors::ErrorCode;
use serde::{Deserialize, Serialize};

pub const REASON_EMPTY: &str = "Empty content";
pub const REASON_UNTERMINATED_STRING: &str = "Unterminated string literal";
pub const REASON_UNTERMINATED_COMMENT: &str = "Unterminated block comment";
pub const REASON_TRAILING_OPENER: &str = "Trailing block opener without body";
pub const REASON_UNCLOSED_BRACKET: &str = "Unclosed bracket";
pub const REASON_UNEXPECTED_CLOSER: &str = "Unexpected closing bracket";
pub const REASON_TRUNCATED_RETURN: &str = "Truncated return statement";
pub const REASON_TRUNCATED_COLLECTION: &str = "Truncated collection literal";
pub const REASON_TRUNCATED_EXPRESSION: &str = "Truncated expression";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incompleteness {
    pub is_incomplete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Incompleteness {
    pub fn complete() -> Self {
        Self {
            is_incomplete: false,
            reason: None,
        }
    }

    pub fn incomplete(reason: &str) -> Self {
        Self {
            is_incomplete: true,
            reason: Some(reason.to_string()),
        }
    }

    /// Failure code for a failed check. A stray closer cannot be the result of
    /// truncation, so it is reported as invalid syntax.
    pub fn code(&self) -> Option<ErrorCode> {
        if !self.is_incomplete {
            return None;
        }
        match self.reason.as_deref() {
            Some(REASON_UNEXPECTED_CLOSER) => Some(ErrorCode::SyntaxInvalid),
            _ => Some(ErrorCode::IncompleteCode),
        }
    }
}

const PYTHON_BLOCK_KEYWORDS: &[&str] = &[
    "def ", "class ", "if ", "elif ", "else", "for ", "while ", "try", "except", "finally",
    "with ", "async def ", "match ", "case ",
];

/// Check `code` for signs of truncated or malformed output.
pub fn detect_incomplete(code: &str) -> Incompleteness {
    if code.trim().is_empty() {
        return Incompleteness::incomplete(REASON_EMPTY);
    }

    let scan = Scanner::new(code).run();
    if scan.open_string {
        return Incompleteness::incomplete(REASON_UNTERMINATED_STRING);
    }
    if scan.open_comment {
        return Incompleteness::incomplete(REASON_UNTERMINATED_COMMENT);
    }

    let last_line = scan.last_code_line.trim_end();
    let trimmed = last_line.trim_start();
    if ends_with_opener(trimmed) {
        return Incompleteness::incomplete(REASON_TRAILING_OPENER);
    }

    if scan.unexpected_closer {
        return Incompleteness::incomplete(REASON_UNEXPECTED_CLOSER);
    }
    if scan.depth > 0 {
        return Incompleteness::incomplete(REASON_UNCLOSED_BRACKET);
    }

    if let Some(reason) = truncated_statement(trimmed) {
        return Incompleteness::incomplete(reason);
    }

    Incompleteness::complete()
}

fn ends_with_opener(line: &str) -> bool {
    if line.ends_with('{') || line.ends_with('(') || line.ends_with('[') {
        return true;
    }
    line.ends_with(':') && PYTHON_BLOCK_KEYWORDS.iter().any(|k| line.starts_with(k))
}

fn truncated_statement(line: &str) -> Option<&'static str> {
    if is_markup_line(line) {
        return None;
    }
    const OPERATORS: &[&str] = &["&&", "||", "=>", "->", "=", "+", "-", "*", "/", "|", "&"];
    let ends_with_operator = OPERATORS.iter().any(|op| line.ends_with(op))
        && !line.ends_with("*/")
        && !line.ends_with("//");

    let is_return = line.starts_with("return ");
    if is_return && (ends_with_operator || line.ends_with(',')) {
        return Some(REASON_TRUNCATED_RETURN);
    }
    if line.ends_with(',') {
        return Some(REASON_TRUNCATED_COLLECTION);
    }
    if ends_with_operator {
        return Some(REASON_TRUNCATED_EXPRESSION);
    }
    None
}

/// Table rows, horizontal rules and `key: value` lines end in punctuation
/// without continuing onto the next line.
fn is_markup_line(line: &str) -> bool {
    let table_row = line.len() > 1 && line.starts_with('|') && line.ends_with('|');
    let rule = line
        .chars()
        .all(|c| matches!(c, '-' | '=' | '*' | '_' | '~' | '+' | '|' | ':' | ' '));
    table_row || rule || is_key_value(line)
}

fn is_key_value(line: &str) -> bool {
    let entry = line.strip_prefix("- ").unwrap_or(line);
    let Some((key, value)) = entry.split_once(": ") else {
        return false;
    };
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !value.contains('=')
}

#[derive(Debug, Default)]
struct ScanResult {
    open_string: bool,
    open_comment: bool,
    unexpected_closer: bool,
    depth: usize,
    /// Last line with code outside comments, comments stripped.
    last_code_line: String,
}

struct Scanner {
    chars: Vec<char>,
}

impl Scanner {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
        }
    }

    fn at(&self, i: usize) -> Option<char> {
        self.chars.get(i).copied()
    }

    fn starts_with(&self, i: usize, pat: &str) -> bool {
        pat.chars().enumerate().all(|(k, c)| self.at(i + k) == Some(c))
    }

    fn run(self) -> ScanResult {
        let mut result = ScanResult::default();
        let mut stack: Vec<char> = Vec::new();
        let mut line = String::new();
        let mut i = 0;
        let n = self.chars.len();

        let commit_line = |line: &mut String, result: &mut ScanResult| {
            if !line.trim().is_empty() {
                result.last_code_line = std::mem::take(line);
            } else {
                line.clear();
            }
        };

        while i < n {
            let c = self.chars[i];
            let prev = if i > 0 { self.at(i - 1) } else { None };

            // Comments
            if self.starts_with(i, "//") {
                while i < n && self.chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            if self.starts_with(i, "/*") {
                match (i + 2..n.saturating_sub(1)).find(|&j| self.starts_with(j, "*/")) {
                    Some(end) => {
                        i = end + 2;
                        continue;
                    }
                    None => {
                        result.open_comment = true;
                        break;
                    }
                }
            }
            let hash_comment = c == '#'
                && self.at(i + 1).is_none_or(|next| next == ' ' || next == '\n' || next == '!')
                && !self.starts_with(i, "#![");
            if hash_comment {
                while i < n && self.chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }

            // Strings
            if let Some(end) = self.string_end(i, prev) {
                match end {
                    Some(end) => {
                        line.extend(&self.chars[i..end]);
                        i = end;
                        continue;
                    }
                    None => {
                        result.open_string = true;
                        break;
                    }
                }
            }

            match c {
                '\n' => {
                    commit_line(&mut line, &mut result);
                    i += 1;
                    continue;
                }
                '(' | '[' | '{' => stack.push(c),
                ')' | ']' | '}' => {
                    let expected = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    if stack.pop() != Some(expected) {
                        result.unexpected_closer = true;
                    }
                }
                _ => {}
            }
            line.push(c);
            i += 1;
        }
        commit_line(&mut line, &mut result);
        result.depth = stack.len();
        result
    }

    /// If a string literal starts at `i`, where it ends (exclusive).
    ///
    /// Returns `None` when `i` does not start a string, `Some(None)` when the
    /// string never terminates.
    fn string_end(&self, i: usize, prev: Option<char>) -> Option<Option<usize>> {
        let c = self.chars[i];
        let prev_is_ident = prev.is_some_and(|p| p.is_alphanumeric() || p == '_');

        // Python triple-quoted strings
        for triple in ["\"\"\"", "'''"] {
            if self.starts_with(i, triple) {
                let end = (i + 3..self.chars.len()).find(|&j| self.starts_with(j, triple));
                return Some(end.map(|e| e + 3));
            }
        }

        // Rust raw strings: r"..", r#".."#
        if c == 'r' && !prev_is_ident {
            let hashes = self.chars[i + 1..].iter().take_while(|&&h| h == '#').count();
            if self.at(i + 1 + hashes) == Some('"') {
                let closer: String = std::iter::once('"')
                    .chain(std::iter::repeat_n('#', hashes))
                    .collect();
                let start = i + 2 + hashes;
                let end = (start..self.chars.len()).find(|&j| self.starts_with(j, &closer));
                return Some(end.map(|e| e + closer.chars().count()));
            }
            return None;
        }

        match c {
            '"' | '`' => Some(self.scan_quoted(i, c, true)),
            '\'' => {
                if prev_is_ident && !self.follows_string_prefix(i) {
                    // Apostrophe inside a word.
                    return None;
                }
                if self.is_lifetime(i, prev) {
                    return None;
                }
                Some(self.scan_quoted(i, '\'', false))
            }
            _ => None,
        }
    }

    fn scan_quoted(&self, start: usize, quote: char, multiline: bool) -> Option<usize> {
        let mut j = start + 1;
        while j < self.chars.len() {
            match self.chars[j] {
                '\\' => j += 2,
                '\n' if !multiline => return None,
                ch if ch == quote => return Some(j + 1),
                _ => j += 1,
            }
        }
        None
    }

    /// Python/Rust literal prefixes such as `f'..'`, `b'x'` or `rb'..'`.
    fn follows_string_prefix(&self, i: usize) -> bool {
        let run: String = self.chars[..i]
            .iter()
            .rev()
            .take_while(|c| c.is_alphanumeric() || **c == '_')
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        matches!(
            run.to_lowercase().as_str(),
            "f" | "b" | "u" | "r" | "rb" | "br" | "fr" | "rf"
        )
    }

    fn is_lifetime(&self, i: usize, prev: Option<char>) -> bool {
        let ident_len = self.chars[i + 1..]
            .iter()
            .take_while(|c| c.is_alphanumeric() || **c == '_')
            .count();
        if ident_len == 0 {
            return false;
        }
        let first = self.chars[i + 1];
        if !(first.is_alphabetic() || first == '_') {
            return false;
        }
        let after = self.at(i + 1 + ident_len);
        if after == Some('\'') {
            // 'a' is a char literal.
            return false;
        }
        if matches!(prev, Some('&') | Some('<') | Some(',')) {
            return true;
        }
        matches!(
            after,
            Some('>') | Some(',') | Some(':') | Some('+') | Some(';') | Some(')')
        )
    }
}
