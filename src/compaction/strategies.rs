//! The individual text-reduction strategies used by `compact_prompt`.
//!
//! Every strategy leaves fenced code untouched except `summarize_code_blocks`,
//! and every strategy returns its input unchanged when it has nothing to remove.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Code blocks with a body longer than this are summarized.
pub const CODE_BLOCK_SUMMARY_THRESHOLD: usize = 500;

/// Below this size sentence pruning is a no-op.
const PRUNE_FLOOR_CHARS: usize = 200;

/// Prompts with this many prose sentences or fewer are never pruned.
const PRUNE_MIN_SENTENCES: usize = 3;

/// Sentences shorter than this (after normalization) are never deduplicated.
const DEDUPE_MIN_CHARS: usize = 6;

static SIGNATURE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:#\[|@\w|(?:(?:pub(?:\([^)]*\))?|export|default|async|static|public|private|protected|unsafe|abstract)\s+)*(?:fn|def|class|struct|enum|trait|impl|interface|function|type|mod|module|import|use|from|package|const)\b)",
    )
    .unwrap()
});

static FILLER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:please note that|it is important to note that|it should be noted that|it is worth noting that|as mentioned (?:earlier|before|above|previously)|as you know|needless to say|i would like you to|i want you to|could you please|can you please|feel free to|in other words|at the end of the day|for what it's worth|basically|essentially|actually|kindly|please)\b,?\s*",
    )
    .unwrap()
});

static IN_ORDER_TO_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bin order to\b").unwrap());

static ACTION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:create|implement|add|fix|write|update|remove|delete|return|rename|refactor|build|generate|handle|ensure|use|call|test|validate|parse|must|should|never|always|required|need|avoid|do not|don't)\b|实现|添加|修复|创建|删除|必须|需要|返回",
    )
    .unwrap()
});

fn is_fence(line: &str) -> bool {
    line.trim_start().starts_with("```")
}

/// Split one line into sentences, keeping terminators.
pub(crate) fn split_sentences(line: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = line.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let end = i + c.len_utf8();
        let boundary = match c {
            '。' | '！' | '？' => true,
            '.' | '!' | '?' => chars.peek().is_none_or(|&(_, next)| next.is_whitespace()),
            _ => false,
        };
        if boundary {
            let sentence = line[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = end;
        }
    }
    let rest = line[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}

fn sentence_key(sentence: &str) -> String {
    sentence
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn shorter_or_original(original: &str, candidate: String) -> String {
    if candidate.chars().count() < original.chars().count() {
        candidate
    } else {
        original.to_string()
    }
}

/// Collapse runs of spaces in prose, strip trailing whitespace and squeeze blank lines.
pub fn normalize_whitespace(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut in_code = false;
    let mut blank_run = 0;

    for line in text.lines() {
        if is_fence(line) {
            in_code = !in_code;
            blank_run = 0;
            out.push(line.trim().to_string());
            continue;
        }
        if in_code {
            out.push(line.trim_end().to_string());
            continue;
        }
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push(collapsed);
    }

    while out.first().is_some_and(|l| l.is_empty()) {
        out.remove(0);
    }
    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }
    shorter_or_original(text, out.join("\n"))
}

/// Drop sentences (and whole lines) that repeat earlier prose.
pub fn dedupe_sentences(text: &str) -> String {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out: Vec<String> = Vec::new();
    let mut in_code = false;

    for line in text.lines() {
        if is_fence(line) {
            in_code = !in_code;
            out.push(line.to_string());
            continue;
        }
        if in_code || line.trim().is_empty() {
            out.push(line.to_string());
            continue;
        }

        let sentences = split_sentences(line);
        let kept: Vec<&str> = sentences
            .iter()
            .copied()
            .filter(|s| {
                let key = sentence_key(s);
                key.chars().count() < DEDUPE_MIN_CHARS || seen.insert(key)
            })
            .collect();

        if kept.len() == sentences.len() {
            out.push(line.to_string());
        } else if !kept.is_empty() {
            out.push(kept.join(" "));
        }
    }
    shorter_or_original(text, out.join("\n"))
}

/// Replace long fenced code bodies with their signature lines and an elision marker.
pub fn summarize_code_blocks(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mut out: Vec<String> = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if !is_fence(lines[i]) {
            out.push(lines[i].to_string());
            i += 1;
            continue;
        }

        let open = i;
        let close = (open + 1..lines.len()).find(|&j| is_fence(lines[j]));
        let Some(close) = close else {
            // Unterminated fence: leave the remainder alone.
            out.extend(lines[open..].iter().map(|l| l.to_string()));
            break;
        };

        let body = &lines[open + 1..close];
        out.push(lines[open].to_string());
        if body.join("\n").chars().count() > CODE_BLOCK_SUMMARY_THRESHOLD {
            out.extend(summarize_body(body));
        } else {
            out.extend(body.iter().map(|l| l.to_string()));
        }
        out.push(lines[close].to_string());
        i = close + 1;
    }

    shorter_or_original(text, out.join("\n"))
}

fn summarize_body(body: &[&str]) -> Vec<String> {
    let keep = |idx: usize, line: &str| {
        idx == 0 || idx + 1 == body.len() || SIGNATURE_REGEX.is_match(line)
    };

    let mut out = Vec::new();
    let mut elided: Vec<&str> = Vec::new();
    for (idx, &line) in body.iter().enumerate() {
        if keep(idx, line) {
            flush_elided(&mut elided, &mut out);
            out.push(line.to_string());
        } else {
            elided.push(line);
        }
    }
    flush_elided(&mut elided, &mut out);
    out
}

fn flush_elided(elided: &mut Vec<&str>, out: &mut Vec<String>) {
    match elided.len() {
        0 => {}
        1 => out.push(elided[0].to_string()),
        n => {
            let indent: String = elided[0].chars().take_while(|c| c.is_whitespace()).collect();
            out.push(format!("{}... ({} lines elided)", indent, n));
        }
    }
    elided.clear();
}

/// Remove common verbose phrasing from prose lines.
pub fn remove_filler(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut in_code = false;

    for line in text.lines() {
        if is_fence(line) {
            in_code = !in_code;
            out.push(line.to_string());
            continue;
        }
        if in_code || line.trim().is_empty() {
            out.push(line.to_string());
            continue;
        }

        let stripped = FILLER_REGEX.replace_all(line, "");
        let stripped = IN_ORDER_TO_REGEX.replace_all(&stripped, "to");
        if stripped.len() == line.len() {
            out.push(line.to_string());
            continue;
        }
        let indent: String = line.chars().take_while(|c| c.is_whitespace()).collect();
        let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
        if !collapsed.is_empty() {
            out.push(format!("{}{}", indent, capitalize_first(&collapsed)));
        }
    }
    shorter_or_original(text, out.join("\n"))
}

fn capitalize_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn score_sentence(sentence: &str, position: usize) -> f64 {
    let actions = ACTION_REGEX.find_iter(sentence).count().min(3) as f64;
    let mut score = actions * 3.0;
    if sentence.contains('`')
        || sentence.contains('/')
        || sentence.contains("::")
        || sentence.contains("()")
        || sentence.chars().any(|c| c.is_ascii_digit())
    {
        score += 2.0;
    }
    if position == 0 {
        score += 2.0;
    }
    let words = sentence.split_whitespace().count() as f64;
    score - words / 40.0
}

/// Keep the highest-scoring `keep_fraction` of prose sentences, in original order.
///
/// Headings, blank lines and fenced code are never pruned.
pub fn prune_sentences(text: &str, keep_fraction: f64) -> String {
    if text.chars().count() < PRUNE_FLOOR_CHARS {
        return text.to_string();
    }

    enum Line<'a> {
        Fixed(&'a str),
        Prose(Vec<&'a str>),
    }

    let mut lines: Vec<Line> = Vec::new();
    let mut in_code = false;
    for line in text.lines() {
        if is_fence(line) {
            in_code = !in_code;
            lines.push(Line::Fixed(line));
        } else if in_code || line.trim().is_empty() || line.trim_start().starts_with('#') {
            lines.push(Line::Fixed(line));
        } else {
            lines.push(Line::Prose(split_sentences(line)));
        }
    }

    let mut scored: Vec<(usize, f64)> = lines
        .iter()
        .filter_map(|l| match l {
            Line::Prose(sentences) => Some(sentences.iter()),
            Line::Fixed(_) => None,
        })
        .flatten()
        .enumerate()
        .map(|(pos, s)| (pos, score_sentence(s, pos)))
        .collect();

    let total = scored.len();
    if total <= PRUNE_MIN_SENTENCES {
        return text.to_string();
    }
    let keep_n = ((total as f64 * keep_fraction.clamp(0.0, 1.0)).ceil() as usize)
        .max(PRUNE_MIN_SENTENCES)
        .min(total);
    if keep_n == total {
        return text.to_string();
    }

    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    let kept: HashSet<usize> = scored.iter().take(keep_n).map(|(pos, _)| *pos).collect();

    let mut out: Vec<String> = Vec::new();
    let mut pos = 0;
    for line in &lines {
        match line {
            Line::Fixed(l) => out.push(l.to_string()),
            Line::Prose(sentences) => {
                let mut survivors = Vec::new();
                for s in sentences {
                    if kept.contains(&pos) {
                        survivors.push(*s);
                    }
                    pos += 1;
                }
                if !survivors.is_empty() {
                    out.push(survivors.join(" "));
                }
            }
        }
    }
    shorter_or_original(text, out.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_sentences() {
        assert_eq!(
            split_sentences("First one. Second! Third? tail"),
            vec!["First one.", "Second!", "Third?", "tail"]
        );
        assert_eq!(split_sentences("Call foo.bar() now."), vec!["Call foo.bar() now."]);
        assert_eq!(split_sentences("第一句。第二句。"), vec!["第一句。", "第二句。"]);
    }

    #[test]
    fn test_normalize_whitespace_preserves_code_indentation() {
        let text = "Some   text   here\n\n\n\nmore\n```\n    indented   code   \n```\n";
        let result = normalize_whitespace(text);
        assert_eq!(result, "Some text here\n\nmore\n```\n    indented   code\n```");
    }

    #[test]
    fn test_normalize_whitespace_noop_on_clean_text() {
        let text = "already clean\nlines";
        assert_eq!(normalize_whitespace(text), text);
    }

    #[test]
    fn test_dedupe_sentences() {
        let text = "Return JSON only. Be concise.\nReturn JSON only.\nOk. Ok.";
        let result = dedupe_sentences(text);
        assert_eq!(result, "Return JSON only. Be concise.\nOk. Ok.");
    }

    #[test]
    fn test_dedupe_ignores_code() {
        let text = "```\nlet a = 1;\nlet a = 1;\n```";
        assert_eq!(dedupe_sentences(text), text);
    }

    #[test]
    fn test_summarize_long_code_block_keeps_signatures() {
        let mut body = String::from("pub fn compute(x: u32) -> u32 {\n");
        for i in 0..30 {
            body.push_str(&format!("    let v{} = x * {};\n", i, i));
        }
        body.push_str("}\n\nfn helper() {\n    todo();\n}");
        let text = format!("Intro\n```rust\n{}\n```\nOutro", body);

        let result = summarize_code_blocks(&text);
        assert!(result.len() < text.len());
        assert!(result.contains("pub fn compute(x: u32) -> u32 {"));
        assert!(result.contains("fn helper() {"));
        assert!(result.contains("lines elided"));
        assert!(result.starts_with("Intro\n```rust"));
        assert!(result.ends_with("```\nOutro"));
    }

    #[test]
    fn test_summarize_short_code_block_untouched() {
        let text = "```\nfn a() {}\n```";
        assert_eq!(summarize_code_blocks(text), text);
    }

    #[test]
    fn test_remove_filler() {
        let text = "Please note that the API is stable.\nIn order to win, basically just try.";
        let result = remove_filler(text);
        assert_eq!(result, "The API is stable.\nTo win, just try.");
    }

    #[test]
    fn test_remove_filler_leaves_code() {
        let text = "```\n// please note that\n```";
        assert_eq!(remove_filler(text), text);
    }

    #[test]
    fn test_prune_keeps_action_sentences() {
        let text = "Implement the `parse` function in src/parser.rs. \
                    The weather was lovely during the design meeting. \
                    Many people have opinions about parsers and their history. \
                    Return an error for empty input. \
                    Our team enjoys long lunches on Fridays and Mondays. \
                    Add unit tests for every branch.";
        let result = prune_sentences(text, 0.5);
        assert!(result.contains("Implement the `parse` function"));
        assert!(result.contains("Return an error for empty input."));
        assert!(result.contains("Add unit tests"));
        assert!(!result.contains("lunches"));
    }

    #[test]
    fn test_prune_floor() {
        let short = "Do this. Then that. Then stop. Finally rest.";
        assert_eq!(prune_sentences(short, 0.1), short);
    }

    #[test]
    fn test_prune_keeps_headings_and_code() {
        let mut text = String::from("# Heading\n");
        for i in 0..10 {
            text.push_str(&format!("Filler sentence number {} about nothing much at all. ", i));
        }
        text.push_str("\n```\ncode line that stays\n```");
        let result = prune_sentences(&text, 0.3);
        assert!(result.starts_with("# Heading"));
        assert!(result.contains("code line that stays"));
        assert!(result.len() < text.len());
    }
}
