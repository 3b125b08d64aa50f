use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::OnceLock;

use super::search::EvidenceRecord;

/// Removes `<think>...</think>` blocks that reasoning models prepend to their answers.
pub fn strip_think_tags(text: &str) -> String {
    let mut cleaned = text.to_string();
    while let Some(start) = cleaned.find("<think>") {
        match cleaned[start..].find("</think>") {
            Some(end) => cleaned.replace_range(start..start + end + "</think>".len(), ""),
            None => {
                cleaned.truncate(start);
                break;
            }
        }
    }
    cleaned.trim().to_string()
}

/// Pulls the first JSON object out of a model reply, tolerating code fences and prose around it.
pub fn extract_json(text: &str) -> Option<Value> {
    let cleaned = strip_think_tags(text);
    if let Ok(value) = serde_json::from_str::<Value>(&cleaned) {
        return Some(value);
    }
    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&cleaned[start..=end]).ok()
}

/// Truncates on a char boundary, marking the cut.
pub fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((byte_idx, _)) => format!("{}... [truncated]", &text[..byte_idx]),
        None => text.to_string(),
    }
}

/// Keeps the first record seen for each URL, preserving order.
pub fn dedupe_by_url(evidence: &[EvidenceRecord]) -> Vec<EvidenceRecord> {
    let mut seen = HashSet::new();
    evidence
        .iter()
        .filter(|record| seen.insert(record.source_url().to_string()))
        .cloned()
        .collect()
}

/// Numbered evidence list handed to the writer; item `n` is cited as `[^n]`.
pub fn format_evidence(evidence: &[EvidenceRecord]) -> String {
    let mut formatted_text = String::from("EVIDENCE:\n\n");
    for (i, record) in evidence.iter().enumerate() {
        formatted_text.push_str(&format!("[{}] {}\n", i + 1, record.title()));
        formatted_text.push_str(&format!("URL: {}\n", record.source_url()));
        formatted_text.push_str(&format!("Provider: {}\n", record.provider()));
        match record.content() {
            Some(content) => formatted_text.push_str(&format!("Content: {}\n\n", content)),
            None => formatted_text.push_str("Content: (none)\n\n"),
        }
    }
    formatted_text.trim().to_string()
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)+$")
            .expect("email pattern compiles")
    })
}

pub fn is_valid_email(address: &str) -> bool {
    email_regex().is_match(address.trim())
}

const AFFIRMATIVE: [&str; 8] = ["yes", "y", "yeah", "yep", "sure", "ok", "okay", "please"];

/// True when the first word of the reply is a yes-like token, ignoring case and punctuation.
pub fn is_affirmative(reply: &str) -> bool {
    reply
        .split_whitespace()
        .next()
        .map(|word| {
            word.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .map(|word| AFFIRMATIVE.contains(&word.as_str()))
        .unwrap_or(false)
}

/// Split long messages at line boundaries to respect platform limits.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.lines() {
        let line_len = line.chars().count();
        if current_len + line_len + 1 > max_len {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            // Lines longer than the limit are cut on char boundaries.
            if line_len > max_len {
                let chars: Vec<char> = line.chars().collect();
                for piece in chars.chunks(max_len) {
                    chunks.push(piece.iter().collect());
                }
                continue;
            }
        }
        if !current.is_empty() {
            current.push('\n');
            current_len += 1;
        }
        current.push_str(line);
        current_len += line_len;
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::search::Provider;

    fn record(url: &str, content: Option<&str>) -> EvidenceRecord {
        EvidenceRecord::new(url, "Title", content.map(str::to_string), Provider::Serp).unwrap()
    }

    #[test]
    fn strips_reasoning_blocks() {
        assert_eq!(strip_think_tags("<think>hmm</think>Answer"), "Answer");
        assert_eq!(strip_think_tags("a<think>x</think>b<think>y</think>c"), "abc");
        assert_eq!(strip_think_tags("kept<think>never closed"), "kept");
    }

    #[test]
    fn extracts_json_from_fenced_reply() {
        let reply = "<think>plan</think>Sure!\n```json\n{\"questions\": [\"a?\"]}\n```";
        let value = extract_json(reply).unwrap();
        assert_eq!(value["questions"][0], "a?");
        assert!(extract_json("no json here").is_none());
    }

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé... [truncated]");
        assert_eq!(truncate_chars("short", 10), "short");
    }

    #[test]
    fn dedupes_keeping_first_occurrence() {
        let evidence = vec![
            record("https://a.example", Some("first")),
            record("https://b.example", None),
            record("https://a.example", Some("second")),
        ];
        let unique = dedupe_by_url(&evidence);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].content(), Some("first"));
    }

    #[test]
    fn formats_numbered_evidence() {
        let text = format_evidence(&[record("https://a.example", Some("body")), record("https://b.example", None)]);
        assert!(text.contains("[1] Title\nURL: https://a.example"));
        assert!(text.contains("[2] Title\nURL: https://b.example\nProvider: serp\nContent: (none)"));
    }

    #[test]
    fn validates_email_addresses() {
        assert!(is_valid_email("reader@example.com"));
        assert!(is_valid_email("  first.last+tag@mail.example.org "));
        assert!(!is_valid_email("reader@"));
        assert!(!is_valid_email("reader example.com"));
        assert!(!is_valid_email("reader@localhost"));
        assert!(!is_valid_email("two@@example.com"));
    }

    #[test]
    fn affirmative_replies() {
        assert!(is_affirmative("YES"));
        assert!(is_affirmative("yes please"));
        assert!(is_affirmative("Sure!"));
        assert!(!is_affirmative("no"));
        assert!(!is_affirmative("yesterday"));
        assert!(!is_affirmative(""));
    }

    #[test]
    fn split_message_short() {
        assert_eq!(split_message("Hello world", 100), vec!["Hello world"]);
    }

    #[test]
    fn split_message_multiline() {
        let chunks = split_message("Line 1\nLine 2\nLine 3\nLine 4", 15);
        assert_eq!(chunks, vec!["Line 1\nLine 2", "Line 3\nLine 4"]);
    }

    #[test]
    fn split_message_long_line() {
        let chunks = split_message(&"x".repeat(25), 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
    }
}
