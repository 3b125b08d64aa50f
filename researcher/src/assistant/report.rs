use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use super::search::EvidenceRecord;
use super::utils::strip_think_tags;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub number: usize,
    pub url: String,
}

/// A written report whose inline `[^n]` markers all resolve to a reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    body: String,
    references: Vec<Reference>,
}

fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\^(\d+)\]").expect("marker pattern compiles"))
}

fn reference_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:[-*]\s*)?\[\^(\d+)\]\s*(?::|->|-)?\s*(?:\[[^\]]*\]\()?<?(https?://[^\s>)]+)")
            .expect("reference pattern compiles")
    })
}

fn is_references_heading(line: &str) -> bool {
    let heading = line
        .trim()
        .trim_start_matches('#')
        .trim_matches(|c: char| c == '*' || c == '_' || c == ':' || c.is_whitespace());
    heading.eq_ignore_ascii_case("references") || heading.eq_ignore_ascii_case("sources")
}

impl Report {
    /// Builds a report from raw writer output.
    ///
    /// Markers missing from the writer's References list are resolved against
    /// the numbered evidence the writer was given; markers that resolve to
    /// nothing are removed from the body.
    pub fn reconcile(raw: &str, evidence: &[EvidenceRecord]) -> Self {
        let text = strip_think_tags(raw);
        let lines: Vec<&str> = text.lines().collect();
        let heading_at = lines.iter().rposition(|line| is_references_heading(line));

        let (body_lines, reference_lines) = match heading_at {
            Some(idx) => (&lines[..idx], &lines[idx + 1..]),
            None => (&lines[..], &lines[lines.len()..]),
        };

        let mut listed: BTreeMap<usize, String> = BTreeMap::new();
        for line in reference_lines {
            if let Some(caps) = reference_line_regex().captures(line) {
                if let Ok(number) = caps[1].parse::<usize>() {
                    listed.entry(number).or_insert_with(|| caps[2].to_string());
                }
            }
        }

        // Stray definitions inside the body are dropped; they are re-rendered below.
        let body = body_lines
            .iter()
            .filter(|line| {
                let def = reference_line_regex().captures(line);
                match def {
                    Some(caps) => {
                        if let Ok(number) = caps[1].parse::<usize>() {
                            listed.entry(number).or_insert_with(|| caps[2].to_string());
                        }
                        false
                    }
                    None => true,
                }
            })
            .copied()
            .collect::<Vec<_>>()
            .join("\n");

        let cited: BTreeSet<usize> = marker_regex()
            .captures_iter(&body)
            .filter_map(|caps| caps[1].parse().ok())
            .collect();

        let mut references = Vec::new();
        let mut dangling = BTreeSet::new();
        for number in cited {
            let url = listed.get(&number).cloned().or_else(|| {
                number
                    .checked_sub(1)
                    .and_then(|idx| evidence.get(idx))
                    .map(|record| record.source_url().to_string())
            });
            match url {
                Some(url) => references.push(Reference { number, url }),
                None => {
                    dangling.insert(number);
                }
            }
        }

        let body = if dangling.is_empty() {
            body
        } else {
            tracing::debug!(?dangling, "removing citations with no source");
            marker_regex()
                .replace_all(&body, |caps: &regex::Captures| {
                    let keep = caps[1]
                        .parse::<usize>()
                        .map(|n| !dangling.contains(&n))
                        .unwrap_or(false);
                    if keep {
                        caps[0].to_string()
                    } else {
                        String::new()
                    }
                })
                .into_owned()
        };

        Self {
            body: body.trim().to_string(),
            references,
        }
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn references(&self) -> &[Reference] {
        &self.references
    }

    /// Numbers of every marker in the body, in order of first appearance.
    pub fn cited_numbers(&self) -> Vec<usize> {
        let mut seen = BTreeSet::new();
        marker_regex()
            .captures_iter(&self.body)
            .filter_map(|caps| caps[1].parse().ok())
            .filter(|n| seen.insert(*n))
            .collect()
    }

    pub fn word_count(&self) -> usize {
        self.body.split_whitespace().count()
    }

    /// Markdown body followed by the References section.
    pub fn render(&self) -> String {
        if self.references.is_empty() {
            return self.body.clone();
        }
        let mut text = format!("{}\n\n## References\n", self.body);
        for reference in &self.references {
            text.push_str(&format!("[^{}]: {}\n", reference.number, reference.url));
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::search::Provider;

    fn evidence(n: usize) -> Vec<EvidenceRecord> {
        (1..=n)
            .filter_map(|i| {
                EvidenceRecord::new(format!("https://src.example/{}", i), "t", None, Provider::Tavily)
            })
            .collect()
    }

    fn assert_no_dangling(report: &Report) {
        for number in report.cited_numbers() {
            assert!(
                report.references().iter().any(|r| r.number == number),
                "marker [^{}] has no reference",
                number
            );
        }
    }

    #[test]
    fn keeps_writer_references() {
        let raw = "Reefs are stressed [^1]. Fibres accumulate [^2].\n\n## References\n[^1]: https://a.example\n[^2]: https://b.example";
        let report = Report::reconcile(raw, &evidence(2));
        assert_eq!(report.body(), "Reefs are stressed [^1]. Fibres accumulate [^2].");
        assert_eq!(
            report.references(),
            &[
                Reference { number: 1, url: "https://a.example".into() },
                Reference { number: 2, url: "https://b.example".into() },
            ]
        );
        assert_no_dangling(&report);
    }

    #[test]
    fn fills_missing_references_from_evidence() {
        let raw = "Claim [^1] and claim [^3].\n\n**References:**\n- [^1] -> https://a.example";
        let report = Report::reconcile(raw, &evidence(3));
        assert_eq!(report.references()[1], Reference { number: 3, url: "https://src.example/3".into() });
        assert_no_dangling(&report);
    }

    #[test]
    fn removes_markers_without_any_source() {
        let raw = "Supported [^1]. Invented [^9].";
        let report = Report::reconcile(raw, &evidence(1));
        assert_eq!(report.body(), "Supported [^1]. Invented .");
        assert_eq!(report.cited_numbers(), vec![1]);
        assert_no_dangling(&report);
    }

    #[test]
    fn uncited_references_are_dropped_and_render_lists_cited_ones() {
        let raw = "Only one [^2].\n\nReferences\n[^1]: https://a.example\n[^2]: <https://b.example>";
        let report = Report::reconcile(raw, &[]);
        assert_eq!(report.render(), "Only one [^2].\n\n## References\n[^2]: https://b.example\n");
    }

    #[test]
    fn report_without_citations_renders_body_only() {
        let report = Report::reconcile("<think>x</think>No sources were found.", &[]);
        assert!(report.references().is_empty());
        assert_eq!(report.render(), "No sources were found.");
        assert_eq!(report.word_count(), 4);
    }
}
