use anyhow::{anyhow, Result};
use serde_json::Value;
use std::sync::Arc;

use super::llm::Generators;
use super::prompts::{
    format_planner_instructions, format_refine_input, CLARIFY_INSTRUCTIONS, NO_EVIDENCE_INSTRUCTIONS,
    REFINE_INSTRUCTIONS, WRITER_INSTRUCTIONS,
};
use super::report::Report;
use super::search::{EvidenceFetcher, EvidenceRecord};
use super::state::QUESTION_COUNT;
use super::utils::{dedupe_by_url, extract_json, format_evidence, strip_think_tags};

const FALLBACK_QUESTIONS: [&str; QUESTION_COUNT] = [
    "Which aspect of this topic matters most to you?",
    "Is there a particular region or time period I should focus on?",
    "What will you use this research for?",
];

/// The delegated research stages, run one at a time by the conversation controller.
pub struct ResearchGraph {
    generators: Generators,
    fetcher: Arc<EvidenceFetcher>,
    max_searches: usize,
}

impl ResearchGraph {
    pub fn new(generators: Generators, fetcher: Arc<EvidenceFetcher>, max_searches: usize) -> Self {
        Self {
            generators,
            fetcher,
            max_searches: max_searches.max(1),
        }
    }

    /// Always yields exactly three questions.
    pub async fn clarify(&self, query: &str) -> Result<Vec<String>> {
        let response = self.generators.fast.generate(CLARIFY_INSTRUCTIONS, query).await?;
        let mut questions = parse_questions(&response);
        if questions.len() < QUESTION_COUNT {
            tracing::warn!(
                produced = questions.len(),
                "model returned too few questions, padding with generic ones"
            );
            for fallback in FALLBACK_QUESTIONS {
                if questions.len() == QUESTION_COUNT {
                    break;
                }
                if !questions.iter().any(|q| q == fallback) {
                    questions.push(fallback.to_string());
                }
            }
        }
        questions.truncate(QUESTION_COUNT);
        Ok(questions)
    }

    pub async fn refine(&self, query: &str, answers: &[(String, String)]) -> Result<String> {
        let input = format_refine_input(query, answers);
        let response = self.generators.fast.generate(REFINE_INSTRUCTIONS, &input).await?;
        let refined = strip_think_tags(&response);
        let refined = refined.trim().trim_matches('"').trim();
        if refined.is_empty() {
            return Err(anyhow!("model returned an empty refined query"));
        }
        tracing::info!(refined_query = refined, "query refined");
        Ok(refined.to_string())
    }

    pub async fn plan(&self, refined_query: &str) -> Result<Vec<String>> {
        let instructions = format_planner_instructions(self.max_searches);
        let response = self.generators.fast.generate(&instructions, refined_query).await?;

        let mut searches = parse_plan(&response);
        searches.truncate(self.max_searches);
        if searches.is_empty() {
            tracing::warn!("could not parse a search plan, searching for the refined query itself");
            searches.push(refined_query.to_string());
        }
        tracing::info!(?searches, "search plan ready");
        Ok(searches)
    }

    pub async fn search(&self, queries: &[String]) -> Vec<EvidenceRecord> {
        self.fetcher.fetch(queries).await
    }

    /// Writes the report from deduplicated, numbered evidence.
    pub async fn write(&self, refined_query: &str, evidence: &[EvidenceRecord]) -> Result<Report> {
        let evidence = dedupe_by_url(evidence);
        let (instructions, context) = if evidence.is_empty() {
            (NO_EVIDENCE_INSTRUCTIONS, format!("Query: {}", refined_query))
        } else {
            (
                WRITER_INSTRUCTIONS,
                format!("Query: {}\n\n{}", refined_query, format_evidence(&evidence)),
            )
        };

        let response = self.generators.writer.generate(instructions, &context).await?;
        let report = Report::reconcile(&response, &evidence);
        if report.body().is_empty() {
            return Err(anyhow!("model returned an empty report"));
        }
        tracing::info!(
            words = report.word_count(),
            citations = report.references().len(),
            sources = evidence.len(),
            "report written"
        );
        Ok(report)
    }
}

fn strip_list_marker(line: &str) -> &str {
    let line = line.trim();
    let without_number = line.trim_start_matches(|c: char| c.is_ascii_digit());
    let without_number = if without_number.len() != line.len() {
        without_number.trim_start_matches(['.', ')', ':'])
    } else {
        line
    };
    without_number
        .trim_start()
        .trim_start_matches(['-', '•'])
        .trim()
        .trim_matches('*')
        .trim()
}

fn parse_questions(response: &str) -> Vec<String> {
    if let Some(json) = extract_json(response) {
        let questions: Vec<String> = json["questions"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|q| q.trim().to_string())
                    .filter(|q| !q.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if !questions.is_empty() {
            return questions;
        }
    }

    strip_think_tags(response)
        .lines()
        .map(strip_list_marker)
        .filter(|line| line.ends_with('?'))
        .map(str::to_string)
        .collect()
}

fn parse_plan(response: &str) -> Vec<String> {
    let Some(json) = extract_json(response) else {
        return Vec::new();
    };
    let mut queries: Vec<String> = Vec::new();
    for item in json["searches"].as_array().into_iter().flatten() {
        let query = match item {
            Value::String(query) => query.trim().to_string(),
            other => other["query"].as_str().unwrap_or_default().trim().to_string(),
        };
        if !query.is_empty() && !queries.contains(&query) {
            if let Some(reason) = item["reason"].as_str() {
                tracing::debug!(query = %query, reason, "planned search");
            }
            queries.push(query);
        }
    }
    queries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::error::LlmError;
    use crate::assistant::llm::Generator;
    use crate::assistant::search::Provider;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Returns a canned reply and remembers what it was asked.
    struct Canned {
        reply: String,
        seen: Mutex<Vec<(String, String)>>,
    }

    impl Canned {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Generator for Canned {
        async fn generate(&self, instructions: &str, context: &str) -> Result<String, LlmError> {
            self.seen
                .lock()
                .unwrap()
                .push((instructions.to_string(), context.to_string()));
            Ok(self.reply.clone())
        }
    }

    fn graph(generator: Arc<Canned>) -> ResearchGraph {
        let generators = Generators {
            fast: generator.clone(),
            writer: generator,
        };
        ResearchGraph::new(generators, Arc::new(EvidenceFetcher::new(Vec::new(), 100)), 3)
    }

    #[tokio::test]
    async fn clarify_parses_json_questions() {
        let g = graph(Canned::new(r#"{"questions": ["A?", "B?", "C?", "D?"]}"#));
        assert_eq!(g.clarify("reefs").await.unwrap(), vec!["A?", "B?", "C?"]);
    }

    #[tokio::test]
    async fn clarify_falls_back_to_question_lines_and_pads() {
        let g = graph(Canned::new(
            "Here are some questions:\n1. Which reefs interest you?\n2) **Which pollutants?**\nThanks",
        ));
        let questions = g.clarify("reefs").await.unwrap();
        assert_eq!(questions.len(), QUESTION_COUNT);
        assert_eq!(questions[0], "Which reefs interest you?");
        assert_eq!(questions[1], "Which pollutants?");
        assert_eq!(questions[2], FALLBACK_QUESTIONS[0]);
    }

    #[tokio::test]
    async fn refine_strips_reasoning_and_quotes() {
        let generator = Canned::new("<think>combine</think>\"microplastic effects on Pacific coral\"");
        let g = graph(generator.clone());
        let answers = vec![("Where?".to_string(), "Pacific".to_string())];
        let refined = g.refine("microplastics and coral", &answers).await.unwrap();
        assert_eq!(refined, "microplastic effects on Pacific coral");
        let seen = generator.seen.lock().unwrap();
        assert!(seen[0].1.contains("Where? -> Pacific"));
    }

    #[tokio::test]
    async fn refine_rejects_empty_output() {
        let g = graph(Canned::new("<think>...</think>"));
        assert!(g.refine("q", &[]).await.is_err());
    }

    #[tokio::test]
    async fn plan_reads_searches_and_bounds_count() {
        let g = graph(Canned::new(
            r#"```json
{"searches": [
  {"reason": "r1", "query": "coral bleaching microplastics"},
  {"reason": "r2", "query": "microplastic ingestion corals"},
  {"reason": "dup", "query": "microplastic ingestion corals"},
  {"reason": "r3", "query": "reef pollution 2024"},
  {"reason": "r4", "query": "extra"}
]}
```"#,
        ));
        assert_eq!(
            g.plan("refined").await.unwrap(),
            vec![
                "coral bleaching microplastics",
                "microplastic ingestion corals",
                "reef pollution 2024"
            ]
        );
    }

    #[tokio::test]
    async fn unparseable_plan_searches_refined_query() {
        let g = graph(Canned::new("I would search for things."));
        assert_eq!(g.plan("refined query").await.unwrap(), vec!["refined query"]);
    }

    #[tokio::test]
    async fn write_numbers_unique_evidence_and_reconciles() {
        let generator = Canned::new("Corals ingest plastic [^1]. Reefs suffer [^2].");
        let g = graph(generator.clone());
        let evidence: Vec<EvidenceRecord> = ["https://a.example", "https://b.example", "https://a.example"]
            .iter()
            .filter_map(|url| EvidenceRecord::new(*url, "t", Some("c".into()), Provider::Tavily))
            .collect();

        let report = g.write("refined", &evidence).await.unwrap();
        assert_eq!(report.references().len(), 2);
        assert_eq!(report.references()[1].url, "https://b.example");

        let seen = generator.seen.lock().unwrap();
        assert_eq!(seen[0].0, WRITER_INSTRUCTIONS);
        assert!(seen[0].1.contains("[2] t\nURL: https://b.example"));
        assert!(!seen[0].1.contains("[3]"));
    }

    #[tokio::test]
    async fn write_with_no_evidence_uses_no_evidence_instructions() {
        let generator = Canned::new("No sources were found for this question.");
        let g = graph(generator.clone());
        let report = g.write("refined", &[]).await.unwrap();
        assert!(report.references().is_empty());
        assert_eq!(generator.seen.lock().unwrap()[0].0, NO_EVIDENCE_INSTRUCTIONS);
    }
}
