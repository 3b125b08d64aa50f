//! Per-user conversation state and its transition function.
//!
//! `Session::apply` is pure with respect to the outside world: it mutates the
//! session and returns the effects the controller must perform. Results of
//! those effects come back in as events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use super::report::Report;
use super::search::EvidenceRecord;
use super::utils::{is_affirmative, is_valid_email};

pub const QUESTION_COUNT: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        UserId(id.to_string())
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        UserId(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    WaitingQuery,
    Clarifying,
    Asking,
    Refining,
    Planning,
    Searching,
    Writing,
    EmailDecision,
    EmailAddress,
    Sending,
    Done,
}

impl State {
    /// States in which an external call is in flight.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            State::Clarifying
                | State::Refining
                | State::Planning
                | State::Searching
                | State::Writing
                | State::Sending
        )
    }
}

/// A delegated pipeline step, used to describe failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Clarify,
    Refine,
    Plan,
    Search,
    Write,
    Email,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Clarify => "preparing follow-up questions",
            Stage::Refine => "refining your question",
            Stage::Plan => "planning the searches",
            Stage::Search => "searching the web",
            Stage::Write => "writing the report",
            Stage::Email => "sending the email",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    Inbound(String),
    Clarified(Vec<String>),
    Refined(String),
    Planned(Vec<String>),
    EvidenceGathered(Vec<EvidenceRecord>),
    ReportWritten(Report),
    EmailSent,
    EmailFailed(String),
    StageFailed { stage: Stage, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Reply(String),
    Typing,
    Clarify { query: String },
    Refine { query: String, answers: Vec<(String, String)> },
    Plan { refined_query: String },
    Search { queries: Vec<String> },
    Write { refined_query: String, evidence: Vec<EvidenceRecord> },
    SendEmail { to: String, subject: String, report: Report },
}

pub const GREETING: &str =
    "👋 Hi! I'm a research assistant. Send me any research question and I'll investigate.";
pub const CANCELLED: &str = "Conversation cancelled. Send /start to begin anew.";
pub const STILL_WORKING: &str = "I'm still working on your request. I'll message you as soon as it's ready.";
pub const EMPTY_QUERY: &str = "Please send me the question you'd like me to research.";
pub const WORKING_ON_REPORT: &str = "I have all the information I need. I'm working on your report now.";
pub const NO_EVIDENCE: &str =
    "⚠️ No evidence found: neither search provider returned any sources for this question, so the report below has no citations.";
pub const ASK_EMAIL: &str = "Do you want to email the report to yourself? (yes/no)";
pub const ASK_ADDRESS: &str = "Great! Please provide the email address.";
pub const DECLINED_EMAIL: &str = "No problem. Send me another question whenever you like.";
pub const BAD_ADDRESS: &str = "That doesn't look like an e-mail address. Try again.";
pub const EMAIL_SENT: &str = "Sent! ✅";
pub const EXPIRED: &str = "Your previous conversation timed out, so I've started a new one.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user: UserId,
    pub state: State,
    pub original_query: Option<String>,
    pub clarifying_questions: Vec<String>,
    pub answers: Vec<String>,
    pub refined_query: Option<String>,
    pub search_plan: Vec<String>,
    pub evidence: Vec<EvidenceRecord>,
    pub report: Option<Report>,
    pub email_address: Option<String>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl Session {
    pub fn new(user: UserId, now: SystemTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            user,
            state: State::WaitingQuery,
            original_query: None,
            clarifying_questions: Vec::new(),
            answers: Vec::new(),
            refined_query: None,
            search_plan: Vec::new(),
            evidence: Vec::new(),
            report: None,
            email_address: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Discards all conversation data; the new id invalidates in-flight results.
    pub fn reset(&mut self, now: SystemTime) {
        *self = Session::new(self.user.clone(), now);
    }

    pub fn is_idle(&self, now: SystemTime, timeout: Duration) -> bool {
        now.duration_since(self.updated_at)
            .map(|idle| idle > timeout)
            .unwrap_or(false)
    }

    /// Question/answer pairs collected so far, in order.
    pub fn answered_questions(&self) -> Vec<(String, String)> {
        self.clarifying_questions
            .iter()
            .cloned()
            .zip(self.answers.iter().cloned())
            .collect()
    }

    pub fn apply(&mut self, event: Event, now: SystemTime) -> Vec<Effect> {
        self.updated_at = now;
        match event {
            Event::Inbound(text) => self.on_inbound(text.trim(), now),
            Event::Clarified(questions) if self.state == State::Clarifying => {
                self.clarifying_questions = questions;
                self.answers.clear();
                self.state = State::Asking;
                match self.clarifying_questions.first() {
                    Some(first) => vec![Effect::Reply(first.clone())],
                    None => self.fail(Stage::Clarify, "no questions were produced", now),
                }
            }
            Event::Refined(refined) if self.state == State::Refining => {
                self.refined_query = Some(refined.clone());
                self.state = State::Planning;
                vec![Effect::Plan { refined_query: refined }]
            }
            Event::Planned(plan) if self.state == State::Planning => {
                self.search_plan = plan.clone();
                self.state = State::Searching;
                vec![Effect::Search { queries: plan }]
            }
            Event::EvidenceGathered(evidence) if self.state == State::Searching => {
                self.evidence = evidence.clone();
                self.state = State::Writing;
                vec![Effect::Write {
                    refined_query: self.refined_query.clone().unwrap_or_default(),
                    evidence,
                }]
            }
            Event::ReportWritten(report) if self.state == State::Writing => {
                let mut effects = Vec::new();
                if self.evidence.is_empty() {
                    effects.push(Effect::Reply(NO_EVIDENCE.to_string()));
                }
                effects.push(Effect::Reply(report.render()));
                effects.push(Effect::Reply(ASK_EMAIL.to_string()));
                self.report = Some(report);
                self.state = State::EmailDecision;
                effects
            }
            Event::EmailSent if self.state == State::Sending => {
                self.state = State::Done;
                vec![Effect::Reply(EMAIL_SENT.to_string())]
            }
            Event::EmailFailed(reason) if self.state == State::Sending => {
                self.state = State::Done;
                vec![Effect::Reply(format!(
                    "Sorry, I couldn't send the email ({}). The report is above in this chat.",
                    reason
                ))]
            }
            Event::StageFailed { stage, reason } if self.state.is_busy() => self.fail(stage, &reason, now),
            other => {
                tracing::debug!(state = ?self.state, event = ?other, "ignoring event for current state");
                Vec::new()
            }
        }
    }

    fn fail(&mut self, stage: Stage, reason: &str, now: SystemTime) -> Vec<Effect> {
        tracing::error!(user = %self.user, session = %self.id, %stage, reason, "stage failed, resetting session");
        self.reset(now);
        vec![Effect::Reply(format!(
            "Sorry, something went wrong while {}. Please send your question again.",
            stage
        ))]
    }

    fn on_inbound(&mut self, text: &str, now: SystemTime) -> Vec<Effect> {
        match text {
            "/start" => {
                self.reset(now);
                return vec![Effect::Reply(GREETING.to_string())];
            }
            "/cancel" => {
                self.reset(now);
                return vec![Effect::Reply(CANCELLED.to_string())];
            }
            _ => {}
        }

        match self.state {
            State::Done => {
                self.reset(now);
                self.on_query(text)
            }
            State::WaitingQuery => self.on_query(text),
            state if state.is_busy() => vec![Effect::Reply(STILL_WORKING.to_string())],
            State::Asking => self.on_answer(text),
            State::EmailDecision => {
                if is_affirmative(text) {
                    self.state = State::EmailAddress;
                    vec![Effect::Reply(ASK_ADDRESS.to_string())]
                } else {
                    self.state = State::Done;
                    vec![Effect::Reply(DECLINED_EMAIL.to_string())]
                }
            }
            State::EmailAddress => self.on_address(text, now),
            _ => Vec::new(),
        }
    }

    fn on_query(&mut self, text: &str) -> Vec<Effect> {
        if text.is_empty() {
            return vec![Effect::Reply(EMPTY_QUERY.to_string())];
        }
        self.original_query = Some(text.to_string());
        self.state = State::Clarifying;
        vec![Effect::Typing, Effect::Clarify { query: text.to_string() }]
    }

    fn on_answer(&mut self, text: &str) -> Vec<Effect> {
        self.answers.push(text.to_string());
        if let Some(next) = self.clarifying_questions.get(self.answers.len()) {
            return vec![Effect::Reply(next.clone())];
        }
        self.state = State::Refining;
        vec![
            Effect::Reply(WORKING_ON_REPORT.to_string()),
            Effect::Typing,
            Effect::Refine {
                query: self.original_query.clone().unwrap_or_default(),
                answers: self.answered_questions(),
            },
        ]
    }

    fn on_address(&mut self, text: &str, now: SystemTime) -> Vec<Effect> {
        if !is_valid_email(text) {
            return vec![Effect::Reply(BAD_ADDRESS.to_string())];
        }
        let Some(report) = self.report.clone() else {
            return self.fail(Stage::Email, "no report to send", now);
        };
        let to = text.to_string();
        self.email_address = Some(to.clone());
        self.state = State::Sending;
        let subject = format!(
            "Research report: {}",
            self.original_query.as_deref().unwrap_or("your question")
        );
        vec![Effect::Typing, Effect::SendEmail { to, subject, report }]
    }
}
