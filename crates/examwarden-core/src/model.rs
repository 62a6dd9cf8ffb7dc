//! Core data model types for examwarden.
//!
//! These are the types shared by the organizer, the timer, and the session
//! controller: sessions, sections, question records, groups, and answers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// Backend identifier of a question record.
pub type QuestionId = i64;

/// Backend identifier of an assessment session.
pub type SessionId = i64;

/// Identifier of a question set (the exam a session is an attempt at).
pub type SetId = i64;

/// The timed phases of an assessment, in the order they are taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionKind {
    Listening,
    Structure,
    Reading,
    Completed,
}

impl SectionKind {
    pub fn is_listening(self) -> bool {
        self == SectionKind::Listening
    }
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SectionKind::Listening => write!(f, "listening"),
            SectionKind::Structure => write!(f, "structure"),
            SectionKind::Reading => write!(f, "reading"),
            SectionKind::Completed => write!(f, "completed"),
        }
    }
}

impl FromStr for SectionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "listening" => Ok(SectionKind::Listening),
            "structure" => Ok(SectionKind::Structure),
            "reading" => Ok(SectionKind::Reading),
            "completed" => Ok(SectionKind::Completed),
            other => Err(format!("unknown section: {other}")),
        }
    }
}

/// Whether a session is still being taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
}

/// One attempt at the full multi-section assessment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub current_section: SectionKind,
    pub status: SessionStatus,
}

/// One of the four answer options of a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Choice {
    A,
    B,
    C,
    D,
}

impl Choice {
    /// Position of this option in a question's option list.
    pub fn index(self) -> usize {
        match self {
            Choice::A => 0,
            Choice::B => 1,
            Choice::C => 2,
            Choice::D => 3,
        }
    }
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self {
            Choice::A => "A",
            Choice::B => "B",
            Choice::C => "C",
            Choice::D => "D",
        };
        f.write_str(letter)
    }
}

impl FromStr for Choice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "A" => Ok(Choice::A),
            "B" => Ok(Choice::B),
            "C" => Ok(Choice::C),
            "D" => Ok(Choice::D),
            other => Err(format!("unknown choice: {other}")),
        }
    }
}

impl<'de> Deserialize<'de> for Choice {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Kind of media attached to a question or shared by a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Audio,
    Image,
}

/// A media attachment referenced by URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub url: String,
}

/// A flat question record as delivered by the backend.
///
/// Group parents are records without answer options whose `group_id` points at
/// themselves; their prompt and attachment are shared by the children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: QuestionId,
    /// Position within the section, unique per section.
    pub order_number: u32,
    #[serde(default, alias = "question_text")]
    pub prompt: String,
    #[serde(default)]
    pub option_a: Option<String>,
    #[serde(default)]
    pub option_b: Option<String>,
    #[serde(default)]
    pub option_c: Option<String>,
    #[serde(default)]
    pub option_d: Option<String>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    /// Parent group reference, if any.
    #[serde(default)]
    pub group_id: Option<QuestionId>,
}

impl Question {
    /// The four options in A..D order.
    pub fn options(&self) -> [Option<&str>; 4] {
        [
            self.option_a.as_deref(),
            self.option_b.as_deref(),
            self.option_c.as_deref(),
            self.option_d.as_deref(),
        ]
    }

    /// Text of a single option.
    pub fn option(&self, choice: Choice) -> Option<&str> {
        self.options()[choice.index()]
    }

    /// True when at least one option carries real (non-blank) text.
    pub fn has_options(&self) -> bool {
        self.options()
            .iter()
            .any(|o| o.is_some_and(|text| !text.trim().is_empty()))
    }

    /// A marker record that only carries the shared passage of a group.
    pub fn is_group_parent(&self) -> bool {
        self.group_id == Some(self.id) && !self.has_options()
    }

    /// Audio takes precedence over an image when both are present.
    pub fn attachment(&self) -> Option<Attachment> {
        let non_blank = |u: &Option<String>| u.as_ref().filter(|s| !s.trim().is_empty()).cloned();
        if let Some(url) = non_blank(&self.audio_url) {
            return Some(Attachment {
                kind: AttachmentKind::Audio,
                url,
            });
        }
        non_blank(&self.image_url).map(|url| Attachment {
            kind: AttachmentKind::Image,
            url,
        })
    }
}

/// Whether a navigable unit is a standalone question or a passage group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    Individual,
    Group,
}

/// A navigable unit: one standalone question, or a passage with its children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionGroup {
    /// Parent record id for groups, the question id for individual units.
    pub id: QuestionId,
    pub kind: GroupKind,
    /// Shared passage text (groups only).
    pub prompt: Option<String>,
    /// Shared attachment (groups only).
    pub attachment: Option<Attachment>,
    /// Questions ordered by `order_number`.
    pub questions: Vec<Question>,
    /// Order number of the first question.
    pub start_order: u32,
}

impl QuestionGroup {
    pub fn question_ids(&self) -> impl Iterator<Item = QuestionId> + '_ {
        self.questions.iter().map(|q| q.id)
    }

    pub fn contains(&self, question_id: QuestionId) -> bool {
        self.questions.iter().any(|q| q.id == question_id)
    }

    /// Questions of this group that have no answer in `answers`.
    pub fn unanswered<'a>(&'a self, answers: &'a AnswerSet) -> impl Iterator<Item = &'a Question> {
        self.questions.iter().filter(|q| !answers.is_answered(q.id))
    }

    pub fn missing_answers(&self, answers: &AnswerSet) -> usize {
        self.unanswered(answers).count()
    }

    /// Audio to play for this unit: the shared attachment for groups, the
    /// question's own attachment for individual units.
    pub fn audio_url(&self) -> Option<&str> {
        match self.kind {
            GroupKind::Group => self
                .attachment
                .as_ref()
                .filter(|a| a.kind == AttachmentKind::Audio)
                .map(|a| a.url.as_str()),
            GroupKind::Individual => self
                .questions
                .first()
                .and_then(|q| q.audio_url.as_deref())
                .filter(|u| !u.trim().is_empty()),
        }
    }
}

/// One timed phase of the assessment with its organized groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub kind: SectionKind,
    pub groups: Vec<QuestionGroup>,
    pub time_limit_secs: u64,
}

impl Section {
    pub fn question_count(&self) -> usize {
        self.groups.iter().map(|g| g.questions.len()).sum()
    }

    pub fn contains(&self, question_id: QuestionId) -> bool {
        self.groups.iter().any(|g| g.contains(question_id))
    }
}

/// A single selected answer, as carried in a submission batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerEntry {
    pub question_id: QuestionId,
    pub answer: Choice,
}

/// Selected answers keyed by question id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnswerSet {
    answers: BTreeMap<QuestionId, Choice>,
}

impl AnswerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or replace) the answer to a question.
    pub fn select(&mut self, question_id: QuestionId, choice: Choice) {
        self.answers.insert(question_id, choice);
    }

    pub fn get(&self, question_id: QuestionId) -> Option<Choice> {
        self.answers.get(&question_id).copied()
    }

    pub fn is_answered(&self, question_id: QuestionId) -> bool {
        self.answers.contains_key(&question_id)
    }

    pub fn len(&self) -> usize {
        self.answers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }

    pub fn clear(&mut self) {
        self.answers.clear();
    }

    /// The submission batch for a group, in question order. Unanswered
    /// questions are left out.
    pub fn batch_for(&self, group: &QuestionGroup) -> Vec<AnswerEntry> {
        group
            .questions
            .iter()
            .filter_map(|q| {
                self.get(q.id).map(|answer| AnswerEntry {
                    question_id: q.id,
                    answer,
                })
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (QuestionId, Choice)> + '_ {
        self.answers.iter().map(|(id, c)| (*id, *c))
    }
}

impl FromIterator<(QuestionId, Choice)> for AnswerSet {
    fn from_iter<I: IntoIterator<Item = (QuestionId, Choice)>>(iter: I) -> Self {
        Self {
            answers: iter.into_iter().collect(),
        }
    }
}

/// Bearer credential issued by the external auth collaborator.
///
/// Note: Custom Debug impl masks the token to prevent accidental exposure in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    token: String,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Value for the `Authorization` header.
    pub fn authorization(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("token", &"***").finish()
    }
}

/// Everything the controller needs to know about who is taking which exam.
#[derive(Debug, Clone)]
pub struct ExamContext {
    pub set_id: SetId,
    pub credentials: Credentials,
}

impl ExamContext {
    pub fn new(set_id: SetId, credentials: Credentials) -> Self {
        Self {
            set_id,
            credentials,
        }
    }
}
