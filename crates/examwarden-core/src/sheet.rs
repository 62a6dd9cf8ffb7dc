//! TOML answer sheet parser.
//!
//! An answer sheet scripts a headless run: which question set to take and
//! which option to pick for each question.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::model::{AnswerSet, Choice, QuestionId, SetId};

#[derive(Debug, Deserialize)]
struct TomlSheetFile {
    sheet: TomlSheetHeader,
    #[serde(default)]
    answers: Vec<TomlAnswer>,
}

#[derive(Debug, Deserialize)]
struct TomlSheetHeader {
    set_id: SetId,
    #[serde(default)]
    name: String,
    #[serde(default)]
    fallback: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TomlAnswer {
    question_id: QuestionId,
    choice: String,
}

/// One `[[answers]]` row as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetEntry {
    pub question_id: QuestionId,
    /// `None` when the written choice is not one of A-D.
    pub choice: Option<Choice>,
    pub raw: String,
}

/// A parsed answer sheet.
#[derive(Debug, Clone)]
pub struct AnswerSheet {
    pub set_id: SetId,
    pub name: String,
    /// Choice used for questions the sheet does not list.
    pub fallback: Option<Choice>,
    pub entries: Vec<SheetEntry>,
}

impl AnswerSheet {
    /// The answers to select, later rows overriding earlier ones. Rows with
    /// an unknown choice are skipped.
    pub fn answers(&self) -> AnswerSet {
        self.entries
            .iter()
            .filter_map(|e| e.choice.map(|c| (e.question_id, c)))
            .collect()
    }

    /// The choice for `question_id`, or the fallback.
    pub fn choice_for(&self, question_id: QuestionId) -> Option<Choice> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.question_id == question_id)
            .and_then(|e| e.choice)
            .or(self.fallback)
    }
}

/// Parse an answer sheet file.
pub fn parse_answer_sheet(path: &Path) -> Result<AnswerSheet> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read answer sheet: {}", path.display()))?;

    parse_answer_sheet_str(&content, path)
}

/// Parse answer sheet TOML from a string.
pub fn parse_answer_sheet_str(content: &str, source_path: &Path) -> Result<AnswerSheet> {
    let parsed: TomlSheetFile = toml::from_str(content)
        .with_context(|| format!("failed to parse TOML: {}", source_path.display()))?;

    let fallback = parsed
        .sheet
        .fallback
        .map(|f| f.parse::<Choice>().map_err(|e| anyhow::anyhow!("invalid fallback: {e}")))
        .transpose()?;

    let entries = parsed
        .answers
        .into_iter()
        .map(|a| SheetEntry {
            question_id: a.question_id,
            choice: a.choice.parse().ok(),
            raw: a.choice,
        })
        .collect();

    Ok(AnswerSheet {
        set_id: parsed.sheet.set_id,
        name: parsed.sheet.name,
        fallback,
        entries,
    })
}

/// A warning from answer sheet validation.
#[derive(Debug, Clone)]
pub struct SheetWarning {
    pub question_id: Option<QuestionId>,
    pub message: String,
}

/// Check an answer sheet for common mistakes.
pub fn validate_answer_sheet(sheet: &AnswerSheet) -> Vec<SheetWarning> {
    let mut warnings = Vec::new();

    if sheet.entries.is_empty() && sheet.fallback.is_none() {
        warnings.push(SheetWarning {
            question_id: None,
            message: "sheet has no answers and no fallback".into(),
        });
    }

    let mut seen = HashSet::new();
    for entry in &sheet.entries {
        if !seen.insert(entry.question_id) {
            warnings.push(SheetWarning {
                question_id: Some(entry.question_id),
                message: format!("duplicate answer for question {}, last one wins", entry.question_id),
            });
        }
        if entry.choice.is_none() {
            warnings.push(SheetWarning {
                question_id: Some(entry.question_id),
                message: format!("unknown choice '{}', expected A-D", entry.raw),
            });
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const SHEET: &str = r#"
[sheet]
set_id = 3
name = "Practice test 3"

[[answers]]
question_id = 101
choice = "a"

[[answers]]
question_id = 102
choice = "D"
"#;

    #[test]
    fn parse_valid_sheet() {
        let sheet = parse_answer_sheet_str(SHEET, &PathBuf::from("sheet.toml")).unwrap();
        assert_eq!(sheet.set_id, 3);
        assert_eq!(sheet.name, "Practice test 3");
        assert_eq!(sheet.entries.len(), 2);
        assert_eq!(sheet.choice_for(101), Some(Choice::A));
        assert_eq!(sheet.choice_for(999), None);
        assert!(validate_answer_sheet(&sheet).is_empty());
    }

    #[test]
    fn fallback_covers_unlisted_questions() {
        let toml = r#"
[sheet]
set_id = 1
fallback = "b"
"#;
        let sheet = parse_answer_sheet_str(toml, &PathBuf::from("s.toml")).unwrap();
        assert_eq!(sheet.choice_for(7), Some(Choice::B));
        assert!(validate_answer_sheet(&sheet).is_empty());
    }

    #[test]
    fn invalid_fallback_is_an_error() {
        let toml = "[sheet]\nset_id = 1\nfallback = \"Z\"\n";
        assert!(parse_answer_sheet_str(toml, &PathBuf::from("s.toml")).is_err());
    }

    #[test]
    fn duplicates_and_unknown_choices_warn() {
        let toml = r#"
[sheet]
set_id = 1

[[answers]]
question_id = 5
choice = "A"

[[answers]]
question_id = 5
choice = "C"

[[answers]]
question_id = 6
choice = "E"
"#;
        let sheet = parse_answer_sheet_str(toml, &PathBuf::from("s.toml")).unwrap();
        let warnings = validate_answer_sheet(&sheet);
        assert!(warnings.iter().any(|w| w.message.contains("duplicate")));
        assert!(warnings.iter().any(|w| w.message.contains("unknown choice 'E'")));

        let answers = sheet.answers();
        assert_eq!(answers.get(5), Some(Choice::C));
        assert_eq!(answers.get(6), None);
    }

    #[test]
    fn empty_sheet_warns() {
        let sheet = parse_answer_sheet_str("[sheet]\nset_id = 1\n", &PathBuf::from("s.toml")).unwrap();
        let warnings = validate_answer_sheet(&sheet);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].question_id.is_none());
    }

    #[test]
    fn parse_malformed_toml() {
        assert!(parse_answer_sheet_str("not [valid", &PathBuf::from("bad.toml")).is_err());
    }

    #[test]
    fn parse_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("answers.toml");
        std::fs::write(&path, SHEET).unwrap();
        let sheet = parse_answer_sheet(&path).unwrap();
        assert_eq!(sheet.answers().len(), 2);
    }
}
