//! Question organizer.
//!
//! Turns the flat question records of a section into the ordered list of
//! navigable units the controller walks through: standalone questions and
//! passage groups (a parent marker plus its answerable children).

use std::collections::{BTreeMap, HashSet};

use crate::model::{GroupKind, Question, QuestionGroup, QuestionId};

/// Result of organizing a section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Organized {
    /// Units ordered by their starting order number.
    pub groups: Vec<QuestionGroup>,
    /// Questions whose declared parent does not exist. They are emitted as
    /// individual units and listed here so callers can surface them.
    pub orphans: Vec<QuestionId>,
}

/// Organize flat question records into navigable units.
///
/// Ties on the starting order number are broken by unit id.
pub fn organize(records: &[Question]) -> Organized {
    let parents: BTreeMap<QuestionId, &Question> = records
        .iter()
        .filter(|q| q.is_group_parent())
        .map(|q| (q.id, q))
        .collect();

    let mut children: BTreeMap<QuestionId, Vec<Question>> = BTreeMap::new();
    let mut units = Vec::new();
    let mut orphans = Vec::new();

    for record in records {
        if record.is_group_parent() {
            continue;
        }
        if !record.has_options() {
            tracing::debug!(question_id = record.id, "skipping record without answer options");
            continue;
        }

        match record.group_id {
            Some(parent_id) if parent_id != record.id => {
                if parents.contains_key(&parent_id) {
                    children.entry(parent_id).or_default().push(record.clone());
                } else {
                    tracing::warn!(
                        question_id = record.id,
                        group_id = parent_id,
                        "question references a missing group parent, keeping it as an individual unit"
                    );
                    orphans.push(record.id);
                    units.push(individual(record));
                }
            }
            _ => units.push(individual(record)),
        }
    }

    for (parent_id, parent) in parents {
        let Some(mut members) = children.remove(&parent_id) else {
            tracing::debug!(group_id = parent_id, "dropping group parent without answerable children");
            continue;
        };
        members.sort_by_key(|q| (q.order_number, q.id));
        let start_order = members[0].order_number;
        let prompt = Some(parent.prompt.trim())
            .filter(|p| !p.is_empty())
            .map(str::to_string);

        units.push(QuestionGroup {
            id: parent_id,
            kind: GroupKind::Group,
            prompt,
            attachment: parent.attachment(),
            questions: members,
            start_order,
        });
    }

    units.sort_by_key(|g| (g.start_order, g.id));

    Organized {
        groups: units,
        orphans,
    }
}

fn individual(record: &Question) -> QuestionGroup {
    QuestionGroup {
        id: record.id,
        kind: GroupKind::Individual,
        prompt: None,
        attachment: None,
        questions: vec![record.clone()],
        start_order: record.order_number,
    }
}

/// A warning about organized output that still allows the section to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrganizerWarning {
    /// The unit the warning is about.
    pub group_id: QuestionId,
    pub message: String,
}

/// Check ordering invariants: contiguous order numbers inside each group and
/// unique order numbers across the section.
pub fn validate_groups(groups: &[QuestionGroup]) -> Vec<OrganizerWarning> {
    let mut warnings = Vec::new();

    for group in groups.iter().filter(|g| g.kind == GroupKind::Group) {
        for pair in group.questions.windows(2) {
            if pair[1].order_number != pair[0].order_number + 1 {
                warnings.push(OrganizerWarning {
                    group_id: group.id,
                    message: format!(
                        "order numbers {} and {} are not contiguous",
                        pair[0].order_number, pair[1].order_number
                    ),
                });
            }
        }
    }

    let mut seen = HashSet::new();
    for group in groups {
        for q in &group.questions {
            if !seen.insert(q.order_number) {
                warnings.push(OrganizerWarning {
                    group_id: group.id,
                    message: format!("duplicate order number {}", q.order_number),
                });
            }
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AttachmentKind;

    fn answerable(id: QuestionId, order: u32, group_id: Option<QuestionId>) -> Question {
        Question {
            id,
            order_number: order,
            prompt: format!("question {id}"),
            option_a: Some("a".into()),
            option_b: Some("b".into()),
            option_c: Some("c".into()),
            option_d: Some("d".into()),
            audio_url: None,
            image_url: None,
            group_id,
        }
    }

    fn parent(id: QuestionId, order: u32) -> Question {
        Question {
            id,
            order_number: order,
            prompt: "Read the passage".into(),
            option_a: None,
            option_b: None,
            option_c: None,
            option_d: None,
            audio_url: Some("passage.mp3".into()),
            image_url: None,
            group_id: Some(id),
        }
    }

    #[test]
    fn parent_with_children_becomes_one_ordered_group() {
        let records = vec![
            answerable(3, 4, Some(100)),
            parent(100, 0),
            answerable(1, 2, Some(100)),
            answerable(2, 3, Some(100)),
        ];
        let organized = organize(&records);

        assert_eq!(organized.groups.len(), 1);
        let group = &organized.groups[0];
        assert_eq!(group.kind, GroupKind::Group);
        assert_eq!(group.id, 100);
        assert_eq!(group.start_order, 2);
        let orders: Vec<u32> = group.questions.iter().map(|q| q.order_number).collect();
        assert_eq!(orders, vec![2, 3, 4]);
        assert_eq!(group.prompt.as_deref(), Some("Read the passage"));
        assert_eq!(group.attachment.as_ref().unwrap().kind, AttachmentKind::Audio);
        assert_eq!(group.audio_url(), Some("passage.mp3"));
    }

    #[test]
    fn parent_without_children_is_dropped() {
        let records = vec![parent(100, 1), answerable(1, 2, None)];
        let organized = organize(&records);
        assert_eq!(organized.groups.len(), 1);
        assert_eq!(organized.groups[0].kind, GroupKind::Individual);
        assert_eq!(organized.groups[0].id, 1);
    }

    #[test]
    fn children_without_options_do_not_count() {
        let mut blank = answerable(1, 2, Some(100));
        blank.option_a = None;
        blank.option_b = None;
        blank.option_c = None;
        blank.option_d = Some(String::new());
        let organized = organize(&[parent(100, 1), blank]);
        assert!(organized.groups.is_empty());
    }

    #[test]
    fn mixed_units_sorted_by_first_order_number() {
        let records = vec![
            answerable(50, 9, None),
            parent(100, 3),
            answerable(10, 4, Some(100)),
            answerable(11, 5, Some(100)),
            answerable(51, 1, None),
        ];
        let organized = organize(&records);
        let starts: Vec<u32> = organized.groups.iter().map(|g| g.start_order).collect();
        assert_eq!(starts, vec![1, 4, 9]);
        assert_eq!(organized.groups[1].questions.len(), 2);
    }

    #[test]
    fn orphan_child_is_not_merged_and_is_flagged() {
        let records = vec![
            parent(100, 1),
            answerable(1, 2, Some(100)),
            answerable(2, 3, Some(999)),
        ];
        let organized = organize(&records);
        assert_eq!(organized.orphans, vec![2]);
        assert_eq!(organized.groups.len(), 2);
        assert_eq!(organized.groups[0].questions.len(), 1);
        assert_eq!(organized.groups[1].kind, GroupKind::Individual);
        assert_eq!(organized.groups[1].id, 2);
    }

    #[test]
    fn order_ties_break_on_unit_id() {
        let records = vec![answerable(9, 1, None), answerable(4, 1, None)];
        let organized = organize(&records);
        let ids: Vec<QuestionId> = organized.groups.iter().map(|g| g.id).collect();
        assert_eq!(ids, vec![4, 9]);
        let warnings = validate_groups(&organized.groups);
        assert!(warnings.iter().any(|w| w.message.contains("duplicate order number 1")));
    }

    #[test]
    fn gaps_inside_group_are_reported() {
        let records = vec![
            parent(100, 1),
            answerable(1, 2, Some(100)),
            answerable(2, 5, Some(100)),
        ];
        let organized = organize(&records);
        let warnings = validate_groups(&organized.groups);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].group_id, 100);
        assert!(warnings[0].message.contains("not contiguous"));
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert_eq!(organize(&[]), Organized::default());
    }
}
