//! Chooses which discovered questionnaires a run applies to.

use crate::questionnaire::{Questionnaire, SyncMode};

/// Keeps questionnaires whose name starts with `prefix`, in input order.
///
/// Edit runs also drop `_EDIT` shadow questionnaires. Unedited runs keep them,
/// so a prefix of `FRS2504A` selects both `FRS2504A` and `FRS2504A_EDIT`.
pub fn select(all: Vec<Questionnaire>, prefix: &str, mode: SyncMode) -> Vec<Questionnaire> {
    all.into_iter()
        .filter(|questionnaire| matches(questionnaire, prefix, mode))
        .collect()
}

fn matches(questionnaire: &Questionnaire, prefix: &str, mode: SyncMode) -> bool {
    if !questionnaire.name.starts_with(prefix) {
        return false;
    }
    match mode {
        SyncMode::Unedited => true,
        SyncMode::Edit => !questionnaire.is_edit_shadow(),
    }
}
