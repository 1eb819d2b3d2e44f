//! Questionnaires and the table names derived from them.

use std::fmt;
use std::str::FromStr;

use casesync_db::{DbError, Ident};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Suffix of the shadow questionnaires used by the editing workflow.
pub const EDIT_QUESTIONNAIRE_SUFFIX: &str = "_EDIT";

const SOURCE_TABLE_SUFFIX: &str = "_Form";
const UNEDITED_TABLE_SUFFIX: &str = "_UNEDITED_Form";
const EDIT_TABLE_SUFFIX: &str = "_EDIT_Form";

/// A questionnaire as listed by the directory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Questionnaire {
    pub name: String,
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "serverParkName")]
    pub server_park: String,
    #[serde(default)]
    pub status: Option<String>,
    /// Every other field the directory returned.
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl Questionnaire {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            server_park: String::new(),
            status: None,
            metadata: Map::new(),
        }
    }

    pub fn is_edit_shadow(&self) -> bool {
        self.name.ends_with(EDIT_QUESTIONNAIRE_SUFFIX)
    }
}

/// Which shadow table a run writes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `<name>_UNEDITED_Form`, created on demand.
    Unedited,
    /// `<name>_EDIT_Form`, expected to exist already.
    Edit,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unedited => "unedited",
            Self::Edit => "edit",
        }
    }

    fn target_suffix(self) -> &'static str {
        match self {
            Self::Unedited => UNEDITED_TABLE_SUFFIX,
            Self::Edit => EDIT_TABLE_SUFFIX,
        }
    }

    /// Source and target tables for `questionnaire` in this mode.
    pub fn tables(self, questionnaire: &str) -> Result<TableRefs, DbError> {
        Ok(TableRefs {
            source: Ident::new(format!("{questionnaire}{SOURCE_TABLE_SUFFIX}"))?,
            target: Ident::new(format!("{questionnaire}{}", self.target_suffix()))?,
        })
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "unedited" => Ok(Self::Unedited),
            "edit" => Ok(Self::Edit),
            other => Err(format!("unknown sync mode '{other}'")),
        }
    }
}

/// The pair of tables one questionnaire sync reads and writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableRefs {
    pub source: Ident,
    pub target: Ident,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_table_names_per_mode() {
        let unedited = SyncMode::Unedited.tables("FRS2504A").expect("tables");
        assert_eq!(unedited.source.as_str(), "FRS2504A_Form");
        assert_eq!(unedited.target.as_str(), "FRS2504A_UNEDITED_Form");

        let edit = SyncMode::Edit.tables("FRS2504A").expect("tables");
        assert_eq!(edit.source.as_str(), "FRS2504A_Form");
        assert_eq!(edit.target.as_str(), "FRS2504A_EDIT_Form");
    }

    #[test]
    fn crafted_names_never_become_tables() {
        assert!(SyncMode::Unedited.tables("FRS\"; DROP TABLE x; --").is_err());
        assert!(SyncMode::Edit.tables(&"F".repeat(60)).is_err());
    }

    #[test]
    fn deserializes_directory_payload() {
        let json = r#"{
            "name": "FRS2504A",
            "id": "1232",
            "serverParkName": "gusty",
            "status": "Active",
            "dataRecordCount": 12,
            "hasData": true
        }"#;
        let questionnaire: Questionnaire = serde_json::from_str(json).expect("decode");
        assert_eq!(questionnaire.name, "FRS2504A");
        assert_eq!(questionnaire.server_park, "gusty");
        assert_eq!(questionnaire.status.as_deref(), Some("Active"));
        assert_eq!(questionnaire.metadata.get("dataRecordCount"), Some(&Value::from(12)));
        assert!(!questionnaire.is_edit_shadow());
    }

    #[test]
    fn parses_modes() {
        assert_eq!("edit".parse::<SyncMode>(), Ok(SyncMode::Edit));
        assert!("EDIT".parse::<SyncMode>().is_err());
    }
}
