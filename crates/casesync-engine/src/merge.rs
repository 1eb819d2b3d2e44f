//! Idempotent upsert of unedited rows from a source table into its shadow.

use casesync_db::{DbError, DbResult, Ident, TableTransaction};

use crate::config::MergeColumns;

/// Builds and runs the merge statement for a configured column set.
#[derive(Clone, Debug)]
pub struct MergeCopier {
    key: Ident,
    edited_flag: Ident,
    mutable: Vec<Ident>,
}

impl MergeCopier {
    pub fn new(columns: &MergeColumns) -> DbResult<Self> {
        Ok(Self {
            key: Ident::new(&columns.key)?,
            edited_flag: Ident::new(&columns.edited_flag)?,
            mutable: columns
                .mutable
                .iter()
                .map(Ident::new)
                .collect::<DbResult<_>>()?,
        })
    }

    /// The upsert for `source` rows whose columns are `source_columns`.
    ///
    /// Rows flagged as edited are skipped. On a key conflict only the key and
    /// the mutable columns present in `source` are overwritten.
    pub fn statement(
        &self,
        target: &Ident,
        source: &Ident,
        source_columns: &[Ident],
    ) -> DbResult<String> {
        if !source_columns.contains(&self.key) {
            return Err(DbError::statement(
                "merge",
                format!("source table {source} has no {} column", self.key),
            ));
        }

        let column_list = source_columns
            .iter()
            .map(Ident::quoted)
            .collect::<Vec<_>>()
            .join(", ");

        // SQLite only parses ON CONFLICT after INSERT ... SELECT when a WHERE is present.
        let filter = if source_columns.contains(&self.edited_flag) {
            format!("COALESCE({}, 0) <> 1", self.edited_flag.quoted())
        } else {
            "true".to_string()
        };

        let updates: Vec<String> = std::iter::once(&self.key)
            .chain(self.mutable.iter().filter(|col| source_columns.contains(col)))
            .map(|col| format!("{0} = excluded.{0}", col.quoted()))
            .collect();
        let on_conflict = if updates.len() > 1 {
            format!("DO UPDATE SET {}", updates.join(", "))
        } else {
            "DO NOTHING".to_string()
        };

        Ok(format!(
            "INSERT INTO {target} ({column_list}) SELECT {column_list} FROM {source} WHERE {filter} \
             ON CONFLICT ({key}) {on_conflict}",
            target = target.quoted(),
            source = source.quoted(),
            key = self.key.quoted(),
        ))
    }

    /// Merges `source` into `target` inside `tx` and returns the rows affected.
    pub async fn merge(
        &self,
        tx: &mut dyn TableTransaction,
        target: &Ident,
        source: &Ident,
    ) -> DbResult<u64> {
        let columns = tx.columns(source).await?;
        if columns.is_empty() {
            return Err(DbError::TableNotFound {
                table: source.to_string(),
            });
        }
        let statement = self.statement(target, source, &columns)?;
        tracing::debug!(%statement, "merging rows");
        let rows = tx.execute(&statement).await?;
        tracing::info!(%target, %source, rows, "merged rows");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idents(names: &[&str]) -> Vec<Ident> {
        names.iter().map(|name| Ident::new(*name).expect("ident")).collect()
    }

    fn tables() -> (Ident, Ident) {
        (
            Ident::new("FRS2504A_UNEDITED_Form").expect("target"),
            Ident::new("FRS2504A_Form").expect("source"),
        )
    }

    #[test]
    fn full_column_set() {
        let copier = MergeCopier::new(&MergeColumns::default()).expect("copier");
        let (target, source) = tables();
        let sql = copier
            .statement(
                &target,
                &source,
                &idents(&["Serial_Number", "QEdit_edited", "QEdit_LastUpdated", "DataStream"]),
            )
            .expect("statement");
        assert_eq!(
            sql,
            "INSERT INTO \"FRS2504A_UNEDITED_Form\" (\"Serial_Number\", \"QEdit_edited\", \
             \"QEdit_LastUpdated\", \"DataStream\") SELECT \"Serial_Number\", \"QEdit_edited\", \
             \"QEdit_LastUpdated\", \"DataStream\" FROM \"FRS2504A_Form\" \
             WHERE COALESCE(\"QEdit_edited\", 0) <> 1 ON CONFLICT (\"Serial_Number\") DO UPDATE SET \
             \"Serial_Number\" = excluded.\"Serial_Number\", \
             \"QEdit_LastUpdated\" = excluded.\"QEdit_LastUpdated\", \
             \"DataStream\" = excluded.\"DataStream\""
        );
    }

    #[test]
    fn missing_flag_copies_every_row() {
        let copier = MergeCopier::new(&MergeColumns::default()).expect("copier");
        let (target, source) = tables();
        let sql = copier
            .statement(&target, &source, &idents(&["Serial_Number", "DataStream"]))
            .expect("statement");
        assert!(sql.contains("WHERE true ON CONFLICT"), "{sql}");
        assert!(!sql.contains("QEdit_LastUpdated"), "{sql}");
    }

    #[test]
    fn key_only_source_does_nothing_on_conflict() {
        let copier = MergeCopier::new(&MergeColumns::default()).expect("copier");
        let (target, source) = tables();
        let sql = copier
            .statement(&target, &source, &idents(&["Serial_Number", "QEdit_edited"]))
            .expect("statement");
        assert!(sql.ends_with("ON CONFLICT (\"Serial_Number\") DO NOTHING"), "{sql}");
    }

    #[test]
    fn source_without_key_is_rejected() {
        let copier = MergeCopier::new(&MergeColumns::default()).expect("copier");
        let (target, source) = tables();
        let err = copier
            .statement(&target, &source, &idents(&["QEdit_edited", "DataStream"]))
            .expect_err("no key");
        assert!(matches!(err, DbError::Statement { operation: "merge", .. }));
    }

    #[test]
    fn column_names_are_validated() {
        let columns = MergeColumns {
            key: "Serial Number".to_string(),
            ..MergeColumns::default()
        };
        assert!(matches!(
            MergeCopier::new(&columns),
            Err(DbError::InvalidIdentifier { .. })
        ));
    }
}
