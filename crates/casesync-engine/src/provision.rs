//! Creates unedited shadow tables on first use.

use casesync_db::{DbResult, Ident, TableTransaction};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Provisioned {
    /// The target did not exist and was cloned from the source.
    pub created: bool,
}

/// Makes sure `target` exists, cloning the schema of `source` when it does not.
///
/// An existing target is left untouched.
pub async fn ensure_unedited(
    tx: &mut dyn TableTransaction,
    target: &Ident,
    source: &Ident,
) -> DbResult<Provisioned> {
    if tx.table_exists(target).await? {
        tracing::debug!(%target, "target table already exists");
        return Ok(Provisioned { created: false });
    }
    tx.clone_table_schema(target, source).await?;
    tracing::info!(%target, %source, "created target table");
    Ok(Provisioned { created: true })
}
