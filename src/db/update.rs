//! `UPDATE` statement rendering for the scope's update helper.

use crate::error::{DbError, DbResult};
use crate::models::{Assignments, QueryParam};

/// Render `UPDATE table SET a = $1, ... [WHERE k = $n AND ...]`.
///
/// Values are returned in placeholder order. Conditions are always joined with `AND`.
pub fn render_update(
    table: &str,
    assignments: &Assignments,
    conditions: Option<&Assignments>,
) -> DbResult<(String, Vec<QueryParam>)> {
    check_identifier(table)?;
    if assignments.is_empty() {
        return Err(DbError::invalid_input(
            "update requires at least one column assignment",
        ));
    }

    let mut args = Vec::with_capacity(assignments.len() + conditions.map_or(0, |c| c.len()));
    let mut set_stmts = Vec::with_capacity(assignments.len());
    for (column, value) in assignments.iter() {
        check_identifier(column)?;
        args.push(value.clone());
        set_stmts.push(format!("{} = ${}", column, args.len()));
    }

    let mut sql = format!("UPDATE {} SET {}", table, set_stmts.join(", "));

    if let Some(conditions) = conditions {
        if conditions.is_empty() {
            return Err(DbError::invalid_input(
                "update conditions are empty; pass None to update every row",
            ));
        }
        let mut where_stmts = Vec::with_capacity(conditions.len());
        for (column, value) in conditions.iter() {
            check_identifier(column)?;
            args.push(value.clone());
            where_stmts.push(format!("{} = ${}", column, args.len()));
        }
        sql.push_str(" WHERE ");
        sql.push_str(&where_stmts.join(" AND "));
    }

    Ok((sql, args))
}

/// Accept plain and schema-qualified identifiers only.
fn check_identifier(name: &str) -> DbResult<()> {
    let valid = !name.is_empty()
        && name.split('.').all(|part| {
            !part.is_empty()
                && !part.starts_with(|c: char| c.is_ascii_digit())
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(DbError::invalid_input(format!(
            "'{}' is not a valid SQL identifier",
            name
        )))
    }
}
