//! Identifier whitelisting and metadata statements.
//!
//! `describe_table` and `list_tables` accept no free-form SQL: caller names
//! are checked against the Oracle identifier charset and then passed as
//! bind values into fixed dictionary statements, never interpolated.

use crate::error::{GatewayError, Result};

/// Oracle's unquoted identifier length limit.
pub const MAX_IDENTIFIER_LEN: usize = 30;

/// Check a schema/table name against `[A-Za-z][A-Za-z0-9_$#]*`, at most
/// [`MAX_IDENTIFIER_LEN`] characters.
#[must_use]
pub fn is_valid_identifier(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_IDENTIFIER_LEN {
        return false;
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {},
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '#')
}

/// Validate an identifier, or fail with `BadIdentifier`.
pub fn validate_identifier(name: &str) -> Result<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(GatewayError::bad_identifier(name))
    }
}

/// Column metadata for a table in an explicit schema.
const DESCRIBE_SQL: &str = "\
SELECT c.COLUMN_NAME, c.DATA_TYPE, c.NULLABLE, \
CASE WHEN pk.COLUMN_NAME IS NOT NULL THEN 'Y' ELSE 'N' END AS PK \
FROM ALL_TAB_COLUMNS c \
LEFT JOIN (SELECT cc.OWNER, cc.TABLE_NAME, cc.COLUMN_NAME \
FROM ALL_CONSTRAINTS k \
JOIN ALL_CONS_COLUMNS cc ON cc.CONSTRAINT_NAME = k.CONSTRAINT_NAME AND cc.OWNER = k.OWNER \
WHERE k.CONSTRAINT_TYPE = 'P') pk \
ON pk.OWNER = c.OWNER AND pk.TABLE_NAME = c.TABLE_NAME AND pk.COLUMN_NAME = c.COLUMN_NAME \
WHERE c.TABLE_NAME = :1 AND c.OWNER = :2 \
ORDER BY c.COLUMN_ID";

/// Column metadata for a table in the session's own schema.
const DESCRIBE_CURRENT_SCHEMA_SQL: &str = "\
SELECT c.COLUMN_NAME, c.DATA_TYPE, c.NULLABLE, \
CASE WHEN pk.COLUMN_NAME IS NOT NULL THEN 'Y' ELSE 'N' END AS PK \
FROM USER_TAB_COLUMNS c \
LEFT JOIN (SELECT cc.TABLE_NAME, cc.COLUMN_NAME \
FROM USER_CONSTRAINTS k \
JOIN USER_CONS_COLUMNS cc ON cc.CONSTRAINT_NAME = k.CONSTRAINT_NAME \
WHERE k.CONSTRAINT_TYPE = 'P') pk \
ON pk.TABLE_NAME = c.TABLE_NAME AND pk.COLUMN_NAME = c.COLUMN_NAME \
WHERE c.TABLE_NAME = :1 \
ORDER BY c.COLUMN_ID";

const LIST_TABLES_SQL: &str =
    "SELECT TABLE_NAME FROM ALL_TABLES WHERE OWNER = :1 ORDER BY TABLE_NAME";

const LIST_CURRENT_SCHEMA_TABLES_SQL: &str =
    "SELECT TABLE_NAME FROM USER_TABLES ORDER BY TABLE_NAME";

/// Build the describe statement for a validated table name.
///
/// Bind values are upper-cased because the Oracle dictionary stores
/// unquoted identifiers in upper case.
pub fn describe_statement(
    table: &str,
    schema: Option<&str>,
) -> Result<(&'static str, Vec<String>)> {
    validate_identifier(table)?;
    match schema {
        Some(schema) => {
            validate_identifier(schema)?;
            Ok((
                DESCRIBE_SQL,
                vec![table.to_ascii_uppercase(), schema.to_ascii_uppercase()],
            ))
        },
        None => Ok((DESCRIBE_CURRENT_SCHEMA_SQL, vec![table.to_ascii_uppercase()])),
    }
}

/// Build the list-tables statement for an optional validated schema name.
pub fn list_statement(schema: Option<&str>) -> Result<(&'static str, Vec<String>)> {
    match schema {
        Some(schema) => {
            validate_identifier(schema)?;
            Ok((LIST_TABLES_SQL, vec![schema.to_ascii_uppercase()]))
        },
        None => Ok((LIST_CURRENT_SCHEMA_TABLES_SQL, Vec::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        assert!(is_valid_identifier("USERS"));
        assert!(is_valid_identifier("my_table"));
        assert!(is_valid_identifier("T1"));
        assert!(is_valid_identifier("ORDERS$AUDIT"));
        assert!(is_valid_identifier("TMP#1"));
    }

    #[test]
    fn test_invalid_identifiers() {
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("1TABLE"));
        assert!(!is_valid_identifier("$LEAD"));
        assert!(!is_valid_identifier("BAD-NAME"));
        assert!(!is_valid_identifier("SCHEMA.TABLE"));
        assert!(!is_valid_identifier("NAME WITH SPACE"));
        assert!(!is_valid_identifier("T;DROP"));
        assert!(!is_valid_identifier("T'--"));
    }

    #[test]
    fn test_length_limit() {
        assert!(is_valid_identifier(&"A".repeat(30)));
        assert!(!is_valid_identifier(&"A".repeat(31)));
    }

    #[test]
    fn test_validate_identifier_error_kind() {
        let err = validate_identifier("not valid").unwrap_err();
        assert_eq!(err.error_code(), "bad_identifier");
    }

    #[test]
    fn test_describe_statement_binds_uppercase() {
        let (sql, binds) = describe_statement("orders", Some("app")).unwrap();
        assert!(sql.contains("ALL_TAB_COLUMNS"));
        assert_eq!(binds, vec!["ORDERS".to_string(), "APP".to_string()]);
    }

    #[test]
    fn test_describe_statement_without_schema() {
        let (sql, binds) = describe_statement("orders", None).unwrap();
        assert!(sql.contains("USER_TAB_COLUMNS"));
        assert_eq!(binds, vec!["ORDERS".to_string()]);
    }

    #[test]
    fn test_describe_statement_rejects_bad_table() {
        assert!(describe_statement("orders; drop", None).is_err());
    }

    #[test]
    fn test_list_statement_variants() {
        let (sql, binds) = list_statement(Some("app")).unwrap();
        assert!(sql.contains("ALL_TABLES"));
        assert_eq!(binds, vec!["APP".to_string()]);

        let (sql, binds) = list_statement(None).unwrap();
        assert!(sql.contains("USER_TABLES"));
        assert!(binds.is_empty());
    }
}
