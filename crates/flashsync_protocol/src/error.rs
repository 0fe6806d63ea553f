//! Error types for protocol decoding and validation.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding or validating protocol payloads.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// JSON could not be parsed into the expected shape.
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A row does not have the column count of its table.
    #[error("{table} row has {actual} columns, expected {expected}")]
    ColumnCount {
        /// Table name.
        table: &'static str,
        /// Expected number of columns.
        expected: usize,
        /// Number of columns found.
        actual: usize,
    },

    /// A column that must hold an integer holds something else.
    #[error("{table} row: column {index} is not an integer")]
    NotAnInteger {
        /// Table name.
        table: &'static str,
        /// Column index.
        index: usize,
    },

    /// The remote returned an error envelope.
    #[error("remote error: {0}")]
    Remote(String),

    /// The envelope carried neither data nor an error.
    #[error("envelope has no data")]
    MissingData,

    /// Unknown table name.
    #[error("unknown table: {0}")]
    UnknownTable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_count_display() {
        let err = ProtocolError::ColumnCount {
            table: "cards",
            expected: 18,
            actual: 3,
        };
        assert_eq!(err.to_string(), "cards row has 3 columns, expected 18");
    }

    #[test]
    fn malformed_from_serde() {
        let err: ProtocolError = serde_json::from_str::<i64>("nope").unwrap_err().into();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }
}
