//! Detection and bounded repair of malformed generated output.

mod detector;
mod manager;

pub use detector::{
    Incompleteness, REASON_EMPTY, REASON_TRAILING_OPENER, REASON_TRUNCATED_COLLECTION,
    REASON_TRUNCATED_EXPRESSION, REASON_TRUNCATED_RETURN, REASON_UNCLOSED_BRACKET,
    REASON_UNEXPECTED_CLOSER, REASON_UNTERMINATED_COMMENT, REASON_UNTERMINATED_STRING,
    detect_incomplete,
};
pub use manager::{
    Consultant, RecoveryConfig, RecoveryManager, RecoveryOutcome, RecoveryRequest, RevertAction,
    restore_snapshot,
};
