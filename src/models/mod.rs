pub mod allowance;
pub mod attempt;
pub mod exam;
pub mod review;
pub mod review_policy;
pub mod user;

/// Raised when a stored enum column holds a value outside the known set.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}
