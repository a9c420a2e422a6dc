//! Cheap token estimation used for progress accounting and prompt budgets.

/// Estimate the number of model tokens in `text` (about four bytes per
/// token, rounded up).
pub fn estimate(text: &str) -> usize {
    text.len().div_ceil(4)
}
