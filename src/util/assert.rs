/// Panics with an internal-assertion message when `condition` is false.
///
/// Reserved for invariants whose violation means local state is corrupt.
pub fn hard_assert(condition: bool, message: impl AsRef<str>) {
    if !condition {
        panic!("{}", assertion_error(message));
    }
}

pub fn assertion_error(message: impl AsRef<str>) -> String {
    format!(
        "firestore-sync ({}) INTERNAL ASSERT FAILED: {}",
        env!("CARGO_PKG_VERSION"),
        message.as_ref()
    )
}
