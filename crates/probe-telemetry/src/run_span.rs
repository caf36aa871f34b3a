use tracing::Span;
use uuid::Uuid;

/// Short id for one `probe run` invocation (12 hex characters).
pub fn new_run_id() -> String {
    Uuid::new_v4().as_simple().to_string()[..12].to_string()
}

/// Root span for a run; enter it (or `instrument` with it) so that every
/// scenario line carries the run id.
pub fn run_span(run_id: &str, files: usize) -> Span {
    tracing::info_span!("run", run_id = %run_id, files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_short_hex_and_unique() {
        let a = new_run_id();
        let b = new_run_id();
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
