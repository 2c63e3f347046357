//! Facilities for reporting controller outcomes
//!
//! The primary entry point is [`report_controller_error`], the sink for keys that exhausted
//! their retries.

use std::error::Error;

/// [`Error`] extensions that help report reconciliation errors
///
/// This should be implemented for reconciler error types.
pub trait ReconcilerError: Error {
    /// `PascalCase`d name for the error category
    ///
    /// This can typically be implemented by delegating to [`strum::EnumDiscriminants`] and [`strum::IntoStaticStr`].
    fn category(&self) -> &'static str;
}

/// Renders `error` and its whole source chain as a single line.
pub fn error_chain(error: &dyn Error) -> String {
    use std::fmt::Write;

    let mut buf = error.to_string();
    let mut source = error.source();
    while let Some(err) = source {
        // Writing to a String cannot fail
        let _ = write!(buf, ": {err}");
        source = err.source();
    }
    buf
}

/// Reports the outcome of a successfully processed key.
pub fn report_controller_reconciled(controller_name: &str, key: &str) {
    tracing::debug!(controller.name = controller_name, key, "Reconciled object");
}

/// Reports an error that is dropped after too many retries to the operator administrator.
///
/// This never panics, the key is simply forgotten until the next event enqueues it again.
pub fn report_controller_error<E>(controller_name: &str, key: &str, retries: u32, error: &E)
where
    E: ReconcilerError,
{
    tracing::error!(
        controller.name = controller_name,
        key,
        retries,
        error.category = error.category(),
        error = error_chain(error),
        "Dropping key out of the work queue",
    );
}

#[cfg(test)]
mod tests {
    use snafu::Snafu;

    use super::*;

    #[derive(Debug, Snafu)]
    #[snafu(display("outer failure"))]
    struct Outer {
        source: Inner,
    }

    #[derive(Debug, Snafu)]
    #[snafu(display("inner failure"))]
    struct Inner;

    impl ReconcilerError for Outer {
        fn category(&self) -> &'static str {
            "Outer"
        }
    }

    #[test]
    fn error_chain_includes_sources() {
        let err = Outer { source: Inner };
        assert_eq!(error_chain(&err), "outer failure: inner failure");
    }

    #[test]
    fn report_does_not_panic() {
        report_controller_error("test", "key", 5, &Outer { source: Inner });
    }
}
