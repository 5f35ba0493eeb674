//! Error ranking for multi-step teardown.

use clickhousetest_core::Result;
use tracing::warn;

/// Combine two teardown steps that have both already run.
///
/// The first failure is returned. If both failed, the second is logged.
pub(crate) fn first_failure(first: Result<()>, second: Result<()>) -> Result<()> {
    match (first, second) {
        (Err(primary), Err(secondary)) => {
            warn!(error = %secondary, "Later teardown step also failed");
            Err(primary)
        }
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Ok(()), Ok(())) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clickhousetest_core::{Error, Phase};
    use std::io;
    use std::path::PathBuf;
    use tokio_test::{assert_err, assert_ok};

    fn kill_failed() -> Error {
        Error::Process {
            phase: Phase::Teardown,
            what: "terminate server process".to_string(),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        }
    }

    fn dir_failed() -> Error {
        Error::Filesystem {
            phase: Phase::Teardown,
            path: PathBuf::from("/tmp/clickhousetest-gone"),
            source: io::Error::from(io::ErrorKind::NotFound),
        }
    }

    #[test]
    fn test_process_error_wins_over_directory_error() {
        let err = assert_err!(first_failure(Err(kill_failed()), Err(dir_failed())));
        assert!(matches!(err, Error::Process { .. }));
    }

    #[test]
    fn test_single_failure_is_returned_whichever_step_failed() {
        let err = assert_err!(first_failure(Err(kill_failed()), Ok(())));
        assert!(matches!(err, Error::Process { .. }));

        let err = assert_err!(first_failure(Ok(()), Err(dir_failed())));
        assert!(matches!(err, Error::Filesystem { .. }));

        assert_ok!(first_failure(Ok(()), Ok(())));
    }
}
