//! Report-or-throw policy applied when an admission ends in error.

use crate::error::{Outcome, VmError};
use crate::opts::Opts;

/// Logs `err` at the severity the options select for its fault code, then
/// returns it as an [`Outcome`] if the code is in `nothrows` or raises it
/// otherwise. Interruptions are never classified and always raised.
pub fn handle_error(opts: &Opts, loghead: &str, err: VmError) -> Result<Outcome, VmError> {
    let Some(code) = err.classify() else {
        tracing::debug!(eval = loghead, "admission interrupted");
        return Err(err);
    };

    if opts.errorlog.contains(code) {
        tracing::error!(eval = loghead, code = %code, "{}", err.reason());
    } else if opts.warnlog.contains(code) {
        tracing::warn!(eval = loghead, code = %code, "{}", err.reason());
    } else {
        tracing::debug!(eval = loghead, code = %code, "{}", err.reason());
    }

    if opts.nothrows.contains(code) {
        Ok(Outcome::from_fault(code, err.reason()))
    } else {
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_types::{Fault, FaultSet};

    #[test]
    fn exists_is_reported_by_default() {
        let outcome = handle_error(&Opts::default(), "t", VmError::exists("dup")).unwrap();
        assert_eq!(outcome, Outcome::Exists);
    }

    #[test]
    fn invalid_is_raised_by_default() {
        let err = handle_error(&Opts::default(), "t", VmError::invalid("bad")).unwrap_err();
        assert_eq!(err.classify(), Some(Fault::Invalid));
    }

    #[test]
    fn nothrows_turns_errors_into_values() {
        let opts = Opts {
            nothrows: FaultSet::all(),
            ..Opts::default()
        };
        let outcome = handle_error(&opts, "t", VmError::general("missing prev_event $p")).unwrap();
        assert_eq!(
            outcome,
            Outcome::General {
                reason: "missing prev_event $p".to_string()
            }
        );
    }

    #[test]
    fn interruption_escapes_every_policy() {
        let opts = Opts {
            nothrows: FaultSet::all(),
            ..Opts::default()
        };
        assert!(matches!(
            handle_error(&opts, "t", VmError::Interrupted),
            Err(VmError::Interrupted)
        ));
    }
}
