#![deny(missing_docs)]

//! Error handling for the strata data cache.
//!
//! Every fallible operation in the workspace returns [`StrataResult`]. The
//! [`strata_err!`] and [`strata_bail!`] macros construct errors from either a
//! bare format string (the generic variant) or a `Variant: "fmt", args` form.

use std::borrow::Cow;
use std::fmt::{Display, Formatter};
use std::ops::Deref;

mod ext;

pub use ext::*;

/// A `Result` with a [`StrataError`] error type.
pub type StrataResult<T> = Result<T, StrataError>;

/// The top-level error type for the strata cache.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StrataError {
    /// A generic error with a message.
    #[error("{0}")]
    General(ErrString),
    /// An allocation could not be satisfied, even after eviction.
    #[error("out of capacity: {0}")]
    OutOfCapacity(ErrString),
    /// Malformed on-disk data, e.g. a compression block header that does not
    /// fit the configured buffer size.
    #[error("bad format: {0}")]
    BadFormat(ErrString),
    /// The input ended in the middle of a compression block.
    #[error("truncated: {0}")]
    Truncated(ErrString),
    /// A seek that does not land on a compression block boundary, or that
    /// falls outside the stream.
    #[error("invalid seek: {0}")]
    InvalidSeek(ErrString),
    /// A pin was attempted on an invalidated buffer. Surfaced to callers as a
    /// cache miss, never as a failure.
    #[error("invalidated: {0}")]
    Invalidated(ErrString),
    /// An invalid argument, e.g. a configuration violation detected at
    /// construction.
    #[error("invalid argument: {0}")]
    InvalidArgument(ErrString),
    /// An I/O error from the underlying source reader.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// A wrapper around a string that can be used as an error message.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ErrString(Cow<'static, str>);

impl<T> From<T> for ErrString
where
    T: Into<Cow<'static, str>>,
{
    fn from(msg: T) -> Self {
        ErrString(msg.into())
    }
}

impl Display for ErrString {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Deref for ErrString {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Construct a [`StrataError`].
///
/// `strata_err!("...")` builds the generic variant; `strata_err!(Variant:
/// "...", args)` builds the named variant.
#[macro_export]
macro_rules! strata_err {
    ($variant:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::StrataError::$variant(format!($fmt $(, $arg)*).into())
    };
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::StrataError::General(format!($fmt $(, $arg)*).into())
    };
}

/// Return early with a [`StrataError`]. Accepts the same forms as
/// [`strata_err!`].
#[macro_export]
macro_rules! strata_bail {
    ($variant:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {
        return Err($crate::strata_err!($variant: $fmt $(, $arg)*))
    };
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        return Err($crate::strata_err!($fmt $(, $arg)*))
    };
}

/// Panic with a formatted message. Reserved for violated internal invariants
/// that leave the cache in an unrecoverable state.
#[macro_export]
macro_rules! strata_panic {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        panic!("{}", $crate::strata_err!($fmt $(, $arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_message() {
        let err = strata_err!("failed to frob {}", 42);
        assert!(matches!(err, StrataError::General(_)));
        assert_eq!(err.to_string(), "failed to frob 42");
    }

    #[test]
    fn named_variant() {
        let err = strata_err!(OutOfCapacity: "needed {} bytes", 1024);
        assert!(matches!(err, StrataError::OutOfCapacity(_)));
        assert_eq!(err.to_string(), "out of capacity: needed 1024 bytes");
    }

    #[test]
    fn bail_returns_err() {
        fn inner() -> StrataResult<()> {
            strata_bail!(BadFormat: "bad header");
        }
        assert!(matches!(inner(), Err(StrataError::BadFormat(_))));
    }
}
