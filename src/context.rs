// src/context.rs
//! Context extension traits + macros for error handling.
//!
//! anyhow-like `.context()` / `.with_context()` on `Result` and `Option`,
//! plus `ensure!`, all producing the crate [`Error`].

use crate::error::{Error, Result};

/// Extension trait giving you `.context()` / `.with_context()` on any `Result`.
///
/// Works with foreign errors too (as long as they convert into our `Error`).
pub trait Context<T, E> {
    /// Add static or owned context (eager, use only when cheap).
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>;

    /// Add context lazily (closure only runs on error path).
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E> Context<T, E> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    #[inline(always)]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>,
    {
        match self {
            Ok(value) => Ok(value),
            Err(err) => Err(err.into().context(context)),
        }
    }

    #[inline(always)]
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        match self {
            Ok(value) => Ok(value),
            Err(err) => Err(err.into().context(f())),
        }
    }
}

/// Extension trait for `Option<T>` → `Result<T, Error>` with context.
pub trait OptionContext<T> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T> OptionContext<T> for Option<T> {
    #[inline(always)]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>,
    {
        self.ok_or_else(|| Error::custom(context))
    }

    #[inline(always)]
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.ok_or_else(|| Error::custom(f()))
    }
}

// ====================== CONVENIENCE MACROS ======================

/// Returns early with an error unless the condition holds. The error is
/// either an expression converting into [`Error`] or a format string.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $err:expr $(,)?) => {
        if !($cond) {
            return Err(Into::<$crate::error::Error>::into($err));
        }
    };
    ($cond:expr, $fmt:expr, $($arg:tt)*) => {
        if !($cond) {
            return Err($crate::error::Error::format(format_args!($fmt, $($arg)*)));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<u32> {
        let v: u32 = s
            .parse::<u32>()
            .map_err(|e| Error::custom(e.to_string()))
            .context("parsing count")?;
        crate::ensure!(v > 0, Error::init("count must be positive"));
        Ok(v)
    }

    #[test]
    fn context_wraps_errors() {
        let err = parse("x").unwrap_err();
        assert!(err.to_string().starts_with("parsing count: "));
    }

    #[test]
    fn ensure_returns_given_error() {
        assert!(parse("0").unwrap_err().is_init());
        assert_eq!(parse("3").unwrap(), 3);
    }

    #[test]
    fn ensure_formats_messages() {
        fn check(n: u32) -> Result<()> {
            crate::ensure!(n < 10, "{} is too large", n);
            Ok(())
        }
        assert!(check(3).is_ok());
        assert!(check(12).unwrap_err().to_string().contains("12 is too large"));
    }

    #[test]
    fn option_context() {
        let none: Option<u8> = None;
        let err = none.with_context(|| "missing mesh").unwrap_err();
        assert_eq!(err.to_string(), "missing mesh");
    }
}
