//! Crate-local `.context()` helpers.
//!
//! Each crate keeps its own `Error` enum. Implementing [`FromMessage`] for it
//! and invoking [`impl_context!`](crate::impl_context) next to it adds a
//! `Context` trait with `.context()` / `.with_context()` for `Result` and
//! `Option`, mapping failures into that crate's `Error` without pulling in
//! `anyhow`.

/// Build an error value from a human-readable message.
pub trait FromMessage: Sized {
    fn from_message(message: String) -> Self;
}

/// Expands to a `Context<T>` trait plus impls for `Result<T, E: Display>` and
/// `Option<T>`.
///
/// Requires `Error: FromMessage` and `type Result<T>` in the invoking module:
///
/// ```ignore
/// // crates/config/src/error.rs
/// toolstream_common::impl_context!();
/// ```
#[macro_export]
macro_rules! impl_context {
    () => {
        pub trait Context<T> {
            /// Prefix the failure with `context`.
            fn context(self, context: impl Into<String>) -> Result<T>;

            /// Like `context`, building the prefix only on failure.
            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C;
        }

        impl<T, E: std::fmt::Display> Context<T> for std::result::Result<T, E> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                self.with_context(|| context)
            }

            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.map_err(|source| {
                    let prefix: String = f().into();
                    <Error as $crate::FromMessage>::from_message(format!("{prefix}: {source}"))
                })
            }
        }

        impl<T> Context<T> for Option<T> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                self.with_context(|| context)
            }

            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.ok_or_else(|| <Error as $crate::FromMessage>::from_message(f().into()))
            }
        }
    };
}
