//! Scans every repository of an organization for CI workflows triggered on a cron schedule.
//!
//! The [`scanner::Scanner`] fans out over the organization's repositories with bounded
//! concurrency, extracts cron expressions from each workflow definition and correlates them with
//! the latest run status and committer. The resulting [`scanner::ScanResult`] is handed to a
//! [`report::Publisher`].

pub mod client;
pub mod connectivity;
pub mod env;
pub mod framework;
pub mod logging;
pub mod report;
pub mod scanner;
pub mod shutdown;
pub mod workflow;

#[cfg(test)]
mod testing;

/// A shorthand to define a statically allocated variable using a [`std::sync::LazyLock`].
///
/// # Examples
///
/// ```rust
/// use schedule_scanner::static_lazy_lock;
/// use std::sync::LazyLock;
///
/// static_lazy_lock! {
///     pub VAR_1: String = String::from("a static variable");
/// }
/// // ...equals to...
/// pub static VAR_2: LazyLock<String> = LazyLock::new(|| String::from("a static variable"));
/// ```
#[macro_export]
macro_rules! static_lazy_lock {
    ($(#[$meta:meta])* $vis:vis $name:ident: $type:ty = $expr:expr $(;)?) => {
        $(#[$meta])*
        $vis static $name: $crate::__priv_macro_use::LazyLock<$type> =
            $crate::__priv_macro_use::LazyLock::new(|| $expr);
    };
}

#[doc(hidden)]
pub mod __priv_macro_use {
    pub use std::sync::LazyLock;
}
