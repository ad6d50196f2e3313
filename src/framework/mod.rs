//! A framework that retries remote transactions until they succeed, fail permanently, or run out
//! of retries.
//!
//! See: [`StateError`], [`run_with_retries`]

mod retrying;
mod state;

pub use retrying::*;
pub use state::*;
