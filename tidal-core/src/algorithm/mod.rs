//! The operation algebra: compose, invert and transform.
//!
//! | Operation   | Cost                         |
//! |-------------|------------------------------|
//! | `compose`   | O(n + m) in components       |
//! | `invert`    | O(n)                         |
//! | `transform` | O(n + m) in components       |
//!
//! All three only ever produce operations that pass validation; a failure
//! means the inputs disagree about the document they apply to.

mod compose;
mod invert;
mod transform;

pub use compose::{compose, compose_all};
pub use invert::invert;
pub use transform::{transform, transform_with, ConflictPolicy};
