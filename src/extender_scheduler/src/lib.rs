mod bind;
mod controller;
mod predicate;
mod prioritize;
mod registry;
mod types;

pub use bind::*;
pub use controller::*;
pub use predicate::*;
pub use prioritize::*;
pub use registry::*;
pub use types::*;

#[cfg(test)]
mod scheduler_tests;
