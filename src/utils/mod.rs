pub mod evaluation;
pub(crate) mod parallel;
pub mod preprocessing;
pub mod window;
