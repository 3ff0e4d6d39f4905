pub mod engine;
pub mod verification;
