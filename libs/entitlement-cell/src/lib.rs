pub mod models;
pub mod services;

pub use models::*;
pub use services::engine::EntitlementService;
pub use services::verification::ActivationVerifier;
