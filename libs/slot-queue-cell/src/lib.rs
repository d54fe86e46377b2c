pub mod error;
pub mod keys;
pub mod models;
pub mod services;

pub use error::*;
pub use keys::LockKey;
pub use models::*;
pub use services::*;
