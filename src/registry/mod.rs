pub mod auth;
pub mod client;
pub mod error;

pub use client::{RegistryClient, RegistryCreateInfo};
pub use error::{RegistryError, RegistryErrorKind};
