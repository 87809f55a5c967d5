//! SAML 2.0 service provider for Active Directory Federation Services.
//!
//! Validates signed AD FS assertions, extracts the user's attributes and maps
//! their AD group memberships onto application roles.

pub mod app;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod observability;
pub mod resilience;
pub mod roles;
pub mod routes;
pub mod saml;
pub mod services;

pub use app::{AppState, build_app};
