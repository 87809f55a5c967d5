mod authentication;

pub use authentication::{AuthService, AuthenticatedUser, ServiceInitError};
