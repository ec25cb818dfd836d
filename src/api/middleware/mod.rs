//! API middleware

mod cors;
mod jwt;
mod logging;

pub use cors::cors_layer;
pub use jwt::{AuthError, AuthenticatedUser, Claims, JwtAuth};
pub use logging::RequestLogging;
