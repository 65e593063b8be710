//! Authentication: bearer-token validation and subject extraction.

pub mod jwt;
pub mod middleware;

pub use jwt::JwtHandler;
pub use middleware::auth_middleware;
