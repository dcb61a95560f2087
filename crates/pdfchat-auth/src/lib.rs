pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtService};
pub use middleware::{
    admin_auth_ok, token_from_headers, AdminCredentials, AuthUser, RequireAdmin, RequireUser,
    SESSION_COOKIE,
};
