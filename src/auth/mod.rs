pub mod providers;

pub use providers::{bearer_token, AuthProvider, JwtAuthProvider, JwtClaims};
