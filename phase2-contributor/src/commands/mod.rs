pub mod auth;
pub mod contribute;

pub use auth::{login_subcommand, logout_subcommand};
pub use contribute::contribute_subcommand;
