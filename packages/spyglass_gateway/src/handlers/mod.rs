pub mod meta;
pub mod tunnel;

// Re-export all handlers for easy route registration
pub use meta::{configuration_handler, create_token_handler, health_handler, metrics_handler};
pub use tunnel::tunnel_handler;
