pub mod handlers;
pub mod message_types;

pub use handlers::ws_handler;
