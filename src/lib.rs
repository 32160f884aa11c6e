pub mod config;
pub mod error;
pub mod launcher;
pub mod liveness;
pub mod message_queue;
pub mod protocol;
pub mod registry;
pub mod requester;
pub mod responder;
pub mod server;
pub mod state;
pub mod workspace;
