pub mod chat;
pub mod events;
pub mod models;
pub mod providers;
pub mod runs;
pub mod session;
