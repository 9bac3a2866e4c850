pub mod binder;
pub mod bridge;
pub mod connection;
pub mod events;
pub mod fanout;
pub mod handler;
pub mod hub;
pub mod registry;
pub mod rooms;
pub mod server;
pub mod spool;
pub mod subscriber;
pub mod tasks;

pub use hub::Hub;
