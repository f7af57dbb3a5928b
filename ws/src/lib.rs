mod client;
mod hub;
mod registry;
pub mod ws_server;

pub use client::Client;
pub use hub::Hub;
pub use registry::Registry;
