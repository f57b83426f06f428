pub mod bootstrap;
pub mod config;
pub mod error;
pub mod node;
pub mod peers;
pub mod pow;
pub mod session;
pub mod transport;
pub mod wire;
