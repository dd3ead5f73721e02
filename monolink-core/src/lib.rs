mod error;
pub use error::{Error, Result};

pub mod codec;
pub mod config;
pub mod connection;
pub mod handler;
pub mod listener;
pub mod registry;
pub mod server;
pub mod signal;

pub use codec::{Decoder, Message};
pub use connection::{ConnState, Connection, ConnectionRef};
pub use handler::{ErrorKind, Handler};
pub use registry::Registry;
pub use server::Server;
pub use signal::Signal;

#[cfg(test)]
pub(crate) mod test_util;
