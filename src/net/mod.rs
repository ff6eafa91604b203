//! Message-oriented networking between Pythia components.
//!
//! The queue is the only listener; every other component dials it. Peers
//! exchange framed JSON [`Message`](crate::message::Message)s over TCP or
//! Unix stream sockets, with keep-alive based liveness detection.

pub mod addr;
pub mod conn;
pub mod listener;

pub use addr::Addr;
pub use conn::{dial, dial_retry, Conn, ConnSender};
pub use listener::Listener;
