pub mod broadcast;
pub mod connection;
pub mod delta;
pub mod framing;
pub mod protocol;
pub mod room;
pub mod tls;
pub mod transport;
