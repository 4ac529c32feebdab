pub use socket::PhoenixTransport;

pub mod protocol;
pub mod socket;
