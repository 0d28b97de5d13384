pub mod cache;
pub mod client;
pub mod correlator;
pub mod error;
pub mod models;
pub mod protocol;
pub mod transport;

pub use client::{EventSubscription, LinkClient};
pub use error::LinkError;
pub use models::*;
pub use transport::DEFAULT_PORT;
