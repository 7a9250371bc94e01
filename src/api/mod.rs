pub mod client;
pub mod sign;

pub use client::{ApiClient, ContainerGroup, UserKey};
pub use sign::FormData;
