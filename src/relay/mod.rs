pub mod client;
pub mod counter;
pub mod frame;

pub use client::{RelayClient, RelayError};
pub use counter::Sequenced;
pub use frame::{tag_str, Frame};
