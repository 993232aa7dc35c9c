pub mod config;
pub mod data;
pub mod error;
pub mod exchange;
pub mod link;
pub mod mediator;
pub mod negotiate;
pub mod party;
pub mod relay;
pub mod sanity;
pub mod types;
