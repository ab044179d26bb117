//! Types
//!
//! Token and configuration types shared across the client.

pub mod config;
pub mod token;

pub use config::*;
pub use token::*;
