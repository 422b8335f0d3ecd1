//! Subscription management
//!
//! Tracks which topics are subscribed, detects the first price of each index
//! and expands the subscription set to the option strike window around it.

mod manager;
mod strikes;
mod token;

pub use manager::*;
pub use strikes::*;
pub use token::*;
