//! Shared data model for the Glimpse sync core.

pub mod codec;
pub mod event;
pub mod message;
pub mod projection;
pub mod row;
