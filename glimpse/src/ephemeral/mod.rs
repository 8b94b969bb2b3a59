//! View-once content: timed viewing sessions and the durable set of
//! consumed message ids.

pub mod timer;
pub mod viewed;

pub use timer::{StartOutcome, ViewingMode, ViewingSession, ViewingState, ViewingTimer};
pub use viewed::{VIEWED_KEY, ViewedError, ViewedSet};
