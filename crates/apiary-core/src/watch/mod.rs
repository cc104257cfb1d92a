//! Change notification layer.
//!
//! Delivery is at-least-once and ordered per key; unrelated keys are not
//! ordered against each other. A slow watcher may miss intermediate values
//! but always ends up with the latest value of every key it watches.

mod hub;
mod mailbox;

pub use self::hub::{Subscription, WatchHub};
