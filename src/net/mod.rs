//! Network observation and adaptive strategy

mod observer;
mod strategy;

pub use observer::{LinkClass, NetworkObserver, NetworkSnapshot};
pub use strategy::{AdaptiveStrategy, QualityLevel, RetryPolicy, Strategy};
