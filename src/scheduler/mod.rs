//! Background job dispatch

pub mod target_worker;

pub use target_worker::{
    TargetWorkerManager, EMPTY_QUEUE_POLL_INTERVAL, ERROR_RECOVERY_DELAY,
};
