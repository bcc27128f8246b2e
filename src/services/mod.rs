pub mod breaker;
pub mod credits;
pub mod dead_letter;
pub mod generation;
pub mod notifier;
pub mod recovery;
pub mod stats;
pub mod storage;
pub mod telemetry;
pub mod worker;
