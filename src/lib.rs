pub mod cli;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod params;
pub mod probe;
pub mod ratelimit;
pub mod report;
pub mod request;
pub mod scheduler;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;
