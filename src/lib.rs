pub mod claim;
pub mod client;
pub mod collector;
pub mod command;
pub mod config;
pub mod context;
pub mod daemon;
pub mod dashboard;
pub mod error;
pub mod event;
pub mod manager;
pub mod negotiator;
pub mod policy;
pub mod shutdown;
pub mod slot;
pub mod starter;
pub mod timer;

#[cfg(test)]
mod test_support;
