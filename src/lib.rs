pub mod config;
pub mod hash;
pub mod humanize;
pub mod ledger;
pub mod messaging;
pub mod observability;
pub mod pipeline;
pub mod protocol;
pub mod queue;
pub mod runtime;
pub mod server;
pub mod task;
pub mod tools;
pub mod worker;
