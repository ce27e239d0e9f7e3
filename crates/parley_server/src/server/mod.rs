#![forbid(unsafe_code)]

pub mod call_log;
pub mod connection;
pub mod health;
pub mod identity;
