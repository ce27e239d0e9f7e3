#![forbid(unsafe_code)]

pub mod endpoint;
pub mod secret;
pub mod time;

pub use secret::SecretString;
pub use time::unix_ms_now;
