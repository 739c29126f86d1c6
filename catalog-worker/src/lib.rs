pub mod config;
pub mod janitor;

pub use config::Config;
pub use janitor::{purge_expired, start_janitor_task};
