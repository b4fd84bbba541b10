pub mod bot;
pub mod channel;
pub mod config;
pub mod counter;
pub mod detector;
pub mod export;
pub mod format;
pub mod protocol;
pub mod store;
pub mod timer;
