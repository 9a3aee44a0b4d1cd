pub mod config;
pub mod cursor;
pub mod detector;
pub mod error;
pub mod events;
pub mod models;
pub mod notifier;
pub mod poll_loop;
pub mod source;
pub mod watchlist;
