pub mod conflict;
pub mod db;
pub mod error;
pub mod migration;
pub mod models;
pub mod server;
pub mod service;
pub mod sync;
pub mod time;

pub use error::{Error, Result};
