pub mod checkpoint;
pub mod config;
pub mod error;
pub mod launcher;
pub mod model;
pub mod queue;
pub mod reconciler;
pub mod replay;
pub mod runner;
pub mod server;
pub mod session;
pub mod storage;
pub mod timeline;

pub use error::{CoreError, CoreResult};
