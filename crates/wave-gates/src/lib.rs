pub mod command;
pub mod discover;
pub mod error;
pub mod report;
pub mod runner;
pub mod types;

pub use command::*;
pub use discover::*;
pub use error::*;
pub use report::*;
pub use runner::*;
pub use types::*;
