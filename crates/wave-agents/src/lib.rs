pub mod error;
pub mod host;
pub mod pty;
pub mod scripted;
pub mod signal;
pub mod template;
pub mod types;

pub use error::*;
pub use host::*;
pub use pty::*;
pub use scripted::*;
pub use signal::*;
pub use template::*;
pub use types::*;
