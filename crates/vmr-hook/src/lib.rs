pub mod command;
pub mod error;
pub mod macros;
pub mod runner;
pub mod types;

pub use command::*;
pub use error::*;
pub use macros::*;
pub use runner::*;
pub use types::*;
