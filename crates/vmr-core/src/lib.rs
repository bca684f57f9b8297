pub mod cmdline;
pub mod config;
pub mod criteria;
pub mod events;
pub mod placeholder;
pub mod result;
pub mod scenario;
pub mod types;
pub mod validation;

pub use cmdline::*;
pub use config::*;
pub use criteria::*;
pub use events::*;
pub use placeholder::*;
pub use result::*;
pub use scenario::*;
pub use types::*;
pub use validation::*;
