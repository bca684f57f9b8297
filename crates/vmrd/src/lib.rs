pub mod condition;
pub mod event_log;
pub mod event_sink;
pub mod executor;
pub mod history;
pub mod orchestrator;
pub mod phase;
pub mod registry;
pub mod result_store;
pub mod scenario_store;
pub mod summary;

pub use condition::*;
pub use event_log::*;
pub use event_sink::*;
pub use executor::*;
pub use history::*;
pub use orchestrator::*;
pub use phase::*;
pub use registry::*;
pub use result_store::*;
pub use scenario_store::*;
pub use summary::*;
