pub mod error;
pub mod mapper;
pub mod notifier;
pub mod sink;
pub mod types;

pub use error::*;
pub use mapper::*;
pub use notifier::*;
pub use sink::*;
pub use types::*;

#[cfg(test)]
mod tests {
    use super::{
        run_error_message, NoopNotifier, NotificationDispatcher, NotificationMessage,
        NotificationSeverity, NotificationTopic, Notifier, NotifyError, SlackSink, StdoutSink,
        TeamsSink, WebhookSink,
    };
    use std::any::TypeId;
    use std::sync::Arc;

    #[test]
    fn crate_root_reexports_types() {
        let _ = TypeId::of::<NotifyError>();
        let _ = TypeId::of::<NotificationMessage>();
        let _ = TypeId::of::<NotificationSeverity>();
        let _ = TypeId::of::<NotificationTopic>();
        let _ = TypeId::of::<NotificationDispatcher>();
        let _ = TypeId::of::<StdoutSink>();
        let _ = TypeId::of::<WebhookSink>();
        let _ = TypeId::of::<SlackSink>();
        let _ = TypeId::of::<TeamsSink>();
    }

    #[test]
    fn crate_root_reexports_helpers_and_trait_objects() {
        let _mapper: fn(&str) -> NotificationMessage = run_error_message;
        let _notifier: Arc<dyn Notifier> = Arc::new(NoopNotifier);
    }
}
