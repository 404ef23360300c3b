pub mod publisher;

pub use publisher::{EventPublisher, NotificationKind, PublishError, WorkflowNotification};
