// Operator notification targets.

pub mod tracing_notifier;
pub mod webhook_notifier;

pub use tracing_notifier::TracingNotifier;
pub use webhook_notifier::WebhookNotifier;
