use crate::core::alerts::{OpsAlert, OpsNotifier};
use async_trait::async_trait;
use std::error::Error;

/// Writes alerts to the log. Used when no webhook is configured.
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl OpsNotifier for TracingNotifier {
    async fn notify(&self, alert: &OpsAlert) -> Result<(), Box<dyn Error + Send + Sync>> {
        tracing::warn!(alert = alert.title(), "{}", alert.summary());
        Ok(())
    }
}
