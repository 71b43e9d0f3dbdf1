//! Outbound transfer subsystem — an external collaborator contract.
//!
//! `submit_transfer` is fire-and-forget from the rule engine's
//! perspective: failures surface later as lock state updates driven by
//! the transfer subsystem's own callback path, not as a return value
//! here.

use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait TransferSubmitter: Send + Sync {
    async fn submit_transfer(
        &self,
        scope: &str,
        name: &str,
        destination_rse: &str,
        metadata: &Value,
    );
}

/// Reference implementation: drops every request. Useful for tests that
/// only assert on lock/rule state, not on transfer submission.
pub struct NullTransferSubmitter;

#[async_trait]
impl TransferSubmitter for NullTransferSubmitter {
    async fn submit_transfer(&self, _scope: &str, _name: &str, _destination_rse: &str, _metadata: &Value) {}
}

/// Test double that records every call for assertions.
#[derive(Default)]
pub struct RecordingTransferSubmitter {
    pub calls: parking_lot::Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl TransferSubmitter for RecordingTransferSubmitter {
    async fn submit_transfer(&self, scope: &str, name: &str, destination_rse: &str, _metadata: &Value) {
        self.calls.lock().push((
            scope.to_string(),
            name.to_string(),
            destination_rse.to_string(),
        ));
    }
}
