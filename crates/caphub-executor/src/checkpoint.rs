//! Durable run snapshots for crash/lease-loss recovery.

use caphub_contract::error::HubError;
use caphub_contract::run::Run;
use caphub_contract::storage::CheckpointStore;
use caphub_contract::time::current_unix_millis;
use serde::{Deserialize, Serialize};

const KEY_PREFIX: &str = "run/";

/// One durable snapshot of a run. Carries the whole record so a restarted
/// worker can re-dispatch from the snapshot alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub run: Run,
    pub checkpointed_at: u64,
}

impl RunCheckpoint {
    pub fn of(run: Run) -> Self {
        Self {
            run,
            checkpointed_at: current_unix_millis(),
        }
    }
}

pub fn checkpoint_key(run_id: &str) -> String {
    format!("{KEY_PREFIX}{run_id}")
}

/// Write a snapshot.
pub async fn write(store: &dyn CheckpointStore, run: &Run) -> Result<(), HubError> {
    let checkpoint = RunCheckpoint::of(run.clone());
    let blob = serde_json::to_vec(&checkpoint)
        .map_err(|e| HubError::internal(format!("checkpoint encode: {e}")))?;
    store
        .put(&checkpoint_key(&run.run_id), blob)
        .await
        .map_err(HubError::from)
}

/// Read one snapshot back.
pub async fn read(
    store: &dyn CheckpointStore,
    run_id: &str,
) -> Result<Option<RunCheckpoint>, HubError> {
    let Some(blob) = store.get(&checkpoint_key(run_id)).await.map_err(HubError::from)? else {
        return Ok(None);
    };
    let checkpoint = serde_json::from_slice(&blob)
        .map_err(|e| HubError::internal(format!("checkpoint decode: {e}")))?;
    Ok(Some(checkpoint))
}

/// List every checkpointed run id.
pub async fn list_run_ids(store: &dyn CheckpointStore) -> Result<Vec<String>, HubError> {
    let keys = store.list_keys(KEY_PREFIX).await.map_err(HubError::from)?;
    Ok(keys
        .into_iter()
        .filter_map(|k| k.strip_prefix(KEY_PREFIX).map(str::to_string))
        .collect())
}
