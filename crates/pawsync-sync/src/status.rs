use pawsync_core::{PersistenceError, Shelter, SyncRun, SyncStatus};
use pawsync_storage::RelationalStore;

#[derive(Debug, Clone)]
pub struct ShelterStatus {
    pub shelter: Shelter,
    /// `None` until the shelter has been synced at least once.
    pub status: Option<SyncStatus>,
    pub latest_run: Option<SyncRun>,
}

/// Status of every registered shelter, derived from its most recent run.
pub async fn shelter_statuses(
    store: &dyn RelationalStore,
) -> Result<Vec<ShelterStatus>, PersistenceError> {
    let mut out = Vec::new();
    for shelter in store.list_shelters().await? {
        let latest_run = store.latest_sync_run(shelter.id).await?;
        out.push(ShelterStatus {
            status: latest_run.as_ref().map(SyncRun::status),
            shelter,
            latest_run,
        });
    }
    Ok(out)
}

impl ShelterStatus {
    pub fn summary_line(&self) -> String {
        let status = self.status.map_or("never", |s| s.as_str());
        match &self.latest_run {
            Some(run) => {
                let mut line = format!(
                    "{:<24} {:<8} started={} +{} ~{} -{}",
                    self.shelter.slug,
                    status,
                    run.started_at.format("%Y-%m-%d %H:%M"),
                    run.dogs_added,
                    run.dogs_updated,
                    run.dogs_removed,
                );
                if let Some(message) = &run.error_message {
                    line.push_str(&format!(" error=\"{message}\""));
                } else if let Some(first) = run.errors.first() {
                    line.push_str(&format!(" errors={} first=\"{first}\"", run.errors.len()));
                }
                line
            }
            None => format!("{:<24} {status}", self.shelter.slug),
        }
    }
}
