use super::{series_path, PersistError, SeriesFile};
use crate::telemetry::codec::Reading;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

macro_rules! handle_action {
    ($action:expr, $response_tx:expr) => {
        if let Err(_) = $response_tx.send($action.await) {
            error!("Failed to send response");
        }
    };
}

// Requests served by the persistence worker
#[derive(Debug)]
pub enum SeriesAction {
    Save {
        key: String,
        points: Vec<Reading>,
    },
    Load {
        key: String,
        response_tx: oneshot::Sender<Result<Vec<Reading>, PersistError>>,
    },
    /// Answers once every action queued before it is done
    Flush {
        response_tx: oneshot::Sender<()>,
    },
}

/// Owns the series directory; actions are handled one at a time in order.
pub struct PersistenceManager {
    tx: UnboundedSender<SeriesAction>,
    worker_handle: tokio::task::JoinHandle<()>,
}

impl PersistenceManager {
    pub fn new(dir: PathBuf) -> Self {
        let (tx, mut rx) = unbounded_channel::<SeriesAction>();
        info!("Series storage at {}", dir.display());
        let handle = tokio::spawn(async move {
            while let Some(action) = rx.recv().await {
                match action {
                    SeriesAction::Save { key, points } => {
                        if let Err(e) = save_series(&dir, &key, points).await {
                            error!("Failed to persist series {}: {}", key, e);
                        }
                    }
                    SeriesAction::Load { key, response_tx } => {
                        handle_action!(load_series(&dir, &key), response_tx);
                    }
                    SeriesAction::Flush { response_tx } => {
                        let _ = response_tx.send(());
                    }
                }
            }
            debug!("Persistence worker stopped");
        });

        Self {
            tx,
            worker_handle: handle,
        }
    }

    pub fn get_sender(&self) -> UnboundedSender<SeriesAction> {
        self.tx.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.worker_handle.is_finished()
    }
}

async fn save_series(dir: &Path, key: &str, points: Vec<Reading>) -> Result<(), PersistError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| PersistError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

    let path = series_path(dir, key);
    let content = toml::to_string_pretty(&SeriesFile {
        key: key.to_string(),
        points,
    })?;

    // write a sibling file, then rename it over the old one
    let tmp_path = path.with_extension("toml.tmp");
    tokio::fs::write(&tmp_path, content)
        .await
        .map_err(|source| PersistError::Io {
            path: tmp_path.clone(),
            source,
        })?;
    tokio::fs::rename(&tmp_path, &path)
        .await
        .map_err(|source| PersistError::Io {
            path: path.clone(),
            source,
        })?;

    debug!("Series {} saved to {}", key, path.display());
    Ok(())
}

async fn load_series(dir: &Path, key: &str) -> Result<Vec<Reading>, PersistError> {
    let path = series_path(dir, key);

    if !tokio::fs::try_exists(&path)
        .await
        .map_err(|source| PersistError::Io {
            path: path.clone(),
            source,
        })?
    {
        debug!("No stored series {}, starting empty", key);
        return Ok(Vec::new());
    }

    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|source| PersistError::Io {
            path: path.clone(),
            source,
        })?;

    let file: SeriesFile = toml::from_str(&content).map_err(|e| PersistError::Corrupt {
        path: path.clone(),
        reason: e.to_string(),
    })?;

    if file.key != key {
        warn!(
            "Series file {} belongs to {:?}, expected {:?}",
            path.display(),
            file.key,
            key
        );
    }
    Ok(file.points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn load(
        tx: &UnboundedSender<SeriesAction>,
        key: &str,
    ) -> Result<Vec<Reading>, PersistError> {
        let (response_tx, response_rx) = oneshot::channel();
        tx.send(SeriesAction::Load {
            key: key.to_string(),
            response_tx,
        })
        .unwrap();
        response_rx.await.unwrap()
    }

    #[tokio::test]
    async fn saves_are_applied_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let manager = PersistenceManager::new(temp_dir.path().to_path_buf());
        let tx = manager.get_sender();

        for i in 0..5 {
            tx.send(SeriesAction::Save {
                key: "petWeight".to_string(),
                points: (0..=i).map(|n| Reading::new("08:00", n as f64)).collect(),
            })
            .unwrap();
        }

        let points = load(&tx, "petWeight").await.unwrap();
        assert_eq!(points.len(), 5);
        assert_eq!(points.last().unwrap().value, 4.0);
        assert!(manager.is_running());
        assert!(!series_path(temp_dir.path(), "petWeight")
            .with_extension("toml.tmp")
            .exists());
    }

    #[tokio::test]
    async fn missing_series_loads_empty() {
        let temp_dir = TempDir::new().unwrap();
        let manager = PersistenceManager::new(temp_dir.path().join("not-created-yet"));

        let points = load(&manager.get_sender(), "waterLevel").await.unwrap();
        assert!(points.is_empty());
    }

    #[tokio::test]
    async fn corrupt_series_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(series_path(temp_dir.path(), "petWeight"), "points = [1, 2").unwrap();
        let manager = PersistenceManager::new(temp_dir.path().to_path_buf());

        let result = load(&manager.get_sender(), "petWeight").await;
        assert!(matches!(result, Err(PersistError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn unwritable_directory_does_not_stop_the_worker() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("file");
        std::fs::write(&blocker, "not a directory").unwrap();
        let manager = PersistenceManager::new(blocker.join("series"));
        let tx = manager.get_sender();

        tx.send(SeriesAction::Save {
            key: "petWeight".to_string(),
            points: vec![Reading::new("08:00", 1.0)],
        })
        .unwrap();
        let (response_tx, response_rx) = oneshot::channel();
        tx.send(SeriesAction::Flush { response_tx }).unwrap();
        response_rx.await.unwrap();

        assert!(manager.is_running());
    }
}
