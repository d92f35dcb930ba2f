//! Bounded per-metric history with background persistence
//!
//! Appends happen in memory under a lock and return immediately; the full
//! buffer is then queued for the persistence worker. Readers get copies, so a
//! snapshot taken while telemetry keeps arriving is always consistent.

use super::persistence_worker::{PersistenceManager, SeriesAction};
use super::PersistError;
use crate::telemetry::codec::Reading;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Fixed-capacity FIFO of readings for one metric
#[derive(Clone, Debug, PartialEq)]
pub struct SeriesBuffer {
    key: String,
    capacity: usize,
    points: VecDeque<Reading>,
}

impl SeriesBuffer {
    pub fn new(key: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            key: key.into(),
            capacity,
            points: VecDeque::with_capacity(capacity),
        }
    }

    /// Appends at the tail and returns the evicted oldest point, if any.
    pub fn push(&mut self, reading: Reading) -> Option<Reading> {
        let evicted = if self.points.len() >= self.capacity {
            self.points.pop_front()
        } else {
            None
        };
        self.points.push_back(reading);
        evicted
    }

    /// Replaces the content, keeping only the newest `capacity` points.
    pub fn restore(&mut self, points: Vec<Reading>) {
        let skip = points.len().saturating_sub(self.capacity);
        self.points = points.into_iter().skip(skip).collect();
    }

    /// Changes the capacity, dropping the oldest points if it shrinks.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.points.len() > self.capacity {
            self.points.pop_front();
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Reading> {
        self.points.iter().cloned().collect()
    }
}

/// Shared store of all series; clones refer to the same buffers.
#[derive(Clone)]
pub struct SeriesStore {
    buffers: Arc<RwLock<HashMap<String, SeriesBuffer>>>,
    default_capacity: usize,
    persistence: UnboundedSender<SeriesAction>,
    _manager: Arc<PersistenceManager>,
}

impl SeriesStore {
    /// Opens the store over `dir`; files are created on first append.
    pub fn open(dir: PathBuf, default_capacity: usize) -> Self {
        let manager = PersistenceManager::new(dir);
        Self {
            buffers: Arc::new(RwLock::new(HashMap::new())),
            default_capacity: default_capacity.max(1),
            persistence: manager.get_sender(),
            _manager: Arc::new(manager),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, SeriesBuffer>> {
        self.buffers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, SeriesBuffer>> {
        self.buffers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the capacity of `key`, creating an empty buffer if needed.
    pub fn set_capacity(&self, key: &str, capacity: usize) {
        let mut buffers = self.write();
        buffers
            .entry(key.to_string())
            .and_modify(|b| b.resize(capacity))
            .or_insert_with(|| SeriesBuffer::new(key, capacity));
    }

    pub fn capacity(&self, key: &str) -> usize {
        self.read()
            .get(key)
            .map(SeriesBuffer::capacity)
            .unwrap_or(self.default_capacity)
    }

    /// Appends `reading` and queues the whole buffer for persistence.
    pub fn append(&self, key: &str, reading: Reading) {
        let mut buffers = self.write();
        let buffer = buffers
            .entry(key.to_string())
            .or_insert_with(|| SeriesBuffer::new(key, self.default_capacity));
        if let Some(evicted) = buffer.push(reading) {
            debug!("Series {} full, evicted {}", buffer.key(), evicted);
        }
        // queued under the lock so saves reach the worker in append order
        self.persist(key, buffer.to_vec());
    }

    /// Restores `key` from storage. Absent or unreadable data yields an
    /// empty series; startup never fails because of it.
    pub async fn load(&self, key: &str) -> Vec<Reading> {
        let points = match self.request_load(key).await {
            Ok(points) => points,
            Err(e) => {
                warn!("Ignoring stored series {}: {}", key, e);
                Vec::new()
            }
        };

        let mut buffers = self.write();
        let buffer = buffers
            .entry(key.to_string())
            .or_insert_with(|| SeriesBuffer::new(key, self.default_capacity));
        buffer.restore(points);
        buffer.to_vec()
    }

    async fn request_load(&self, key: &str) -> Result<Vec<Reading>, PersistError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.persistence
            .send(SeriesAction::Load {
                key: key.to_string(),
                response_tx,
            })
            .map_err(|_| PersistError::WorkerGone)?;
        response_rx.await.map_err(|_| PersistError::WorkerGone)?
    }

    /// Copy of the series in arrival order
    pub fn snapshot(&self, key: &str) -> Vec<Reading> {
        self.read()
            .get(key)
            .map(SeriesBuffer::to_vec)
            .unwrap_or_default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Empties `key` in memory and in storage.
    pub fn clear(&self, key: &str) {
        let mut buffers = self.write();
        if let Some(buffer) = buffers.get_mut(key) {
            buffer.restore(Vec::new());
        }
        self.persist(key, Vec::new());
    }

    /// Waits until every persist queued so far has been written.
    pub async fn flush(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .persistence
            .send(SeriesAction::Flush { response_tx })
            .is_err()
            || response_rx.await.is_err()
        {
            warn!("Persistence worker gone, nothing flushed");
        }
    }

    fn persist(&self, key: &str, points: Vec<Reading>) {
        let action = SeriesAction::Save {
            key: key.to_string(),
            points,
        };
        if self.persistence.send(action).is_err() {
            warn!("Persistence worker gone, series {} kept in memory only", key);
        }
    }
}
