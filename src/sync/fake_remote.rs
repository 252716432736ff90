//! In-process remote authority for tests
//!
//! Answers every batch with success for each entity unless a scripted
//! response is queued. Records requests and the peak number of concurrent
//! batch calls.

use super::api::{RemoteAuthority, SyncApiError};
use super::models::{BatchSyncRequest, BatchSyncResponse, ItemStatus, ProcessedItem};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

type BatchHook = Box<dyn Fn(&BatchSyncRequest) + Send + Sync>;

/// Leaves the in-flight count on drop, including when the call is cancelled
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct FakeRemote {
    reachable: AtomicBool,
    batch_delay: Option<Duration>,
    health_delay: Option<Duration>,
    scripted: Mutex<VecDeque<Result<BatchSyncResponse, SyncApiError>>>,
    requests: Mutex<Vec<BatchSyncRequest>>,
    hook: Mutex<Option<BatchHook>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeRemote {
    pub(crate) fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            batch_delay: None,
            health_delay: None,
            scripted: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            hook: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub(crate) fn unreachable(self) -> Self {
        self.reachable.store(false, Ordering::SeqCst);
        self
    }

    pub(crate) fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = Some(delay);
        self
    }

    pub(crate) fn with_health_delay(mut self, delay: Duration) -> Self {
        self.health_delay = Some(delay);
        self
    }

    pub(crate) fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Queue the answer for the next batch call
    pub(crate) fn respond_with(&self, response: Result<BatchSyncResponse, SyncApiError>) {
        self.scripted.lock().unwrap().push_back(response);
    }

    /// Run `hook` at the start of every batch call
    pub(crate) fn on_batch(&self, hook: impl Fn(&BatchSyncRequest) + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub(crate) fn requests(&self) -> Vec<BatchSyncRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn batch_calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn echo_success(request: &BatchSyncRequest) -> BatchSyncResponse {
        let mut processed_items: Vec<ProcessedItem> = Vec::new();
        for item in &request.items {
            if processed_items.iter().any(|p| p.client_id == item.entity_id) {
                continue;
            }
            processed_items.push(ProcessedItem {
                client_id: item.entity_id.clone(),
                status: ItemStatus::Success,
                server_id: Some(format!("srv-{}", item.entity_id)),
                error: None,
            });
        }
        BatchSyncResponse { processed_items }
    }
}

#[async_trait]
impl RemoteAuthority for FakeRemote {
    async fn batch_sync(&self, request: &BatchSyncRequest) -> Result<BatchSyncResponse, SyncApiError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        self.requests.lock().unwrap().push(request.clone());
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(request);
        }

        if let Some(delay) = self.batch_delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.scripted.lock().unwrap().pop_front();

        scripted.unwrap_or_else(|| Ok(Self::echo_success(request)))
    }

    async fn health_check(&self) -> Result<(), SyncApiError> {
        if let Some(delay) = self.health_delay {
            tokio::time::sleep(delay).await;
        }

        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncApiError::ServerError("503 Service Unavailable".to_string()))
        }
    }
}
