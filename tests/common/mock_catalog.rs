//! Scripted catalog session.
//!
//! Answers `connect` and `log_on` immediately, replays queued changes
//! responses one per request, and synthesizes product info for every
//! requested id. Every call is recorded for assertions.

use catalog_pipeline::broker::BoxFuture;
use catalog_pipeline::poller::{
    CatalogEvent, CatalogSession, ChangesResponse, LogOnDetails, ProductInfo, ProductInfoRequest,
    ProductInfoResponse,
};
use catalog_pipeline::PipelineError;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One call made by the poller.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogCall {
    Connect,
    LogOn(LogOnDetails),
    ChangesSince(u32),
    ProductInfo(ProductInfoRequest),
    Disconnect,
}

pub struct MockCatalog {
    events: mpsc::Sender<CatalogEvent>,
    calls: Mutex<Vec<CatalogCall>>,
    changes: Mutex<VecDeque<ChangesResponse>>,
    unknown: Mutex<HashSet<u32>>,
    reject_logons: AtomicUsize,
    fail_requests: AtomicUsize,
}

impl MockCatalog {
    /// Session plus the receiver the poller should read from.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<CatalogEvent>) {
        let (events, rx) = mpsc::channel(1024);
        let mock = Arc::new(Self {
            events,
            calls: Mutex::new(Vec::new()),
            changes: Mutex::new(VecDeque::new()),
            unknown: Mutex::new(HashSet::new()),
            reject_logons: AtomicUsize::new(0),
            fail_requests: AtomicUsize::new(0),
        });
        (mock, rx)
    }

    /// Queue the answer to the next changes request.
    pub fn push_changes(&self, response: ChangesResponse) {
        self.changes.lock().unwrap().push_back(response);
    }

    /// Report `id` as unknown in product info responses.
    pub fn mark_unknown(&self, id: u32) {
        self.unknown.lock().unwrap().insert(id);
    }

    /// Reject the next `n` logons.
    pub fn reject_next_logons(&self, n: usize) {
        self.reject_logons.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` product info requests fail to send.
    pub fn fail_next_requests(&self, n: usize) {
        self.fail_requests.store(n, Ordering::SeqCst);
    }

    /// Push an arbitrary event, as the upstream would.
    pub async fn emit(&self, event: CatalogEvent) {
        let _ = self.events.send(event).await;
    }

    pub fn calls(&self) -> Vec<CatalogCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.calls().iter().filter(|c| **c == CatalogCall::Connect).count()
    }

    pub fn change_requests(&self) -> Vec<u32> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                CatalogCall::ChangesSince(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    pub fn product_requests(&self) -> Vec<ProductInfoRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                CatalogCall::ProductInfo(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn last_log_on(&self) -> Option<LogOnDetails> {
        self.calls().into_iter().rev().find_map(|c| match c {
            CatalogCall::LogOn(details) => Some(details),
            _ => None,
        })
    }

    fn record(&self, call: CatalogCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn describe(&self, ids: &[u32]) -> (Vec<ProductInfo>, Vec<u32>) {
        let unknown = self.unknown.lock().unwrap();
        let mut found = Vec::new();
        let mut missing = Vec::new();
        for id in ids {
            if unknown.contains(id) {
                missing.push(*id);
            } else {
                found.push(ProductInfo {
                    id: *id,
                    change_number: 1,
                    payload: serde_json::json!({ "id": id }),
                });
            }
        }
        (found, missing)
    }
}

impl CatalogSession for MockCatalog {
    fn connect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.record(CatalogCall::Connect);
            self.emit(CatalogEvent::Connected).await;
            Ok(())
        })
    }

    fn log_on(&self, details: LogOnDetails) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.record(CatalogCall::LogOn(details));
            if Self::take_one(&self.reject_logons) {
                self.emit(CatalogEvent::LogOnFailed {
                    reason: "InvalidPassword".to_string(),
                })
                .await;
            } else {
                self.emit(CatalogEvent::LoggedOn).await;
            }
            Ok(())
        })
    }

    fn request_changes_since(&self, change_number: u32) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.record(CatalogCall::ChangesSince(change_number));
            let next = self.changes.lock().unwrap().pop_front();
            if let Some(mut response) = next {
                response.since_change_number = change_number;
                self.emit(CatalogEvent::Changes(response)).await;
            }
            Ok(())
        })
    }

    fn request_product_info(&self, request: ProductInfoRequest) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if Self::take_one(&self.fail_requests) {
                return Err(PipelineError::catalog("request_product_info", "session not ready"));
            }
            self.record(CatalogCall::ProductInfo(request.clone()));
            let (apps, unknown_apps) = self.describe(&request.apps);
            let (packages, unknown_packages) = self.describe(&request.packages);
            self.emit(CatalogEvent::ProductInfo(ProductInfoResponse {
                apps,
                packages,
                unknown_apps,
                unknown_packages,
            }))
            .await;
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.record(CatalogCall::Disconnect);
            Ok(())
        })
    }
}
