// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Recording `DeltaSink` for testing.
//!
//! Records every upsert, delete and close for assertions. Can be switched
//! into a failing mode to simulate a transport outage.

use alt_replication::error::AltError;
use alt_replication::transport::{BoxFuture, DeltaSink, TransportKind};
use alt_replication::{DeleteKey, PlayerData};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub struct MockSink {
    kind: TransportKind,
    failing: AtomicBool,
    upserts: Mutex<Vec<PlayerData>>,
    deletes: Mutex<Vec<DeleteKey>>,
    closes: AtomicUsize,
}

impl MockSink {
    pub fn new(kind: TransportKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            failing: AtomicBool::new(false),
            upserts: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        })
    }

    /// Fail every publish and close until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn upserts(&self) -> Vec<PlayerData> {
        self.upserts.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<DeleteKey> {
        self.deletes.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn outage(&self) -> AltError {
        match self.kind {
            TransportKind::CachePubSub => AltError::redis_msg("PUBLISH", "simulated outage"),
            TransportKind::BrokerFanout => AltError::broker_msg("basic_publish", "simulated outage"),
        }
    }
}

impl DeltaSink for MockSink {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn publish_upsert<'a>(&'a self, record: &'a PlayerData) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(self.outage());
            }
            self.upserts.lock().unwrap().push(record.clone());
            Ok(())
        })
    }

    fn publish_delete<'a>(&'a self, key: &'a DeleteKey) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(self.outage());
            }
            self.deletes.lock().unwrap().push(key.clone());
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        !self.failing.load(Ordering::SeqCst)
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(self.outage());
            }
            Ok(())
        })
    }
}
