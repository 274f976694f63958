// Copyright (c) The testament Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::Cache;
use crate::{fingerprint::CacheKey, label::BuildLabel};
use crossbeam_channel::{Receiver, Sender};
use std::{
    hash::{DefaultHasher, Hash, Hasher},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
};
use tracing::{debug, warn};

#[derive(Debug)]
enum CacheRequest {
    Store {
        target: BuildLabel,
        key: CacheKey,
        files: Vec<String>,
    },
    Clean(BuildLabel),
    // Acknowledged once everything queued before it has been handled.
    Flush(Sender<()>),
}

/// Runs stores and cleans of another cache on background threads.
///
/// Each worker has its own queue, and every request for a target goes to the same worker, so
/// requests for one target are handled in the order they were made. [`Cache::clean_all`] waits
/// for all queued work and then runs inline. Retrievals are synchronous, since the caller needs
/// the answer. [`Cache::shutdown`] waits for queued work to finish before shutting down the inner
/// cache.
pub struct AsyncCache {
    inner: Arc<dyn Cache>,
    senders: Mutex<Vec<Sender<CacheRequest>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl AsyncCache {
    /// Wraps `inner`, processing requests on `num_workers` threads.
    pub fn new(inner: impl Into<Arc<dyn Cache>>, num_workers: usize) -> Self {
        let inner = inner.into();

        let mut senders = Vec::with_capacity(num_workers);
        let mut workers = Vec::with_capacity(num_workers);
        for index in 0..num_workers.max(1) {
            let (sender, receiver) = crossbeam_channel::unbounded();
            let inner = Arc::clone(&inner);
            let spawned = std::thread::Builder::new()
                .name(format!("testament-cache-{index}"))
                .spawn(move || worker_loop(&*inner, receiver));
            match spawned {
                Ok(handle) => {
                    senders.push(sender);
                    workers.push(handle);
                }
                Err(error) => warn!("failed to start cache worker thread: {error}"),
            }
        }

        // Without any workers, requests are handled inline.
        Self {
            inner,
            senders: Mutex::new(senders),
            workers: Mutex::new(workers),
            shut_down: AtomicBool::new(false),
        }
    }

    fn submit(&self, target: &BuildLabel, request: CacheRequest) {
        let senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        let request = if senders.is_empty() {
            request
        } else {
            match senders[worker_index(target, senders.len())].send(request) {
                Ok(()) => return,
                // The worker is gone.
                Err(error) => error.into_inner(),
            }
        };
        drop(senders);

        if self.shut_down.load(Ordering::Acquire) {
            debug!("cache already shut down, dropping {request:?}");
            return;
        }
        handle(&*self.inner, request);
    }
}

fn worker_index(target: &BuildLabel, num_workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    target.hash(&mut hasher);
    (hasher.finish() % num_workers as u64) as usize
}

fn worker_loop(inner: &dyn Cache, receiver: Receiver<CacheRequest>) {
    for request in receiver {
        handle(inner, request);
    }
}

fn handle(inner: &dyn Cache, request: CacheRequest) {
    match request {
        CacheRequest::Store { target, key, files } => inner.store(&target, &key, &files),
        CacheRequest::Clean(target) => inner.clean(&target),
        CacheRequest::Flush(ack) => {
            let _ = ack.send(());
        }
    }
}

impl Cache for AsyncCache {
    fn store(&self, target: &BuildLabel, key: &CacheKey, files: &[String]) {
        self.submit(
            target,
            CacheRequest::Store {
                target: target.clone(),
                key: key.clone(),
                files: files.to_vec(),
            },
        );
    }

    fn retrieve(&self, target: &BuildLabel, key: &CacheKey, files: &[String]) -> bool {
        self.inner.retrieve(target, key, files)
    }

    fn clean(&self, target: &BuildLabel) {
        self.submit(target, CacheRequest::Clean(target.clone()));
    }

    fn clean_all(&self) {
        // Holding the lock keeps new requests out until the clean is done.
        let senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        let acks: Vec<_> = senders
            .iter()
            .filter_map(|sender| {
                let (ack, done) = crossbeam_channel::bounded(1);
                sender.send(CacheRequest::Flush(ack)).ok().map(|()| done)
            })
            .collect();
        for done in acks {
            // An error means the worker went away, which is as good as drained.
            let _ = done.recv();
        }
        if senders.is_empty() && self.shut_down.load(Ordering::Acquire) {
            debug!("cache already shut down, dropping clean");
            return;
        }
        self.inner.clean_all();
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        // Dropping the senders ends each worker's loop once its queue is drained.
        drop(std::mem::take(
            &mut *self.senders.lock().unwrap_or_else(PoisonError::into_inner),
        ));
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            if worker.join().is_err() {
                warn!("cache worker thread panicked");
            }
        }
        self.inner.shutdown();
    }
}

impl Drop for AsyncCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}
