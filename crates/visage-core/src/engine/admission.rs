//! Bounded-concurrency admission control.
//!
//! The controller enforces the global budget `N` on concurrently running
//! pipelines and owns the FCFS waiting queue behind it. Its counter is the
//! single source of truth for how many pipelines may run; no component
//! invokes a compute stage without holding a slot granted here. All
//! mutations are serialized behind one mutex; this is the only state shared
//! across jobs.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::types::{JobEvent, RequestId};
use crate::error::{Error, Result};

/// Outcome of an admission attempt.
pub enum Admission {
    /// A slot was free; the job may start immediately.
    Admitted,
    /// All slots busy; the job holds a queue position and a ticket that
    /// resolves when a slot is handed to it.
    Queued {
        position: usize,
        ticket: oneshot::Receiver<()>,
    },
}

struct QueuedJob {
    id: RequestId,
    ticket: oneshot::Sender<()>,
    events: mpsc::UnboundedSender<JobEvent>,
}

struct Inner {
    running: HashSet<RequestId>,
    waiting: VecDeque<QueuedJob>,
}

/// FCFS admission gate shared by every session.
pub struct AdmissionController {
    capacity: usize,
    max_queue_depth: usize,
    inner: Mutex<Inner>,
}

impl AdmissionController {
    pub fn new(capacity: usize, max_queue_depth: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            max_queue_depth,
            inner: Mutex::new(Inner {
                running: HashSet::new(),
                waiting: VecDeque::new(),
            }),
        }
    }

    /// Admit the job now, queue it in arrival order, or reject it when the
    /// queue is full. Positions are 1-based.
    pub fn try_admit(
        &self,
        id: &RequestId,
        events: mpsc::UnboundedSender<JobEvent>,
    ) -> Result<Admission> {
        let mut inner = self.inner.lock().unwrap();

        if inner.running.len() < self.capacity {
            inner.running.insert(id.clone());
            debug!(request_id = %id, active = inner.running.len(), "job admitted");
            return Ok(Admission::Admitted);
        }

        if inner.waiting.len() >= self.max_queue_depth {
            return Err(Error::Capacity(format!(
                "queue full ({} waiting)",
                inner.waiting.len()
            )));
        }

        let (tx, rx) = oneshot::channel();
        inner.waiting.push_back(QueuedJob {
            id: id.clone(),
            ticket: tx,
            events,
        });
        let position = inner.waiting.len();
        debug!(request_id = %id, position, "job queued");

        Ok(Admission::Queued {
            position,
            ticket: rx,
        })
    }

    /// Free the slot held by `id` and hand it to the queue head, if any.
    /// Remaining queued jobs are told their new position.
    pub fn release(&self, id: &RequestId) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.running.remove(id) {
            return;
        }
        debug!(request_id = %id, "slot released");

        while let Some(next) = inner.waiting.pop_front() {
            let next_id = next.id;
            if next.ticket.send(()).is_ok() {
                debug!(request_id = %next_id, "job promoted from queue");
                inner.running.insert(next_id);
                break;
            }
            // ticket receiver gone: the job was cancelled while queued
        }

        Self::broadcast_positions(&inner);
    }

    /// Drop a still-queued job. Returns false if it was not in the queue
    /// (already promoted, or never queued).
    pub fn remove_queued(&self, id: &RequestId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.waiting.len();
        inner.waiting.retain(|queued| &queued.id != id);
        let removed = inner.waiting.len() != before;
        if removed {
            debug!(request_id = %id, "job removed from queue");
            Self::broadcast_positions(&inner);
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().running.len()
    }

    pub fn queued_count(&self) -> usize {
        self.inner.lock().unwrap().waiting.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn broadcast_positions(inner: &Inner) {
        for (idx, queued) in inner.waiting.iter().enumerate() {
            let _ = queued.events.send(JobEvent::Queued { position: idx + 1 });
        }
    }
}
