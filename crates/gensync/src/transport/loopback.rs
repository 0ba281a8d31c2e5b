// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process loopback mesh.
//!
//! Wires several [`Runtime`] instances together inside one process, with a
//! FIFO queue per destination node. Messages are encoded to their wire
//! form and decoded again on delivery, so the loopback path exercises the
//! same codec as a real transport.
//!
//! Delivery is pull-based: nothing moves until [`LoopbackMesh::pump`] runs
//! (deterministic tests), or a background pump thread is spawned with
//! [`LoopbackMesh::spawn_pump`] (blocking-wait tests).

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;

use super::{Error, Payload, Result, Transport};
use crate::core::NodeId;
use crate::protocol::Message;
use crate::runtime::Runtime;

struct Envelope {
    src: NodeId,
    header: Vec<u8>,
    payload: Payload,
}

struct MeshShared {
    queues: DashMap<NodeId, (Sender<Envelope>, Receiver<Envelope>)>,
    runtimes: DashMap<NodeId, Weak<Runtime>>,
    next_node: AtomicU16,
}

/// An in-process mesh of runtimes connected by FIFO queues.
pub struct LoopbackMesh {
    shared: Arc<MeshShared>,
}

impl LoopbackMesh {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(MeshShared {
                queues: DashMap::new(),
                runtimes: DashMap::new(),
                next_node: AtomicU16::new(0),
            }),
        }
    }

    /// Create a mesh with `count` nodes already attached.
    #[must_use]
    pub fn with_nodes(count: usize) -> (Self, Vec<Arc<Runtime>>) {
        let mesh = Self::new();
        let nodes = (0..count).map(|_| mesh.add_node()).collect();
        (mesh, nodes)
    }

    /// Attach a new runtime to the mesh and return it.
    pub fn add_node(&self) -> Arc<Runtime> {
        let node = self.shared.next_node.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded();
        self.shared.queues.insert(node, (tx, rx));

        let transport = Arc::new(LoopbackTransport {
            shared: Arc::clone(&self.shared),
            src: node,
        });
        let rt = Runtime::new(node, transport);
        self.shared.runtimes.insert(node, Arc::downgrade(&rt));
        rt
    }

    /// Deliver queued messages until every queue is empty.
    ///
    /// Returns the number of messages delivered. Handlers may send further
    /// messages; the sweep repeats until a full pass moves nothing.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        loop {
            // Snapshot the receivers first: handlers send through the same
            // queue map, and dispatching under an iteration guard would
            // deadlock on the shard lock.
            let queues: Vec<(NodeId, Receiver<Envelope>)> = self
                .shared
                .queues
                .iter()
                .map(|entry| (*entry.key(), entry.value().1.clone()))
                .collect();

            let before = delivered;
            for (dst, rx) in queues {
                while let Ok(envelope) = rx.try_recv() {
                    self.dispatch(dst, envelope);
                    delivered += 1;
                }
            }
            if delivered == before {
                return delivered;
            }
        }
    }

    /// Spawn a background thread that pumps the mesh until the returned
    /// handle is dropped. Used by tests that block in `wait`.
    #[must_use]
    pub fn spawn_pump(&self) -> PumpHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let mesh = LoopbackMesh {
            shared: Arc::clone(&self.shared),
        };
        let stop_flag = Arc::clone(&stop);
        let thread = thread::spawn(move || {
            while !stop_flag.load(Ordering::Acquire) {
                if mesh.pump() == 0 {
                    thread::sleep(Duration::from_millis(1));
                }
            }
        });
        PumpHandle {
            stop,
            thread: Some(thread),
        }
    }

    fn dispatch(&self, dst: NodeId, envelope: Envelope) {
        let Some(rt) = self
            .shared
            .runtimes
            .get(&dst)
            .and_then(|weak| weak.upgrade())
        else {
            log::warn!(target: "transport", "dropping message for detached node {dst}");
            return;
        };

        let msg = match Message::decode(&envelope.header) {
            Ok(msg) => msg,
            Err(err) => {
                log::error!(target: "transport", "undecodable message for node {dst}: {err}");
                return;
            }
        };

        if let Err(err) = rt.handle_message(envelope.src, msg, envelope.payload.bytes()) {
            log::error!(target: "transport", "handler failed on node {dst}: {err}");
        }
    }
}

impl Default for LoopbackMesh {
    fn default() -> Self {
        Self::new()
    }
}

/// Stops the background pump thread when dropped.
pub struct PumpHandle {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Drop for PumpHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct LoopbackTransport {
    shared: Arc<MeshShared>,
    src: NodeId,
}

impl Transport for LoopbackTransport {
    fn send(&self, dst: NodeId, msg: Message, payload: Payload) -> Result<()> {
        let tx = {
            let queue = self.shared.queues.get(&dst).ok_or(Error::NoRoute(dst))?;
            queue.value().0.clone()
        };
        tx.send(Envelope {
            src: self.src,
            header: msg.encode(),
            payload,
        })
        .map_err(|_| Error::Closed)
    }
}
