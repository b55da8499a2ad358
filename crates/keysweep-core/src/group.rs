//! Process-group capability.
//!
//! A process group is the fixed set of cooperating peers. The executor only
//! needs membership (peer count and id), a small broadcast used to agree on
//! device selection, abort, and finalize. Two implementations ship here:
//!
//! - [`SoloGroup`]: a group of one, for single-process runs.
//! - [`LocalGroup`]: several peers inside one process, connected by a tokio
//!   broadcast channel. Used for tests and for running several executors on
//!   one host.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

/// Errors from process-group operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GroupError {
    /// Operation requires a joined group.
    #[error("not joined to the process group")]
    NotJoined,

    /// `join` was called twice.
    #[error("already joined to the process group")]
    AlreadyJoined,

    /// Root peer id outside the group.
    #[error("invalid root {root} for a group of {size}")]
    InvalidRoot {
        /// Requested root.
        root: u32,
        /// Group size.
        size: u32,
    },

    /// Broadcast payload length differs between peers.
    #[error("broadcast payload mismatch: expected {expected} words, got {got}")]
    PayloadMismatch {
        /// Local buffer length.
        expected: usize,
        /// Received length.
        got: usize,
    },

    /// A peer aborted the group.
    #[error("process group aborted by peer {peer} with code {code}")]
    Aborted {
        /// Peer that aborted.
        peer: u32,
        /// Abort code.
        code: i32,
    },

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type for process-group operations.
pub type GroupResult<T> = std::result::Result<T, GroupError>;

/// Membership in a fixed group of cooperating peers.
#[async_trait]
pub trait ProcessGroup: Send + Sync {
    /// Join the group.
    async fn join(&mut self) -> GroupResult<()>;

    /// Number of peers in the group.
    fn peer_count(&self) -> GroupResult<u32>;

    /// This process's zero-based peer id.
    fn peer_id(&self) -> GroupResult<u32>;

    /// Broadcast `data` from `root` to every peer.
    ///
    /// On the root, `data` is the payload; on every other peer it is
    /// overwritten with it. Every peer must call this in the same order.
    async fn broadcast(&self, data: &mut [u32], root: u32) -> GroupResult<()>;

    /// Abort the whole group.
    fn abort(&self, code: i32);

    /// Leave the group.
    async fn finalize(&mut self) -> GroupResult<()>;
}

/// A process group containing only this process.
#[derive(Debug, Default)]
pub struct SoloGroup {
    joined: bool,
    aborted: AtomicBool,
}

impl SoloGroup {
    /// Create an unjoined solo group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `abort` has been called.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ProcessGroup for SoloGroup {
    async fn join(&mut self) -> GroupResult<()> {
        if self.joined {
            return Err(GroupError::AlreadyJoined);
        }
        self.joined = true;
        Ok(())
    }

    fn peer_count(&self) -> GroupResult<u32> {
        if self.joined {
            Ok(1)
        } else {
            Err(GroupError::NotJoined)
        }
    }

    fn peer_id(&self) -> GroupResult<u32> {
        if self.joined {
            Ok(0)
        } else {
            Err(GroupError::NotJoined)
        }
    }

    async fn broadcast(&self, _data: &mut [u32], root: u32) -> GroupResult<()> {
        if !self.joined {
            return Err(GroupError::NotJoined);
        }
        if root != 0 {
            return Err(GroupError::InvalidRoot { root, size: 1 });
        }
        Ok(())
    }

    fn abort(&self, code: i32) {
        warn!("Solo process group aborted with code {}", code);
        self.aborted.store(true, Ordering::Release);
    }

    async fn finalize(&mut self) -> GroupResult<()> {
        if !self.joined {
            return Err(GroupError::NotJoined);
        }
        self.joined = false;
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Frame {
    Data { root: u32, payload: Vec<u32> },
    Abort { peer: u32, code: i32 },
}

struct ClusterShared {
    size: u32,
    sender: broadcast::Sender<Frame>,
    aborted: AtomicBool,
    abort_code: AtomicI32,
}

/// One peer of an in-process group.
pub struct LocalGroup {
    id: u32,
    shared: Arc<ClusterShared>,
    receiver: Mutex<broadcast::Receiver<Frame>>,
    joined: bool,
}

impl LocalGroup {
    /// Create `size` connected peers, indexed by peer id.
    pub fn cluster(size: u32) -> Vec<LocalGroup> {
        let size = size.max(1);
        let (sender, _) = broadcast::channel(64);
        let shared = Arc::new(ClusterShared {
            size,
            sender,
            aborted: AtomicBool::new(false),
            abort_code: AtomicI32::new(0),
        });

        // Receivers are subscribed up front so no frame can be missed.
        (0..size)
            .map(|id| LocalGroup {
                id,
                receiver: Mutex::new(shared.sender.subscribe()),
                shared: Arc::clone(&shared),
                joined: false,
            })
            .collect()
    }

    /// Abort code, if any peer aborted the group.
    pub fn abort_code(&self) -> Option<i32> {
        if self.shared.aborted.load(Ordering::Acquire) {
            Some(self.shared.abort_code.load(Ordering::Acquire))
        } else {
            None
        }
    }

    fn check_joined(&self) -> GroupResult<()> {
        if self.joined {
            Ok(())
        } else {
            Err(GroupError::NotJoined)
        }
    }

    async fn next_frame(&self) -> GroupResult<Frame> {
        let mut receiver = self.receiver.lock().await;
        match receiver.recv().await {
            Ok(Frame::Abort { peer, code }) => Err(GroupError::Aborted { peer, code }),
            Ok(frame) => Ok(frame),
            Err(broadcast::error::RecvError::Closed) => {
                Err(GroupError::Transport("group channel closed".to_string()))
            }
            Err(broadcast::error::RecvError::Lagged(n)) => Err(GroupError::Transport(format!(
                "peer {} fell {} frames behind",
                self.id, n
            ))),
        }
    }
}

#[async_trait]
impl ProcessGroup for LocalGroup {
    async fn join(&mut self) -> GroupResult<()> {
        if self.joined {
            return Err(GroupError::AlreadyJoined);
        }
        self.joined = true;
        debug!("Peer {} joined local group of {}", self.id, self.shared.size);
        Ok(())
    }

    fn peer_count(&self) -> GroupResult<u32> {
        self.check_joined()?;
        Ok(self.shared.size)
    }

    fn peer_id(&self) -> GroupResult<u32> {
        self.check_joined()?;
        Ok(self.id)
    }

    async fn broadcast(&self, data: &mut [u32], root: u32) -> GroupResult<()> {
        self.check_joined()?;
        if root >= self.shared.size {
            return Err(GroupError::InvalidRoot {
                root,
                size: self.shared.size,
            });
        }
        if self.shared.aborted.load(Ordering::Acquire) {
            return Err(GroupError::Aborted {
                peer: root,
                code: self.shared.abort_code.load(Ordering::Acquire),
            });
        }

        if self.id == root {
            self.shared
                .sender
                .send(Frame::Data {
                    root,
                    payload: data.to_vec(),
                })
                .map_err(|e| GroupError::Transport(e.to_string()))?;
        }

        // The root consumes its own frame too, keeping every receiver in step.
        match self.next_frame().await? {
            Frame::Data { root: from, payload } if from == root => {
                if payload.len() != data.len() {
                    return Err(GroupError::PayloadMismatch {
                        expected: data.len(),
                        got: payload.len(),
                    });
                }
                data.copy_from_slice(&payload);
                Ok(())
            }
            Frame::Data { root: from, .. } => Err(GroupError::Transport(format!(
                "collective order violated: expected broadcast from {}, got {}",
                root, from
            ))),
            Frame::Abort { peer, code } => Err(GroupError::Aborted { peer, code }),
        }
    }

    fn abort(&self, code: i32) {
        warn!("Peer {} aborting local group with code {}", self.id, code);
        self.shared.abort_code.store(code, Ordering::Release);
        self.shared.aborted.store(true, Ordering::Release);
        let _ = self.shared.sender.send(Frame::Abort {
            peer: self.id,
            code,
        });
    }

    async fn finalize(&mut self) -> GroupResult<()> {
        self.check_joined()?;
        self.joined = false;
        debug!("Peer {} left local group", self.id);
        Ok(())
    }
}
