//! Signing Work Offload
//!
//! Key derivation and signing run off the caller's task on a dedicated
//! worker thread. Every submitted job receives a unique id and a oneshot
//! receiver for its reply; ids are never reused and exactly one reply is
//! sent per id.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;

use bitcoin::secp256k1::PublicKey;
use tokio::sync::oneshot;

use crate::error::{SignerError, SignerResult};
use crate::log_warn;
use crate::tx::FinalizedTransaction;

/// Product of a signing job, before result formatting
#[derive(Debug, Clone)]
pub struct SignOutcome {
    /// Signature bytes. DER for ECDSA inputs, 64 bytes for Schnorr.
    pub signature: Vec<u8>,
    /// Public key the signature verifies against
    pub public_key: PublicKey,
    /// Present for transaction requests only
    pub finalized: Option<FinalizedTransaction>,
}

/// Unit of work executed off the engine task
pub type Job = Box<dyn FnOnce() -> SignerResult<SignOutcome> + Send>;

/// Reply delivered through a ticket's receiver
#[derive(Debug)]
pub struct JobReply {
    pub id: u64,
    pub output: SignerResult<SignOutcome>,
}

/// Handle to a submitted job
#[derive(Debug)]
pub struct JobTicket {
    pub id: u64,
    pub reply: oneshot::Receiver<JobReply>,
}

/// Where signing jobs actually run.
///
/// The engine owns one context handle and never assumes which implementation
/// is behind it; worker and inline execution return identical replies.
pub trait ExecutionContext: Send + Sync {
    fn submit(&self, job: Job) -> JobTicket;
}

struct QueuedJob {
    id: u64,
    job: Job,
    reply: oneshot::Sender<JobReply>,
}

/// Context backed by a dedicated signing thread
pub struct WorkerContext {
    sender: mpsc::Sender<QueuedJob>,
    next_id: AtomicU64,
}

impl WorkerContext {
    /// Start the signing thread. Dropping the context shuts it down once the
    /// queue drains.
    pub fn spawn() -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<QueuedJob>();

        thread::Builder::new()
            .name("signing-worker".into())
            .spawn(move || {
                while let Ok(queued) = receiver.recv() {
                    let output = (queued.job)();
                    // The caller may have given up waiting; nothing to do then.
                    let _ = queued.reply.send(JobReply {
                        id: queued.id,
                        output,
                    });
                }
            })?;

        Ok(Self {
            sender,
            next_id: AtomicU64::new(1),
        })
    }
}

impl ExecutionContext for WorkerContext {
    fn submit(&self, job: Job) -> JobTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        let queued = QueuedJob {
            id,
            job,
            reply: reply_tx,
        };

        if let Err(mpsc::SendError(queued)) = self.sender.send(queued) {
            // The worker thread died (a previous job panicked). The ticket
            // still gets its one reply.
            let _ = queued.reply.send(JobReply {
                id,
                output: Err(SignerError::internal("Signing worker unavailable")),
            });
        }

        JobTicket { id, reply: reply_rx }
    }
}

/// Context that runs jobs synchronously on the submitting thread
#[derive(Debug)]
pub struct InlineContext {
    next_id: AtomicU64,
}

impl InlineContext {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for InlineContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext for InlineContext {
    fn submit(&self, job: Job) -> JobTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        let output = job();
        let _ = reply_tx.send(JobReply { id, output });

        JobTicket { id, reply: reply_rx }
    }
}

/// Worker-backed context when the thread can start, inline otherwise
pub fn default_context() -> Box<dyn ExecutionContext> {
    match WorkerContext::spawn() {
        Ok(worker) => Box::new(worker),
        Err(e) => {
            log_warn!(
                "engine",
                "Signing worker thread unavailable, executing inline",
                error = e,
            );
            Box::new(InlineContext::new())
        }
    }
}
