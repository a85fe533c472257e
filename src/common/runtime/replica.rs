use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::cell::Cell;
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReduceOp {
    Sum,
    Mean,
}

/// Collective used by the optimizer and the metrics path.
///
/// Every replica must issue the same sequence of calls with equally sized
/// buffers; a mismatch is a fatal desynchronization.
pub trait GradientSync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;
    fn all_reduce(&self, values: Vec<f32>, op: ReduceOp) -> Result<Vec<f32>>;
}

/// Pass-through collective for a single replica.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleReplica;

impl GradientSync for SingleReplica {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce(&self, values: Vec<f32>, _op: ReduceOp) -> Result<Vec<f32>> {
        Ok(values)
    }
}

type Reply = std::result::Result<Arc<Vec<f32>>, String>;

enum CollectiveMessage {
    Reduce {
        rank: usize,
        values: Vec<f32>,
        op: ReduceOp,
        reply: Sender<Reply>,
    },
    Abort {
        rank: usize,
        reason: String,
    },
    Leave {
        rank: usize,
    },
}

/// One replica's endpoint into the group's reducer thread.
pub struct ReplicaHandle {
    rank: usize,
    world_size: usize,
    tx: Sender<CollectiveMessage>,
    settled: Cell<bool>,
}

impl ReplicaHandle {
    fn finish(&self) {
        self.settled.set(true);
        let _ = self.tx.send(CollectiveMessage::Leave { rank: self.rank });
    }

    fn abort(&self, reason: String) {
        self.settled.set(true);
        let _ = self.tx.send(CollectiveMessage::Abort {
            rank: self.rank,
            reason,
        });
    }
}

impl Drop for ReplicaHandle {
    fn drop(&mut self) {
        // reached without finish/abort only while unwinding from a panic
        if !self.settled.get() {
            let _ = self.tx.send(CollectiveMessage::Abort {
                rank: self.rank,
                reason: "replica panicked".to_string(),
            });
        }
    }
}

impl GradientSync for ReplicaHandle {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce(&self, values: Vec<f32>, op: ReduceOp) -> Result<Vec<f32>> {
        let (reply_tx, reply_rx) = unbounded();
        self.tx
            .send(CollectiveMessage::Reduce {
                rank: self.rank,
                values,
                op,
                reply: reply_tx,
            })
            .map_err(|_| anyhow!("replica {}: collective reducer is gone", self.rank))?;

        match reply_rx.recv() {
            Ok(Ok(reduced)) => Ok(reduced.as_ref().clone()),
            Ok(Err(reason)) => bail!("replica {}: collective desynchronized: {reason}", self.rank),
            Err(_) => bail!("replica {}: collective reducer dropped the request", self.rank),
        }
    }
}

struct PendingReduce {
    values: Vec<f32>,
    op: ReduceOp,
    reply: Sender<Reply>,
}

struct Reducer {
    world_size: usize,
    pending: Vec<Option<PendingReduce>>,
    departed: Vec<bool>,
    failure: Option<String>,
}

impl Reducer {
    fn new(world_size: usize) -> Self {
        Self {
            world_size,
            pending: (0..world_size).map(|_| None).collect(),
            departed: vec![false; world_size],
            failure: None,
        }
    }

    fn fail(&mut self, reason: String) {
        warn!(category = "COORDINATOR", reason = %reason, "collective_failed");
        for slot in &mut self.pending {
            if let Some(p) = slot.take() {
                let _ = p.reply.send(Err(reason.clone()));
            }
        }
        self.failure.get_or_insert(reason);
    }

    fn has_waiters(&self) -> bool {
        self.pending.iter().any(Option::is_some)
    }

    fn handle(&mut self, message: CollectiveMessage) {
        match message {
            CollectiveMessage::Reduce {
                rank,
                values,
                op,
                reply,
            } => {
                if let Some(reason) = &self.failure {
                    let _ = reply.send(Err(reason.clone()));
                    return;
                }
                if let Some(gone) = self.departed.iter().position(|d| *d) {
                    let _ = reply.send(Err(format!("replica {gone} already finished")));
                    self.fail(format!("replica {rank} reduced after replica {gone} finished"));
                    return;
                }
                if self.pending[rank].is_some() {
                    let _ = reply.send(Err(format!("replica {rank} reduced twice in one round")));
                    self.fail(format!("replica {rank} reduced twice in one round"));
                    return;
                }
                self.pending[rank] = Some(PendingReduce { values, op, reply });
                if self.pending.iter().all(Option::is_some) {
                    self.complete_round();
                }
            }
            CollectiveMessage::Abort { rank, reason } => {
                self.fail(format!("replica {rank} aborted: {reason}"));
            }
            CollectiveMessage::Leave { rank } => {
                self.departed[rank] = true;
                if self.has_waiters() {
                    self.fail(format!("replica {rank} finished while peers were reducing"));
                }
            }
        }
    }

    fn complete_round(&mut self) {
        let round = self
            .pending
            .iter_mut()
            .filter_map(Option::take)
            .collect::<Vec<_>>();

        let len = round[0].values.len();
        let op = round[0].op;
        if round.iter().any(|p| p.values.len() != len || p.op != op) {
            let reason = "replicas disagree on buffer size or reduce op".to_string();
            for p in &round {
                let _ = p.reply.send(Err(reason.clone()));
            }
            self.fail(reason);
            return;
        }

        // fixed rank order keeps the result bit-identical on every replica
        let mut acc = vec![0.0f32; len];
        for p in &round {
            for (a, v) in acc.iter_mut().zip(&p.values) {
                *a += *v;
            }
        }
        if op == ReduceOp::Mean {
            let scale = 1.0 / self.world_size as f32;
            acc.iter_mut().for_each(|a| *a *= scale);
        }

        let shared = Arc::new(acc);
        for p in round {
            let _ = p.reply.send(Ok(Arc::clone(&shared)));
        }
    }
}

fn reducer_loop(world_size: usize, rx: Receiver<CollectiveMessage>) {
    let mut reducer = Reducer::new(world_size);
    while let Ok(message) = rx.recv() {
        reducer.handle(message);
    }
    debug!(category = "COORDINATOR", world_size, "reducer_exit");
}

/// Runs `world_size` replicas in lockstep on scoped threads.
///
/// The first error (or panic) aborts the collective so that peers blocked in
/// a reduction fail instead of hanging; results are returned in rank order
/// only when every replica succeeds.
pub fn run_replicated<T, F>(world_size: usize, replica: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(&ReplicaHandle) -> Result<T> + Sync,
{
    if world_size == 0 {
        bail!("world_size must be > 0");
    }

    let (tx, rx) = unbounded::<CollectiveMessage>();
    let replica = &replica;

    thread::scope(|scope| {
        scope.spawn(move || reducer_loop(world_size, rx));

        let workers = (0..world_size)
            .map(|rank| {
                let handle = ReplicaHandle {
                    rank,
                    world_size,
                    tx: tx.clone(),
                    settled: Cell::new(false),
                };
                thread::Builder::new()
                    .name(format!("replica-{rank}"))
                    .spawn_scoped(scope, move || {
                        let out = replica(&handle);
                        match &out {
                            Ok(_) => handle.finish(),
                            Err(e) => handle.abort(format!("{e:#}")),
                        }
                        out
                    })
                    .map_err(|e| anyhow!("failed to spawn replica {rank}: {e}"))
            })
            .collect::<Vec<_>>();
        drop(tx);

        let mut results = Vec::with_capacity(world_size);
        let mut errors = Vec::new();
        for (rank, worker) in workers.into_iter().enumerate() {
            let outcome = worker.and_then(|h| {
                h.join()
                    .map_err(|_| anyhow!("replica {rank} panicked"))
                    .and_then(|r| r)
            });
            match outcome {
                Ok(value) => results.push(value),
                Err(e) => errors.push(e),
            }
        }

        if errors.is_empty() {
            return Ok(results);
        }
        // peers that only observed the abort are reported after the root cause
        let root = errors
            .iter()
            .position(|e| !format!("{e:#}").contains("collective desynchronized"))
            .unwrap_or(0);
        Err(errors.swap_remove(root))
    })
}
