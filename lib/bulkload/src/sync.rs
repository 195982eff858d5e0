//! Bounded queues, the reducer concurrency limiter and worker join barriers.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel as channel;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Scope, ScopedJoinHandle};

/// Bounded MPMC queue. Sends block while full, receives block while empty;
/// the queue is closed once every `Sender` has been dropped.
pub fn queue<T>(capacity: usize) -> (channel::Sender<T>, channel::Receiver<T>) {
    channel::bounded(capacity)
}

/// Fixed-capacity token pool. At most `capacity` [`Permit`]s exist at once.
pub struct Limiter {
    tokens: channel::Sender<()>,
    returns: channel::Receiver<()>,
    capacity: usize,
}

impl Limiter {
    pub fn new(capacity: usize) -> Self {
        let (tokens, returns) = channel::bounded(capacity);
        Self { tokens, returns, capacity }
    }

    /// Blocks until a token is free.
    pub fn acquire(&self) -> Permit {
        // The limiter keeps a receiver alive, so the channel never disconnects.
        let _ = self.tokens.send(());
        Permit { returns: self.returns.clone() }
    }

    pub fn outstanding(&self) -> usize { self.tokens.len() }

    pub fn capacity(&self) -> usize { self.capacity }
}

/// Returns its token when dropped, including during unwinding.
pub struct Permit {
    returns: channel::Receiver<()>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let _ = self.returns.try_recv();
    }
}

/// Fail-fast signal shared by the workers of one stage. The first worker that
/// fails raises it; its peers check it between records and wind down.
#[derive(Debug, Default)]
pub struct StopFlag {
    raised: AtomicBool,
}

impl StopFlag {
    pub fn new() -> Self { Self::default() }

    pub fn raise(&self) { self.raised.store(true, Ordering::SeqCst); }

    pub fn is_raised(&self) -> bool { self.raised.load(Ordering::SeqCst) }

    /// Raises the flag when the returned guard is dropped without
    /// [`StopOnDrop::disarm`], so an early `?` return or a panic counts.
    pub fn arm(&self) -> StopOnDrop<'_> { StopOnDrop { flag: self, armed: true } }
}

pub struct StopOnDrop<'a> {
    flag: &'a StopFlag,
    armed: bool,
}

impl StopOnDrop<'_> {
    pub fn disarm(mut self) { self.armed = false; }
}

impl Drop for StopOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.flag.raise();
        }
    }
}

/// A named scoped worker thread whose result is collected at a join barrier.
pub struct Worker<'scope, T> {
    name: String,
    handle: ScopedJoinHandle<'scope, Result<T>>,
}

pub fn spawn_worker<'scope, 'env, T, F>(scope: &'scope Scope<'scope, 'env>, name: impl Into<String>, f: F) -> Result<Worker<'scope, T>>
where
    F: FnOnce() -> Result<T> + Send + 'scope,
    T: Send + 'scope,
{
    let name = name.into();
    let handle = thread::Builder::new()
        .name(name.clone())
        .spawn_scoped(scope, f)
        .with_context(|| format!("spawn {}", name))?;
    Ok(Worker { name, handle })
}

impl<'scope, T> Worker<'scope, T> {
    pub fn join(self) -> Result<T> {
        match self.handle.join() {
            Ok(res) => res.with_context(|| format!("{} failed", self.name)),
            Err(_) => Err(anyhow!("{} panicked", self.name)),
        }
    }
}

/// Join every worker, then report the first failure (if any).
pub fn join_all<T>(workers: Vec<Worker<'_, T>>) -> Result<Vec<T>> {
    let mut out = Vec::with_capacity(workers.len());
    let mut first_err = None;
    for w in workers {
        match w.join() {
            Ok(v) => out.push(v),
            Err(e) => {
                if first_err.is_none() { first_err = Some(e); }
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(out),
    }
}
