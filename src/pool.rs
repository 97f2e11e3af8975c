//! The pool/distributor (C5) and the dispatcher loop (C6).
//!
//! Each worker gets its own dedicated input channel rather than all workers
//! sharing one multi-consumer queue: `ipc-channel`'s receivers, unlike
//! `crossbeam_channel`'s, are single-consumer, so a shared queue across
//! process boundaries has no direct equivalent. The pool instead round-robins
//! tasks across per-worker channels and multiplexes every worker's result
//! channel into one [`IpcReceiverSet`]. The `2 * pool_size` outstanding-task
//! cap described for a single shared queue is reproduced by bounding the
//! total count of sent-but-not-yet-yielded tasks instead of a single queue's
//! depth; the observable backpressure behaviour is the same.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use indexmap::{IndexMap, IndexSet};
use ipc_channel::ipc::{self, IpcOneShotServer, IpcReceiver, IpcReceiverSet, IpcSelectionResult, IpcSender};

use crate::error::DispatchError;
use crate::ipc::{WireInstruction, WireResult};
use crate::task::{MapFn, Outcome};
use crate::wire;
use crate::worker;

/// Order in which [`MapIter`] yields results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapMode {
    Ordered,
    Unordered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct WorkerId(u64);

struct WorkerHandle {
    child: Child,
    task_tx: IpcSender<WireInstruction>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("pid", &self.child.id())
            .finish()
    }
}

struct StartedPool {
    workers: IndexMap<WorkerId, WorkerHandle>,
    receiver_set: IpcReceiverSet,
    route_to_worker: HashMap<u64, WorkerId>,
    /// Routes of workers the pool itself killed during timeout replacement.
    /// A later `ChannelClosed` for one of these is expected, not a failure.
    retired_routes: HashSet<u64>,
    next_worker_id: u64,
    round_robin: usize,
    in_map: AtomicBool,
}

impl fmt::Debug for StartedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartedPool")
            .field("workers", &self.workers.len())
            .finish()
    }
}

#[derive(Debug)]
enum PoolState {
    Unstarted,
    Started(StartedPool),
}

/// A fixed pool of worker processes executing a single registered
/// [`MapFn`] in parallel.
#[derive(Debug)]
pub struct Pool<F: MapFn> {
    pool_size: NonZeroUsize,
    timeout: Option<Duration>,
    state: PoolState,
    _marker: PhantomData<F>,
}

fn default_pool_size() -> NonZeroUsize {
    thread::available_parallelism().unwrap_or_else(|_| NonZeroUsize::new(4).unwrap())
}

fn spawn_worker(
    fn_name: &str,
    timeout: Option<Duration>,
) -> Result<(WorkerHandle, IpcReceiver<WireResult>), DispatchError> {
    let (server, server_name) = IpcOneShotServer::<IpcSender<WireInstruction>>::new()
        .map_err(|err| DispatchError::PoolFailure(err.to_string()))?;

    let exe = std::env::current_exe().map_err(|err| DispatchError::PoolFailure(err.to_string()))?;
    let mut command = Command::new(exe);
    command.env(worker::BOOTSTRAP_ENV, &server_name);
    command.env(worker::FN_NAME_ENV, fn_name);
    if let Some(timeout) = timeout {
        command.env(worker::TIMEOUT_ENV_MS, timeout.as_millis().to_string());
    }

    let child = command
        .spawn()
        .map_err(|err| DispatchError::PoolFailure(err.to_string()))?;

    let (_, task_tx) = server
        .accept()
        .map_err(|err| DispatchError::PoolFailure(err.to_string()))?;

    let (result_tx, result_rx) =
        ipc::channel::<WireResult>().map_err(|err| DispatchError::PoolFailure(err.to_string()))?;

    task_tx
        .send(WireInstruction::Init { result_tx })
        .map_err(|err| DispatchError::PoolFailure(err.to_string()))?;

    Ok((WorkerHandle { child, task_tx }, result_rx))
}

impl StartedPool {
    fn next_worker(&mut self) -> IpcSender<WireInstruction> {
        let idx = self.round_robin % self.workers.len();
        self.round_robin = self.round_robin.wrapping_add(1);
        let (_, handle) = self
            .workers
            .get_index(idx)
            .expect("pool is never empty while started");
        handle.task_tx.clone()
    }
}

impl<F: MapFn> Pool<F> {
    /// Creates a pool. `pool_size` defaults to the host's available
    /// parallelism; `timeout` defaults to unbounded.
    pub fn new(pool_size: Option<NonZeroUsize>, timeout: Option<Duration>) -> Self {
        Self {
            pool_size: pool_size.unwrap_or_else(default_pool_size),
            timeout,
            state: PoolState::Unstarted,
            _marker: PhantomData,
        }
    }

    pub fn pool_size(&self) -> NonZeroUsize {
        self.pool_size
    }

    pub fn is_started(&self) -> bool {
        matches!(self.state, PoolState::Started(_))
    }

    /// Spawns the worker processes. Fails with [`DispatchError::AlreadyStarted`]
    /// if already started.
    pub fn start(&mut self) -> Result<(), DispatchError> {
        if self.is_started() {
            return Err(DispatchError::AlreadyStarted);
        }

        let mut workers = IndexMap::new();
        let mut receiver_set =
            IpcReceiverSet::new().map_err(|err| DispatchError::PoolFailure(err.to_string()))?;
        let mut route_to_worker = HashMap::new();

        for idx in 0..self.pool_size.get() {
            let worker_id = WorkerId(idx as u64);
            let (handle, result_rx) = spawn_worker(F::NAME, self.timeout)?;
            let route_id = receiver_set
                .add(result_rx)
                .map_err(|err| DispatchError::PoolFailure(err.to_string()))?;
            route_to_worker.insert(route_id, worker_id);
            workers.insert(worker_id, handle);
            log::trace!("spawned worker {idx} (pid {})", workers[&worker_id].child.id());
        }

        self.state = PoolState::Started(StartedPool {
            workers,
            receiver_set,
            route_to_worker,
            retired_routes: HashSet::new(),
            next_worker_id: self.pool_size.get() as u64,
            round_robin: 0,
            in_map: AtomicBool::new(false),
        });

        Ok(())
    }

    /// Terminates every worker process unconditionally (no draining of
    /// in-flight tasks) and returns the pool to the unstarted state. Fails
    /// with [`DispatchError::NotStarted`] if not started.
    pub fn stop(&mut self) -> Result<(), DispatchError> {
        match std::mem::replace(&mut self.state, PoolState::Unstarted) {
            PoolState::Unstarted => Err(DispatchError::NotStarted),
            PoolState::Started(started) => {
                Self::shutdown(started);
                Ok(())
            }
        }
    }

    fn shutdown(started: StartedPool) {
        for handle in started.workers.values() {
            let _ = handle.task_tx.send(WireInstruction::Poison);
        }
        for (worker_id, mut handle) in started.workers {
            log::trace!("terminating worker (pid {})", handle.child.id());
            let _ = handle.child.kill();
            let _ = handle.child.wait();
            let _ = worker_id;
        }
    }

    fn started_mut(&mut self) -> Result<&mut StartedPool, DispatchError> {
        match &mut self.state {
            PoolState::Unstarted => Err(DispatchError::NotStarted),
            PoolState::Started(started) => Ok(started),
        }
    }

    /// Ordered lazy map over an infallible iterable.
    pub fn imap<I>(&mut self, inputs: I) -> Result<MapIter<'_, F>, DispatchError>
    where
        I: IntoIterator<Item = F::Args>,
        I::IntoIter: 'static,
    {
        self.new_iter(MapMode::Ordered, Box::new(inputs.into_iter().map(Ok)))
    }

    /// Unordered (completion-order) lazy map over an infallible iterable.
    pub fn imap_unordered<I>(&mut self, inputs: I) -> Result<MapIter<'_, F>, DispatchError>
    where
        I: IntoIterator<Item = F::Args>,
        I::IntoIter: 'static,
    {
        self.new_iter(MapMode::Unordered, Box::new(inputs.into_iter().map(Ok)))
    }

    /// Ordered lazy map over a fallible iterable. An `Err` item surfaces as
    /// [`DispatchError::MalformedInput`] and ends the stream there.
    pub fn try_imap<I, E>(&mut self, inputs: I) -> Result<MapIter<'_, F>, DispatchError>
    where
        I: IntoIterator<Item = Result<F::Args, E>>,
        I::IntoIter: 'static,
        E: fmt::Display,
    {
        self.new_iter(
            MapMode::Ordered,
            Box::new(inputs.into_iter().map(|item| item.map_err(|err| err.to_string()))),
        )
    }

    /// Unordered lazy map over a fallible iterable.
    pub fn try_imap_unordered<I, E>(&mut self, inputs: I) -> Result<MapIter<'_, F>, DispatchError>
    where
        I: IntoIterator<Item = Result<F::Args, E>>,
        I::IntoIter: 'static,
        E: fmt::Display,
    {
        self.new_iter(
            MapMode::Unordered,
            Box::new(inputs.into_iter().map(|item| item.map_err(|err| err.to_string()))),
        )
    }

    fn new_iter(
        &mut self,
        mode: MapMode,
        inputs: Box<dyn Iterator<Item = Result<F::Args, String>>>,
    ) -> Result<MapIter<'_, F>, DispatchError> {
        match &mut self.state {
            PoolState::Unstarted => return Err(DispatchError::NotStarted),
            PoolState::Started(started) => {
                if started.in_map.swap(true, Ordering::AcqRel) {
                    return Err(DispatchError::ConcurrentMisuse);
                }
            }
        }

        Ok(MapIter {
            pool: self,
            inputs,
            mode,
            pending: None,
            next_task_id: 0,
            input_exhausted: false,
            in_flight: IndexSet::new(),
            waiting: HashMap::new(),
            failed: false,
        })
    }

    fn replace_worker(&mut self, dead_route: u64) -> Result<(), DispatchError> {
        let timeout = self.timeout;
        let started = self.started_mut()?;

        let dead_worker_id = started
            .route_to_worker
            .remove(&dead_route)
            .ok_or_else(|| DispatchError::PoolFailure("unknown worker route".to_string()))?;
        started.retired_routes.insert(dead_route);

        if let Some(mut handle) = started.workers.shift_remove(&dead_worker_id) {
            log::debug!("reaping timed-out worker (pid {})", handle.child.id());
            join_then_kill(&mut handle.child, Duration::from_millis(200));
        }

        let (handle, result_rx) = spawn_worker(F::NAME, timeout)?;
        let started = self.started_mut()?;
        let route_id = started
            .receiver_set
            .add(result_rx)
            .map_err(|err| DispatchError::PoolFailure(err.to_string()))?;
        let new_worker_id = WorkerId(started.next_worker_id);
        started.next_worker_id += 1;
        log::debug!("spawned replacement worker (pid {})", handle.child.id());
        started.route_to_worker.insert(route_id, new_worker_id);
        started.workers.insert(new_worker_id, handle);

        Ok(())
    }
}

/// Waits up to `grace` for a child to exit on its own, then force-kills it.
/// Used only for the single worker being replaced after a timeout; `Pool::stop`
/// kills unconditionally instead (see module docs / `DESIGN.md`).
fn join_then_kill(child: &mut Child, grace: Duration) {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(5)),
            _ => break,
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

impl<F: MapFn> Drop for Pool<F> {
    fn drop(&mut self) {
        if let PoolState::Started(started) = std::mem::replace(&mut self.state, PoolState::Unstarted) {
            Self::shutdown(started);
        }
    }
}

/// Lazy iterator returned by [`Pool::imap`] and friends. Yields one item per
/// input, in the order determined by the mode it was created with, or an
/// [`DispatchError`] that aborts the stream.
pub struct MapIter<'p, F: MapFn> {
    pool: &'p mut Pool<F>,
    inputs: Box<dyn Iterator<Item = Result<F::Args, String>>>,
    mode: MapMode,
    pending: Option<F::Args>,
    next_task_id: u64,
    input_exhausted: bool,
    in_flight: IndexSet<u64>,
    waiting: HashMap<u64, Outcome<F::Output>>,
    failed: bool,
}

impl<'p, F: MapFn> Drop for MapIter<'p, F> {
    fn drop(&mut self) {
        // Abandoning a partially consumed stream still leaves its tasks
        // in flight on the workers; drain their results here (discarding
        // them) so a later map call on this pool doesn't see stray results
        // land under newly reused task ids.
        while !self.in_flight.is_empty() {
            if self.drain_one_blocking().is_err() {
                break;
            }
            while self.try_pop_ready().is_some() {}
        }

        if let PoolState::Started(started) = &mut self.pool.state {
            started.in_map.store(false, Ordering::Release);
        }
    }
}

impl<'p, F: MapFn> MapIter<'p, F> {
    fn try_pop_ready(&mut self) -> Option<Outcome<F::Output>> {
        match self.mode {
            MapMode::Ordered => {
                let front = *self.in_flight.get_index(0)?;
                if self.waiting.contains_key(&front) {
                    self.in_flight.shift_remove_index(0);
                    self.waiting.remove(&front)
                } else {
                    None
                }
            }
            MapMode::Unordered => {
                let ready_id = self
                    .in_flight
                    .iter()
                    .copied()
                    .find(|id| self.waiting.contains_key(id))?;
                self.in_flight.shift_remove(&ready_id);
                self.waiting.remove(&ready_id)
            }
        }
    }

    fn send_task(&mut self, id: u64, args: F::Args) -> Result<(), DispatchError> {
        let payload = wire::encode(&args).map_err(DispatchError::PoolFailure)?;
        let started = self.pool.started_mut()?;
        let task_tx = started.next_worker();
        task_tx
            .send(WireInstruction::Task { id, payload })
            .map_err(|err| DispatchError::PoolFailure(err.to_string()))
    }

    /// Blocks on at least one incoming result, then drains every result that
    /// is already available without blocking further, exactly once.
    fn drain_one_blocking(&mut self) -> Result<(), DispatchError> {
        let events = {
            let started = self.pool.started_mut()?;
            started
                .receiver_set
                .select()
                .map_err(|err| DispatchError::PoolFailure(err.to_string()))?
        };

        for event in events {
            match event {
                IpcSelectionResult::MessageReceived(route_id, message) => {
                    let wire: WireResult = message
                        .to()
                        .map_err(|err| DispatchError::PoolFailure(err.to_string()))?;
                    self.handle_wire_result(route_id, wire)?;
                }
                IpcSelectionResult::ChannelClosed(route_id) => {
                    let started = self.pool.started_mut()?;
                    if !started.retired_routes.remove(&route_id) {
                        return Err(DispatchError::PoolFailure(format!(
                            "worker on route {route_id} disconnected unexpectedly"
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_wire_result(&mut self, route_id: u64, wire: WireResult) -> Result<(), DispatchError> {
        match wire {
            WireResult::Acknowledge => Ok(()),
            WireResult::Value { task_id, payload } => {
                match wire::decode::<F::Output>(&payload) {
                    Ok(value) => {
                        self.waiting.insert(task_id, Outcome::Value(value));
                        Ok(())
                    }
                    Err(message) => Err(DispatchError::PoolFailure(message)),
                }
            }
            WireResult::Failed { task_id, message } => {
                self.waiting.insert(task_id, Outcome::WorkerError(message));
                Ok(())
            }
            WireResult::TimedOut { task_id } => {
                log::warn!("task {task_id} timed out, replacing its worker");
                self.waiting.insert(task_id, Outcome::Timeout);
                self.pool.replace_worker(route_id)
            }
        }
    }
}

impl<'p, F: MapFn> Iterator for MapIter<'p, F> {
    type Item = Result<Outcome<F::Output>, DispatchError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        loop {
            if let Some(outcome) = self.try_pop_ready() {
                return Some(Ok(outcome));
            }

            if self.pending.is_none() && !self.input_exhausted {
                match self.inputs.next() {
                    Some(Ok(args)) => self.pending = Some(args),
                    Some(Err(message)) => {
                        self.input_exhausted = true;
                        self.failed = true;
                        return Some(Err(DispatchError::MalformedInput(message)));
                    }
                    None => self.input_exhausted = true,
                }
            }

            if let Some(args) = self.pending.take() {
                let capacity = 2 * self.pool.pool_size().get();
                if self.in_flight.len() < capacity {
                    let id = self.next_task_id;
                    self.next_task_id += 1;
                    if let Err(err) = self.send_task(id, args) {
                        self.failed = true;
                        return Some(Err(err));
                    }
                    self.in_flight.insert(id);
                    continue;
                }

                self.pending = Some(args);
                if let Err(err) = self.drain_one_blocking() {
                    self.failed = true;
                    return Some(Err(err));
                }
                continue;
            }

            if !self.in_flight.is_empty() {
                if let Err(err) = self.drain_one_blocking() {
                    self.failed = true;
                    return Some(Err(err));
                }
                continue;
            }

            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Identity;

    impl MapFn for Identity {
        type Args = i32;
        type Output = i32;
        const NAME: &'static str = "procmap::tests::identity";

        fn call(x: i32) -> Result<i32, String> {
            Ok(x)
        }
    }

    fn fresh_iter(pool: &mut Pool<Identity>, mode: MapMode) -> MapIter<'_, Identity> {
        MapIter {
            pool,
            inputs: Box::new(std::iter::empty()),
            mode,
            pending: None,
            next_task_id: 0,
            input_exhausted: true,
            in_flight: IndexSet::new(),
            waiting: HashMap::new(),
            failed: false,
        }
    }

    #[test]
    fn ordered_mode_only_pops_when_front_is_ready() {
        let mut pool = Pool::<Identity>::new(NonZeroUsize::new(2), None);
        let mut iter = fresh_iter(&mut pool, MapMode::Ordered);

        iter.in_flight.insert(0);
        iter.in_flight.insert(1);
        iter.in_flight.insert(2);
        iter.waiting.insert(1, Outcome::Value(10));
        iter.waiting.insert(2, Outcome::Value(20));

        // Task 0 hasn't arrived yet, so nothing can be yielded even though
        // 1 and 2 are ready.
        assert_eq!(iter.try_pop_ready(), None);

        iter.waiting.insert(0, Outcome::Value(0));
        assert_eq!(iter.try_pop_ready(), Some(Outcome::Value(0)));
        assert_eq!(iter.try_pop_ready(), Some(Outcome::Value(10)));
        assert_eq!(iter.try_pop_ready(), Some(Outcome::Value(20)));
        assert_eq!(iter.try_pop_ready(), None);
        assert!(iter.in_flight.is_empty());
    }

    #[test]
    fn unordered_mode_pops_whatever_is_ready() {
        let mut pool = Pool::<Identity>::new(NonZeroUsize::new(2), None);
        let mut iter = fresh_iter(&mut pool, MapMode::Unordered);

        iter.in_flight.insert(0);
        iter.in_flight.insert(1);
        iter.in_flight.insert(2);
        iter.waiting.insert(1, Outcome::Value(10));

        assert_eq!(iter.try_pop_ready(), Some(Outcome::Value(10)));
        assert!(!iter.in_flight.contains(&1));
        assert_eq!(iter.try_pop_ready(), None);
    }

    #[test]
    fn default_pool_size_is_never_zero() {
        assert!(default_pool_size().get() > 0);
    }

    fn iter_with_readiness(pool: &mut Pool<Identity>, mode: MapMode, ready: &[bool]) -> MapIter<'_, Identity> {
        let mut iter = fresh_iter(pool, mode);
        for (id, &is_ready) in ready.iter().enumerate() {
            let id = id as u64;
            iter.in_flight.insert(id);
            if is_ready {
                iter.waiting.insert(id, Outcome::Value(id as i32));
            }
        }
        iter
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// In ordered mode, repeatedly popping can only ever drain the
            /// contiguous run of ready ids starting at 0 — a ready id past
            /// the first gap must never come out before that gap is filled.
            #[test]
            fn ordered_pop_drains_exactly_the_ready_prefix(ready in proptest::collection::vec(any::<bool>(), 1..32)) {
                let mut pool = Pool::<Identity>::new(NonZeroUsize::new(2), None);
                let mut iter = iter_with_readiness(&mut pool, MapMode::Ordered, &ready);

                let expected_prefix_len = ready.iter().take_while(|&&is_ready| is_ready).count();

                let mut popped = Vec::new();
                while let Some(outcome) = iter.try_pop_ready() {
                    popped.push(outcome.value().unwrap());
                }

                let expected: Vec<i32> = (0..expected_prefix_len as i32).collect();
                prop_assert_eq!(popped, expected);
                prop_assert_eq!(iter.in_flight.len(), ready.len() - expected_prefix_len);
            }

            /// In unordered mode, repeatedly popping drains exactly the set
            /// of ready ids (in whatever order), leaving every unready id
            /// behind.
            #[test]
            fn unordered_pop_drains_exactly_the_ready_set(ready in proptest::collection::vec(any::<bool>(), 1..32)) {
                let mut pool = Pool::<Identity>::new(NonZeroUsize::new(2), None);
                let mut iter = iter_with_readiness(&mut pool, MapMode::Unordered, &ready);

                let mut expected: Vec<i32> = ready
                    .iter()
                    .enumerate()
                    .filter(|(_, &is_ready)| is_ready)
                    .map(|(id, _)| id as i32)
                    .collect();

                let mut popped = Vec::new();
                while let Some(outcome) = iter.try_pop_ready() {
                    popped.push(outcome.value().unwrap());
                }

                popped.sort_unstable();
                expected.sort_unstable();
                prop_assert_eq!(popped, expected);

                let remaining: HashSet<u64> = ready
                    .iter()
                    .enumerate()
                    .filter(|(_, &is_ready)| !is_ready)
                    .map(|(id, _)| id as u64)
                    .collect();
                let actual_remaining: HashSet<u64> = iter.in_flight.iter().copied().collect();
                prop_assert_eq!(actual_remaining, remaining);
            }
        }
    }
}
