// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Input window allocation for source connections.
//!
//! Every admitted connection owns a window: the number of messages it may have
//! in flight before it must stop reading. A window has a static part, fixed at
//! admission, and in dynamic mode a dynamic part borrowed from a pool shared by
//! all connections. The pool is redistributed every `dynamic_window_realloc_ticks`
//! ticks by a [`RebalanceStrategy`].
//!
//! For every connection `available + in_use == capacity` holds after each
//! operation. A rebalance only takes back slots that are not in use, so the
//! capacity of a connection never drops below what it currently holds.

use crate::config::{RebalanceKind, WindowConfig};
use crate::constants::MIN_STATIC_WINDOW_SIZE;
use crate::stats::StatsRegistry;
use hashbrown::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

pub type ConnectionId = u64;

/// Per-connection sizes derived from [`WindowConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSizing {
    pub static_per_connection: usize,
    pub max_connections: usize,
    pub dynamic_window_size: usize,
    pub dynamic_per_connection: usize,
    pub realloc_ticks: u32,
}

impl WindowSizing {
    pub fn from_config(config: &WindowConfig) -> Self {
        let max_connections = config.max_connections.max(1);
        let per_connection = config.log_iw_size / max_connections;

        let static_per_connection = if config.is_dynamic() {
            per_connection.max(1)
        } else if per_connection < MIN_STATIC_WINDOW_SIZE {
            warn!(
                log_iw_size = config.log_iw_size,
                max_connections,
                min_iw_size_per_reader = MIN_STATIC_WINDOW_SIZE,
                "The result was too small, increasing to a reasonable minimum value"
            );
            MIN_STATIC_WINDOW_SIZE
        } else {
            per_connection
        };

        Self {
            static_per_connection,
            max_connections,
            dynamic_window_size: config.dynamic_window_size,
            dynamic_per_connection: config.dynamic_window_size / max_connections,
            realloc_ticks: config.dynamic_window_realloc_ticks.max(1),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic_window_size > 0
    }
}

/// Decides how the free dynamic pool is split among live connections.
pub trait RebalanceStrategy: Send + Sync + fmt::Debug {
    /// `demands[i]` is what connection `i` asked for since the previous
    /// rebalance. Returns grants aligned with `demands` whose sum does not
    /// exceed `pool`.
    fn distribute(&self, pool: usize, demands: &[usize], fair_share: usize) -> Vec<usize>;
}

/// Splits the pool proportionally to recent demand. Idle connections keep
/// only their static part; when nobody asked for anything the pool is shared
/// evenly up to the fair share.
#[derive(Debug, Default, Clone, Copy)]
pub struct DemandWeighted;

impl RebalanceStrategy for DemandWeighted {
    fn distribute(&self, pool: usize, demands: &[usize], fair_share: usize) -> Vec<usize> {
        if demands.is_empty() || pool == 0 {
            return vec![0; demands.len()];
        }
        let total: u128 = demands.iter().map(|d| *d as u128).sum();
        if total == 0 {
            let share = fair_share.min(pool / demands.len());
            return vec![share; demands.len()];
        }
        demands
            .iter()
            .map(|d| ((pool as u128 * *d as u128) / total) as usize)
            .collect()
    }
}

/// Splits the pool evenly regardless of demand.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvenSplit;

impl RebalanceStrategy for EvenSplit {
    fn distribute(&self, pool: usize, demands: &[usize], _fair_share: usize) -> Vec<usize> {
        if demands.is_empty() {
            return Vec::new();
        }
        vec![pool / demands.len(); demands.len()]
    }
}

/// Returned by [`WindowAllocator::admit`] when `max_connections` are live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Number of allowed concurrent connections reached ({max_connections})")]
pub struct Rejected {
    pub max_connections: usize,
}

struct ConnectionWindow {
    peer: String,
    static_capacity: usize,
    dynamic_capacity: usize,
    in_use: usize,
    demand: usize,
    closed: bool,
    suspended: bool,
    notify: Arc<Notify>,
}

impl ConnectionWindow {
    fn capacity(&self) -> usize {
        self.static_capacity + self.dynamic_capacity
    }

    fn available(&self) -> usize {
        self.capacity().saturating_sub(self.in_use)
    }

    /// Gives back the part of the dynamic window that is not in use.
    fn reclaim_unused(&mut self) -> usize {
        let reclaimed = self.dynamic_capacity.min(self.available());
        self.dynamic_capacity -= reclaimed;
        reclaimed
    }
}

struct AllocatorState {
    connections: HashMap<ConnectionId, ConnectionWindow>,
    pool: usize,
    next_id: ConnectionId,
    ticks: u32,
}

struct Shared {
    state: Mutex<AllocatorState>,
    sizing: WindowSizing,
    strategy: Box<dyn RebalanceStrategy>,
    stats: Arc<StatsRegistry>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, AllocatorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, id: ConnectionId, conn: &ConnectionWindow) {
        self.stats.set_window(id, conn.available(), conn.capacity());
    }

    fn remove_if_drained(&self, state: &mut AllocatorState, id: ConnectionId) {
        let drained = state
            .connections
            .get(&id)
            .is_some_and(|conn| conn.closed && conn.in_use == 0);
        if !drained {
            return;
        }
        if let Some(conn) = state.connections.remove(&id) {
            state.pool += conn.dynamic_capacity;
            self.stats.remove_window(id);
            debug!(connection = id, peer = %conn.peer, "Input window released");
        }
    }

    fn rebalance(&self, state: &mut AllocatorState) {
        if !self.sizing.is_dynamic() {
            return;
        }

        let mut reclaimed = 0;
        for conn in state.connections.values_mut() {
            reclaimed += conn.reclaim_unused();
        }
        state.pool += reclaimed;

        let mut ids: Vec<ConnectionId> = state
            .connections
            .iter()
            .filter(|(_, conn)| !conn.closed)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        let demands: Vec<usize> = ids
            .iter()
            .filter_map(|id| state.connections.get(id).map(|conn| conn.demand))
            .collect();

        let grants = self.strategy.distribute(
            state.pool,
            &demands,
            self.sizing.dynamic_per_connection,
        );

        let mut granted = 0;
        for (id, grant) in ids.iter().zip(grants) {
            let grant = grant.min(state.pool - granted);
            if let Some(conn) = state.connections.get_mut(id) {
                conn.dynamic_capacity += grant;
                granted += grant;
            }
        }
        state.pool -= granted;

        for (id, conn) in state.connections.iter_mut() {
            conn.demand = 0;
            if conn.suspended && conn.available() > 0 {
                conn.suspended = false;
                debug!(connection = *id, "Source has been resumed");
                conn.notify.notify_waiters();
            }
            self.stats.set_window(*id, conn.available(), conn.capacity());
        }

        debug!(
            connections = ids.len(),
            pool = state.pool,
            granted,
            "Dynamic window rebalanced"
        );
    }
}

/// Admits source connections and hands out their window handles.
#[derive(Clone)]
pub struct WindowAllocator {
    shared: Arc<Shared>,
}

impl WindowAllocator {
    pub fn new(config: &WindowConfig, stats: Arc<StatsRegistry>) -> Self {
        let strategy: Box<dyn RebalanceStrategy> = match config.rebalance {
            RebalanceKind::DemandWeighted => Box::new(DemandWeighted),
            RebalanceKind::EvenSplit => Box::new(EvenSplit),
        };
        Self::with_strategy(WindowSizing::from_config(config), strategy, stats)
    }

    pub fn with_strategy(
        sizing: WindowSizing,
        strategy: Box<dyn RebalanceStrategy>,
        stats: Arc<StatsRegistry>,
    ) -> Self {
        let state = AllocatorState {
            connections: HashMap::new(),
            pool: sizing.dynamic_window_size,
            next_id: 0,
            ticks: 0,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                sizing,
                strategy,
                stats,
            }),
        }
    }

    pub fn sizing(&self) -> WindowSizing {
        self.shared.sizing
    }

    /// Admits a new connection or rejects it when `max_connections` are live.
    /// A rejected connection consumes no capacity.
    pub fn admit(&self, peer: &str) -> Result<WindowHandle, Rejected> {
        let sizing = self.shared.sizing;
        let mut state = self.shared.lock();

        let live = state.connections.values().filter(|c| !c.closed).count();
        if live >= sizing.max_connections {
            return Err(Rejected {
                max_connections: sizing.max_connections,
            });
        }

        let dynamic_capacity = if sizing.is_dynamic() {
            sizing.dynamic_per_connection.min(state.pool)
        } else {
            0
        };
        state.pool -= dynamic_capacity;

        let id = state.next_id;
        state.next_id += 1;
        let conn = ConnectionWindow {
            peer: peer.to_string(),
            static_capacity: sizing.static_per_connection,
            dynamic_capacity,
            in_use: 0,
            demand: 0,
            closed: false,
            suspended: false,
            notify: Arc::new(Notify::new()),
        };
        self.shared.publish(id, &conn);
        debug!(
            connection = id,
            peer,
            capacity = conn.capacity(),
            "Input window allocated"
        );
        state.connections.insert(id, conn);

        Ok(WindowHandle {
            id,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Redistributes the dynamic pool now. No-op in static mode.
    pub fn rebalance(&self) {
        let mut state = self.shared.lock();
        self.shared.rebalance(&mut state);
    }

    /// Advances the statistics tick and rebalances every `realloc_ticks` ticks.
    /// Returns whether a rebalance ran.
    pub fn tick(&self) -> bool {
        if !self.shared.sizing.is_dynamic() {
            return false;
        }
        let mut state = self.shared.lock();
        state.ticks += 1;
        if state.ticks < self.shared.sizing.realloc_ticks {
            return false;
        }
        state.ticks = 0;
        self.shared.rebalance(&mut state);
        true
    }

    /// Connections that are open. Closed connections still draining are not counted.
    pub fn live_connections(&self) -> usize {
        self.shared
            .lock()
            .connections
            .values()
            .filter(|c| !c.closed)
            .count()
    }

    /// Connections tracked, including closed ones with messages in flight.
    pub fn tracked_connections(&self) -> usize {
        self.shared.lock().connections.len()
    }

    /// Unassigned slots of the dynamic pool.
    pub fn pool(&self) -> usize {
        self.shared.lock().pool
    }
}

/// A connection's view of its window.
#[derive(Clone)]
pub struct WindowHandle {
    id: ConnectionId,
    shared: Arc<Shared>,
}

impl fmt::Debug for WindowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowHandle").field("id", &self.id).finish()
    }
}

impl WindowHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Takes `n` slots. Returns false, taking nothing, when fewer are available;
    /// the source must then stop reading until [`WindowHandle::wait_for_window`] resolves.
    pub fn consume(&self, n: usize) -> bool {
        let mut state = self.shared.lock();
        let Some(conn) = state.connections.get_mut(&self.id) else {
            return false;
        };
        if conn.closed {
            return false;
        }
        conn.demand += n;
        if conn.available() < n {
            if !conn.suspended {
                conn.suspended = true;
                info!(connection = self.id, peer = %conn.peer, "Source has been suspended");
            }
            return false;
        }

        conn.in_use += n;
        if conn.available() == 0 && !conn.suspended {
            conn.suspended = true;
            info!(connection = self.id, peer = %conn.peer, "Source has been suspended");
        }
        self.shared.publish(self.id, conn);
        true
    }

    /// Returns `n` slots. `available` never grows past `capacity`.
    pub fn release(&self, n: usize) {
        let mut state = self.shared.lock();
        let Some(conn) = state.connections.get_mut(&self.id) else {
            return;
        };
        conn.in_use -= n.min(conn.in_use);
        if conn.suspended && conn.available() > 0 && !conn.closed {
            conn.suspended = false;
            debug!(connection = self.id, "Source has been resumed");
        }
        conn.notify.notify_waiters();
        self.shared.publish(self.id, conn);
        self.shared.remove_if_drained(&mut state, self.id);
    }

    /// Marks the connection closed. Its unused dynamic slots go back to the
    /// pool at once; the rest follows as in-flight messages are acknowledged.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        let Some(conn) = state.connections.get_mut(&self.id) else {
            return;
        };
        if conn.closed {
            return;
        }
        conn.closed = true;
        let reclaimed = conn.reclaim_unused();
        conn.notify.notify_waiters();
        self.shared.publish(self.id, conn);
        state.pool += reclaimed;
        self.shared.remove_if_drained(&mut state, self.id);
    }

    pub fn available(&self) -> usize {
        self.with_conn(|conn| conn.available())
    }

    pub fn capacity(&self) -> usize {
        self.with_conn(|conn| conn.capacity())
    }

    pub fn in_use(&self) -> usize {
        self.with_conn(|conn| conn.in_use)
    }

    /// Level-triggered: reflects the current availability.
    pub fn is_suspended(&self) -> bool {
        self.available() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared
            .lock()
            .connections
            .get(&self.id)
            .map_or(true, |conn| conn.closed)
    }

    /// Resolves once at least one slot is available or the connection is closed.
    pub async fn wait_for_window(&self) {
        loop {
            let notify = {
                let state = self.shared.lock();
                match state.connections.get(&self.id) {
                    Some(conn) if !conn.closed => Arc::clone(&conn.notify),
                    _ => return,
                }
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.available() > 0 || self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    fn with_conn<T: Default>(&self, f: impl FnOnce(&ConnectionWindow) -> T) -> T {
        self.shared
            .lock()
            .connections
            .get(&self.id)
            .map(f)
            .unwrap_or_default()
    }
}
