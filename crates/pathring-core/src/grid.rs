//! Grid dependency scheduler.
//!
//! A grid is one batch of asynchronous device work. Grids form a DAG through
//! happens-after edges, either directly or through the handle a grid will
//! produce. The scheduler only tracks state; owner callbacks are queued as
//! [`GridEvent`]s and delivered later by the runtime's dispatcher, so no
//! callback ever runs while the scheduler is borrowed.
//!
//! ```text
//!   READY --(edge or start)--> WAITING --(no pending deps, started)--> EXECUTING
//!                                                                         |
//!                                                      complete() <-------+
//!                                                         |
//!                                                      COMPLETE --(dispose delivered)--> recycled
//! ```

use std::collections::VecDeque;

use tracing::trace;

use crate::error::{PathRingError, Result};
use crate::handle::Handle;
use crate::runtime::Runtime;

/// Index of a registered grid owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(pub u32);

/// Generation-checked reference to a grid slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridId {
    index: u32,
    generation: u32,
}

impl GridId {
    /// Slot index.
    pub fn index(self) -> u32 {
        self.index
    }
}

/// Grid lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridState {
    /// Attached, nothing depends on it yet.
    Ready,
    /// Has dependencies or a pending start.
    Waiting,
    /// Work launched.
    Executing,
    /// Work confirmed by the device.
    Complete,
}

/// Which owner callback an event delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// First transition into WAITING.
    Waiting,
    /// Transition into EXECUTING.
    Execute,
    /// The grid completed; its slot is recycled after delivery.
    Dispose,
}

/// A queued owner callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridEvent {
    /// The grid.
    pub grid: GridId,
    /// Owner that receives the callback.
    pub owner: OwnerId,
    /// Owner data passed at attach.
    pub data: usize,
    /// Callback to run.
    pub kind: EventKind,
}

/// Callbacks of a grid owner. Each runs from the dispatcher with the runtime
/// borrowed mutably.
pub trait GridOwner {
    /// Owner id assigned at registration.
    fn owner_id(&self) -> OwnerId;

    /// The grid gained its first dependency or was started. Owners flush
    /// pending work here so dependents cannot deadlock on them.
    fn on_waiting(&mut self, _rt: &mut Runtime, _grid: GridId, _data: usize) -> Result<()> {
        Ok(())
    }

    /// Every dependency has completed and the grid was started.
    fn on_execute(&mut self, _rt: &mut Runtime, _grid: GridId, _data: usize) -> Result<()> {
        Ok(())
    }

    /// The grid completed. Runs exactly once.
    fn on_dispose(&mut self, _rt: &mut Runtime, _grid: GridId, _data: usize) -> Result<()> {
        Ok(())
    }

    /// False while the owner is in a state where it must not be re-entered
    /// with waiting or execute callbacks.
    fn can_dispatch(&self) -> bool {
        true
    }
}

/// Scheduler statistics.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Grids attached.
    pub attached: u64,
    /// Grids completed.
    pub completed: u64,
    /// Happens-after edges recorded.
    pub edges: u64,
    /// Grids currently occupying a slot.
    pub live: u64,
}

#[derive(Debug)]
struct Grid {
    generation: u32,
    live: bool,
    owner: OwnerId,
    data: usize,
    state: GridState,
    start_requested: bool,
    waiting_fired: bool,
    /// Unresolved dependencies.
    pending: u32,
    befores: Vec<GridId>,
    afters: Vec<GridId>,
    mapped: Vec<Handle>,
}

impl Grid {
    fn vacant() -> Self {
        Self {
            generation: 0,
            live: false,
            owner: OwnerId(0),
            data: 0,
            state: GridState::Complete,
            start_requested: false,
            waiting_fired: false,
            pending: 0,
            befores: Vec::new(),
            afters: Vec::new(),
            mapped: Vec::new(),
        }
    }
}

/// Fixed-capacity pool of grids with a handle-to-grid map.
#[derive(Debug)]
pub struct GridScheduler {
    grids: Vec<Grid>,
    free: Vec<u32>,
    handle_map: Vec<Option<GridId>>,
    events: VecDeque<GridEvent>,
    stats: SchedulerStats,
}

impl GridScheduler {
    /// Creates a scheduler with `capacity` grid slots covering `handles`
    /// handles.
    pub fn new(capacity: u32, handles: u32) -> Self {
        Self {
            grids: (0..capacity).map(|_| Grid::vacant()).collect(),
            free: (0..capacity).rev().collect(),
            handle_map: vec![None; handles as usize],
            events: VecDeque::new(),
            stats: SchedulerStats::default(),
        }
    }

    fn get(&self, id: GridId) -> Option<&Grid> {
        self.grids
            .get(id.index as usize)
            .filter(|g| g.live && g.generation == id.generation)
    }

    fn get_mut(&mut self, id: GridId) -> Option<&mut Grid> {
        self.grids
            .get_mut(id.index as usize)
            .filter(|g| g.live && g.generation == id.generation)
    }

    fn lookup(&self, id: GridId) -> Result<&Grid> {
        self.get(id)
            .ok_or_else(|| PathRingError::InvalidGrid(format!("stale grid {id:?}")))
    }

    fn emit(&mut self, grid: GridId, kind: EventKind) {
        if let Some(g) = self.get(grid) {
            let event = GridEvent {
                grid,
                owner: g.owner,
                data: g.data,
                kind,
            };
            trace!(index = grid.index, ?kind, "grid event");
            self.events.push_back(event);
        }
    }

    /// Attaches a READY grid, or returns `None` when every slot is in use.
    pub fn try_attach(&mut self, owner: OwnerId, data: usize) -> Option<GridId> {
        let index = self.free.pop()?;
        let g = &mut self.grids[index as usize];
        g.generation = g.generation.wrapping_add(1);
        g.live = true;
        g.owner = owner;
        g.data = data;
        g.state = GridState::Ready;
        g.start_requested = false;
        g.waiting_fired = false;
        g.pending = 0;
        g.befores.clear();
        g.afters.clear();
        g.mapped.clear();

        self.stats.attached += 1;
        self.stats.live += 1;
        trace!(index, owner = owner.0, data, "grid attach");
        Some(GridId {
            index,
            generation: g.generation,
        })
    }

    /// Current state, or `None` once the slot is recycled.
    pub fn state(&self, grid: GridId) -> Option<GridState> {
        self.get(grid).map(|g| g.state)
    }

    /// True while a grid may still gain dependencies without already being
    /// committed to execute.
    pub fn accepts_dependencies(&self, grid: GridId) -> bool {
        match self.get(grid) {
            Some(g) => {
                g.state == GridState::Ready
                    || (g.state == GridState::Waiting && !g.start_requested)
            }
            None => false,
        }
    }

    fn enter_waiting(&mut self, grid: GridId) {
        let Some(g) = self.get_mut(grid) else {
            return;
        };
        if g.state == GridState::Ready {
            g.state = GridState::Waiting;
        }
        if !g.waiting_fired {
            g.waiting_fired = true;
            self.emit(grid, EventKind::Waiting);
        }
    }

    /// Records that `after` must not execute before `before` completes.
    pub fn happens_after_grid(&mut self, after: GridId, before: GridId) -> Result<()> {
        let state = self.lookup(after)?.state;
        if !matches!(state, GridState::Ready | GridState::Waiting) {
            return Err(PathRingError::InvalidGrid(format!(
                "cannot add a dependency to a {state:?} grid"
            )));
        }
        if after == before {
            return Err(PathRingError::InvalidGrid("grid depends on itself".into()));
        }

        match self.get_mut(before) {
            Some(b) if b.state != GridState::Complete => b.afters.push(after),
            _ => return Ok(()),
        }
        if let Some(a) = self.get_mut(after) {
            a.pending += 1;
            a.befores.push(before);
        }
        self.stats.edges += 1;
        trace!(after = after.index, before = before.index, "grid edge");
        self.enter_waiting(after);
        Ok(())
    }

    /// Records that `after` must not execute before the grid producing
    /// `handle` completes. A handle mapped to no grid is already satisfied.
    pub fn happens_after_handle(&mut self, after: GridId, handle: Handle) -> Result<()> {
        match self.handle_map.get(handle as usize).copied().flatten() {
            Some(before) => self.happens_after_grid(after, before),
            None => {
                self.lookup(after)?;
                Ok(())
            }
        }
    }

    /// The grid currently producing `handle`.
    pub fn grid_of(&self, handle: Handle) -> Option<GridId> {
        self.handle_map.get(handle as usize).copied().flatten()
    }

    /// Maps a handle onto a grid until the grid completes.
    pub fn map(&mut self, grid: GridId, handle: Handle) -> Result<()> {
        if handle as usize >= self.handle_map.len() {
            return Err(PathRingError::HandleInvalid { handle });
        }
        let g = self
            .get_mut(grid)
            .ok_or_else(|| PathRingError::InvalidGrid(format!("stale grid {grid:?}")))?;
        if g.state == GridState::Complete {
            return Err(PathRingError::InvalidGrid(
                "cannot map a handle onto a complete grid".into(),
            ));
        }
        g.mapped.push(handle);
        self.handle_map[handle as usize] = Some(grid);
        Ok(())
    }

    /// Requests execution. Fires the waiting callback on the first call and
    /// executes at once when nothing is pending.
    pub fn start(&mut self, grid: GridId) {
        let Some(g) = self.get_mut(grid) else {
            return;
        };
        if !matches!(g.state, GridState::Ready | GridState::Waiting) || g.start_requested {
            return;
        }
        g.start_requested = true;
        self.enter_waiting(grid);
        self.try_execute(grid);
    }

    fn try_execute(&mut self, grid: GridId) {
        let Some(g) = self.get_mut(grid) else {
            return;
        };
        if g.state == GridState::Waiting && g.start_requested && g.pending == 0 {
            g.state = GridState::Executing;
            self.emit(grid, EventKind::Execute);
        }
    }

    /// Starts a grid and, transitively, every unresolved dependency.
    pub fn force(&mut self, grid: GridId) {
        let mut stack = vec![grid];
        while let Some(id) = stack.pop() {
            let Some(g) = self.get(id) else {
                continue;
            };
            if g.state == GridState::Complete {
                continue;
            }
            let befores: Vec<GridId> = g
                .befores
                .iter()
                .copied()
                .filter(|&b| self.get(b).is_some_and(|bg| bg.state != GridState::Complete))
                .collect();
            self.start(id);
            stack.extend(befores);
        }
    }

    /// Marks an executing grid complete: unmaps its handles, releases its
    /// dependents and queues its dispose callback.
    pub fn complete(&mut self, grid: GridId) -> Result<()> {
        let g = self
            .get_mut(grid)
            .ok_or_else(|| PathRingError::InvalidGrid(format!("stale grid {grid:?}")))?;
        if g.state != GridState::Executing {
            return Err(PathRingError::InvalidGrid(format!(
                "cannot complete a {:?} grid",
                g.state
            )));
        }
        g.state = GridState::Complete;
        let mapped = std::mem::take(&mut g.mapped);
        let afters = std::mem::take(&mut g.afters);

        for h in mapped {
            if self.handle_map[h as usize] == Some(grid) {
                self.handle_map[h as usize] = None;
            }
        }
        for after in afters {
            if let Some(a) = self.get_mut(after) {
                a.pending -= 1;
            }
            self.try_execute(after);
        }

        self.stats.completed += 1;
        trace!(index = grid.index, "grid complete");
        self.emit(grid, EventKind::Dispose);
        Ok(())
    }

    /// Frees the slot of a complete grid once its dispose callback returned.
    pub fn recycle(&mut self, grid: GridId) {
        let Some(g) = self.get_mut(grid) else {
            return;
        };
        debug_assert_eq!(g.state, GridState::Complete);
        g.live = false;
        g.befores.clear();
        self.free.push(grid.index);
        self.stats.live -= 1;
    }

    /// Grids that have not completed.
    pub fn live(&self) -> Vec<GridId> {
        self.grids
            .iter()
            .enumerate()
            .filter(|(_, g)| g.live && g.state != GridState::Complete)
            .map(|(i, g)| GridId {
                index: i as u32,
                generation: g.generation,
            })
            .collect()
    }

    /// True when no slot is occupied and no event is queued.
    pub fn is_idle(&self) -> bool {
        self.stats.live == 0 && self.events.is_empty()
    }

    /// Takes every queued event.
    pub fn take_events(&mut self) -> VecDeque<GridEvent> {
        std::mem::take(&mut self.events)
    }

    /// Puts undelivered events back ahead of any queued since.
    pub fn requeue(&mut self, mut events: VecDeque<GridEvent>) {
        events.append(&mut self.events);
        self.events = events;
    }

    /// True when events are queued.
    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Number of queued events.
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> SchedulerStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(s: &mut GridScheduler) -> Vec<(u32, EventKind)> {
        s.take_events()
            .into_iter()
            .map(|e| (e.grid.index(), e.kind))
            .collect()
    }

    #[test]
    fn test_start_without_deps_executes() {
        let mut s = GridScheduler::new(4, 16);
        let g = s.try_attach(OwnerId(0), 7).unwrap();
        assert_eq!(s.state(g), Some(GridState::Ready));

        s.start(g);
        assert_eq!(s.state(g), Some(GridState::Executing));
        let events = s.take_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Waiting);
        assert_eq!(events[1].kind, EventKind::Execute);
        assert_eq!(events[1].data, 7);
    }

    #[test]
    fn test_waiting_fires_once() {
        let mut s = GridScheduler::new(4, 16);
        let a = s.try_attach(OwnerId(0), 0).unwrap();
        let b = s.try_attach(OwnerId(1), 0).unwrap();
        let c = s.try_attach(OwnerId(1), 0).unwrap();

        s.happens_after_grid(a, b).unwrap();
        s.happens_after_grid(a, c).unwrap();
        s.start(a);
        assert_eq!(s.state(a), Some(GridState::Waiting));
        assert_eq!(kinds(&mut s), vec![(a.index(), EventKind::Waiting)]);
        assert!(!s.accepts_dependencies(a));
    }

    #[test]
    fn test_dependency_on_executing_handle() {
        let mut s = GridScheduler::new(4, 16);
        let producer = s.try_attach(OwnerId(0), 0).unwrap();
        s.map(producer, 3).unwrap();
        s.start(producer);
        assert_eq!(s.state(producer), Some(GridState::Executing));
        s.take_events();

        let consumer = s.try_attach(OwnerId(1), 0).unwrap();
        s.happens_after_handle(consumer, 3).unwrap();
        s.start(consumer);
        assert_eq!(s.state(consumer), Some(GridState::Waiting));
        assert!(!kinds(&mut s).contains(&(consumer.index(), EventKind::Execute)));

        s.complete(producer).unwrap();
        assert_eq!(s.state(consumer), Some(GridState::Executing));
        assert_eq!(s.grid_of(3), None);
        let events = kinds(&mut s);
        assert!(events.contains(&(consumer.index(), EventKind::Execute)));
        assert!(events.contains(&(producer.index(), EventKind::Dispose)));
    }

    #[test]
    fn test_unmapped_handle_is_satisfied() {
        let mut s = GridScheduler::new(4, 16);
        let g = s.try_attach(OwnerId(0), 0).unwrap();
        s.happens_after_handle(g, 5).unwrap();
        assert_eq!(s.state(g), Some(GridState::Ready));
        assert!(s.take_events().is_empty());
    }

    #[test]
    fn test_edge_to_complete_grid_is_noop() {
        let mut s = GridScheduler::new(4, 16);
        let a = s.try_attach(OwnerId(0), 0).unwrap();
        let b = s.try_attach(OwnerId(0), 0).unwrap();
        s.start(b);
        s.complete(b).unwrap();

        s.happens_after_grid(a, b).unwrap();
        assert_eq!(s.state(a), Some(GridState::Ready));
        assert_eq!(s.stats().edges, 0);
    }

    #[test]
    fn test_force_starts_dependencies() {
        let mut s = GridScheduler::new(4, 16);
        let a = s.try_attach(OwnerId(0), 0).unwrap();
        let b = s.try_attach(OwnerId(1), 0).unwrap();
        let c = s.try_attach(OwnerId(2), 0).unwrap();
        s.happens_after_grid(a, b).unwrap();
        s.happens_after_grid(b, c).unwrap();

        s.force(a);
        assert_eq!(s.state(c), Some(GridState::Executing));
        assert_eq!(s.state(b), Some(GridState::Waiting));

        s.complete(c).unwrap();
        assert_eq!(s.state(b), Some(GridState::Executing));
        s.complete(b).unwrap();
        assert_eq!(s.state(a), Some(GridState::Executing));
    }

    #[test]
    fn test_complete_once_and_recycle() {
        let mut s = GridScheduler::new(1, 16);
        let g = s.try_attach(OwnerId(0), 0).unwrap();
        assert!(s.try_attach(OwnerId(0), 0).is_none());

        assert!(s.complete(g).is_err());
        s.start(g);
        s.complete(g).unwrap();
        assert!(s.complete(g).is_err());

        let disposes = kinds(&mut s)
            .into_iter()
            .filter(|(_, k)| *k == EventKind::Dispose)
            .count();
        assert_eq!(disposes, 1);

        s.recycle(g);
        assert_eq!(s.state(g), None);
        let h = s.try_attach(OwnerId(0), 0).unwrap();
        assert_eq!(h.index(), g.index());
        assert_ne!(h, g);
        assert!(s.complete(g).is_err());
    }

    #[test]
    fn test_rejects_edges_on_started_grid() {
        let mut s = GridScheduler::new(4, 16);
        let a = s.try_attach(OwnerId(0), 0).unwrap();
        let b = s.try_attach(OwnerId(0), 0).unwrap();
        s.start(a);
        assert!(matches!(
            s.happens_after_grid(a, b),
            Err(PathRingError::InvalidGrid(_))
        ));
        assert!(s.happens_after_grid(b, b).is_err());
    }

    #[test]
    fn test_requeue_preserves_order() {
        let mut s = GridScheduler::new(4, 16);
        let a = s.try_attach(OwnerId(0), 0).unwrap();
        let b = s.try_attach(OwnerId(0), 0).unwrap();
        s.start(a);
        let held = s.take_events();
        s.start(b);
        s.requeue(held);
        let order: Vec<u32> = kinds(&mut s).into_iter().map(|(i, _)| i).collect();
        assert_eq!(order, vec![a.index(), a.index(), b.index(), b.index()]);
    }
}
