//! Raster builder: a dependency client of the path builders.
//!
//! Rasters are grouped into cohorts, one grid per cohort. Adding a path
//! takes a device reference on it and records an edge from the path's grid
//! to the cohort grid, so a cohort executes only after every path it reads
//! has been copied to the device.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::{debug, trace, warn};

use crate::device::{Kernel, RasterCmd};
use crate::error::{PathRingError, Result};
use crate::grid::{GridId, GridOwner, OwnerId};
use crate::handle::{Handle, HandleType, Path, Raster, TypedHandle};
use crate::runtime::{CompletionAction, Runtime, SharedRuntime};
use crate::suballocator::SubbufId;

/// Raster builder statistics.
#[derive(Debug, Clone, Default)]
pub struct RasterBuilderStats {
    /// Rasters ended.
    pub rasters: u64,
    /// Path references taken.
    pub paths: u64,
    /// Cohorts attached.
    pub cohorts: u64,
    /// Build launches.
    pub launches: u64,
}

#[derive(Debug)]
struct Cohort {
    grid: GridId,
    paths: Vec<Handle>,
    rasters: Vec<RasterCmd>,
    raster_handles: Vec<Handle>,
    staged: Option<SubbufId>,
}

struct CohortBuilder {
    id: OwnerId,
    cohort_rasters: usize,
    cohorts: Vec<Option<Cohort>>,
    current: Option<usize>,
    in_raster: bool,
    /// Paths of the raster being built.
    open: Vec<Handle>,
    /// Cohort the open paths have edges to.
    open_cohort: Option<usize>,
    busy: bool,
    released: bool,
    stats: RasterBuilderStats,
}

impl CohortBuilder {
    fn check(&self) -> Result<()> {
        if self.released {
            return Err(PathRingError::ReleasedBuilder);
        }
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        self.check()?;
        self.in_raster = true;
        Ok(())
    }

    /// Index of a cohort still accepting dependencies, attaching one if
    /// needed.
    fn cohort(&mut self, rt: &mut Runtime) -> Result<usize> {
        if let Some(slot) = self.current {
            if let Some(cohort) = &self.cohorts[slot] {
                if rt.grids().accepts_dependencies(cohort.grid) {
                    return Ok(slot);
                }
            }
            self.current = None;
        }

        let slot = match self.cohorts.iter().position(Option::is_none) {
            Some(slot) => slot,
            None => {
                self.cohorts.push(None);
                self.cohorts.len() - 1
            }
        };
        let grid = rt.attach(self.id, slot, Some(self))?;
        self.cohorts[slot] = Some(Cohort {
            grid,
            paths: Vec::new(),
            rasters: Vec::new(),
            raster_handles: Vec::new(),
            staged: None,
        });
        self.current = Some(slot);
        self.stats.cohorts += 1;
        trace!(slot, grid = grid.index(), "cohort attached");
        Ok(slot)
    }

    fn grid(&self, slot: usize) -> Result<GridId> {
        self.cohorts[slot]
            .as_ref()
            .map(|c| c.grid)
            .ok_or_else(|| PathRingError::InvalidGrid(format!("cohort {slot} is not attached")))
    }

    fn add(&mut self, rt: &mut Runtime, paths: &[Path]) -> Result<()> {
        self.check()?;
        if !self.in_raster {
            self.begin()?;
        }
        let raws: Vec<u32> = paths.iter().map(|p| p.raw()).collect();
        let handles = rt.handles().device_validate(&raws, HandleType::Path)?;

        let slot = self.cohort(rt)?;
        if self.open_cohort != Some(slot) {
            self.rebind_open(rt, slot)?;
        }
        let grid = self.grid(slot)?;
        for &handle in &handles {
            rt.grids_mut().happens_after_handle(grid, handle)?;
        }
        // referenced only once the cohort depends on them
        rt.device_retain(&raws, HandleType::Path)?;
        self.stats.paths += handles.len() as u64;
        self.open.extend(handles);
        Ok(())
    }

    /// Records edges from the open paths to a new cohort.
    fn rebind_open(&mut self, rt: &mut Runtime, slot: usize) -> Result<()> {
        let grid = self.grid(slot)?;
        for &handle in &self.open {
            rt.grids_mut().happens_after_handle(grid, handle)?;
        }
        self.open_cohort = Some(slot);
        Ok(())
    }

    fn end(&mut self, rt: &mut Runtime) -> Result<Raster> {
        self.check()?;
        if !self.in_raster {
            self.begin()?;
        }
        // acquired with one host and one device reference; the device one
        // is dropped when the cohort is disposed
        let handle = rt.acquire_handle(Some(self))?;
        let raster = Raster::from_handle(handle);

        let slot = self.cohort(rt)?;
        if self.open_cohort != Some(slot) {
            self.rebind_open(rt, slot)?;
        }
        let grid = self.grid(slot)?;
        rt.grids_mut().map(grid, handle)?;

        let cohort = self.cohorts[slot]
            .as_mut()
            .ok_or_else(|| PathRingError::InvalidGrid(format!("cohort {slot} is not attached")))?;
        cohort.rasters.push(RasterCmd {
            raster: handle,
            first: cohort.paths.len() as u32,
            count: self.open.len() as u32,
        });
        cohort.paths.append(&mut self.open);
        cohort.raster_handles.push(handle);
        let full = cohort.rasters.len() >= self.cohort_rasters;

        self.in_raster = false;
        self.open_cohort = None;
        self.stats.rasters += 1;
        debug!(raster = handle, slot, "raster end");

        if full {
            trace!(grid = grid.index(), "cohort full, forcing");
            rt.grids_mut().force(grid);
            self.current = None;
        }
        Ok(raster)
    }

    fn release(&mut self, rt: &mut Runtime) -> Result<()> {
        if self.released {
            return Ok(());
        }
        if !self.open.is_empty() {
            let open = std::mem::take(&mut self.open);
            rt.device_release(&open, HandleType::Path)?;
        }
        self.current = None;
        let grids: Vec<GridId> = self.cohorts.iter().flatten().map(|c| c.grid).collect();
        for grid in grids {
            rt.grids_mut().force(grid);
        }
        while self.cohorts.iter().any(Option::is_some) {
            rt.yield_now(Some(self))?;
        }
        rt.unregister_owner(self.id);
        self.released = true;
        debug!(owner = self.id.0, rasters = self.stats.rasters, "raster builder released");
        Ok(())
    }
}

impl GridOwner for CohortBuilder {
    fn owner_id(&self) -> OwnerId {
        self.id
    }

    /// A waiting cohort keeps collecting rasters until it is started,
    /// forced or full.
    fn on_waiting(&mut self, _rt: &mut Runtime, grid: GridId, data: usize) -> Result<()> {
        trace!(grid = grid.index(), slot = data, "cohort waiting");
        Ok(())
    }

    fn on_execute(&mut self, rt: &mut Runtime, grid: GridId, data: usize) -> Result<()> {
        let (paths, rasters) = match &self.cohorts[data] {
            Some(cohort) => (cohort.paths.clone(), cohort.rasters.clone()),
            None => {
                return Err(PathRingError::InvalidGrid(format!(
                    "cohort {data} executed while detached"
                )))
            }
        };
        if rasters.is_empty() {
            return rt.grids_mut().complete(grid);
        }

        self.busy = true;
        let span = rt.temp_acquire(paths.len().max(1), Some(self));
        self.busy = false;
        let span = span?;
        rt.temp_slice_mut(&span)[..paths.len()].copy_from_slice(&paths);
        let staged = rt.temp_slice(&span)[..paths.len()].to_vec();
        if let Some(cohort) = self.cohorts[data].as_mut() {
            cohort.staged = Some(span.id);
        }

        let queue = rt.acquire_queue()?;
        debug!(
            grid = grid.index(),
            rasters = rasters.len(),
            paths = staged.len(),
            "launch rasters build"
        );
        rt.launch(
            queue,
            Kernel::RastersBuild {
                paths: staged,
                rasters,
            },
            CompletionAction::GridComplete(grid),
        )?;
        rt.device().flush(queue)?;
        rt.release_queue(queue);
        self.stats.launches += 1;
        Ok(())
    }

    fn on_dispose(&mut self, rt: &mut Runtime, _grid: GridId, data: usize) -> Result<()> {
        let Some(cohort) = self.cohorts[data].take() else {
            return Ok(());
        };
        rt.device_release(&cohort.paths, HandleType::Path)?;
        rt.device_release(&cohort.raster_handles, HandleType::Raster)?;
        if let Some(id) = cohort.staged {
            rt.temp_release(id)?;
        }
        Ok(())
    }

    fn can_dispatch(&self) -> bool {
        !self.busy
    }
}

/// Builds rasters over previously ended paths.
pub struct RasterBuilder {
    rt: SharedRuntime,
    imp: Rc<RefCell<CohortBuilder>>,
    released: bool,
}

impl RasterBuilder {
    /// Creates a raster builder on the runtime.
    pub fn new(rt: &SharedRuntime) -> Result<Self> {
        let mut runtime = rt.borrow_mut();
        runtime.check()?;
        let id = runtime.reserve_owner();
        let imp = Rc::new(RefCell::new(CohortBuilder {
            id,
            cohort_rasters: runtime.config().raster.cohort_rasters as usize,
            cohorts: Vec::new(),
            current: None,
            in_raster: false,
            open: Vec::new(),
            open_cohort: None,
            busy: false,
            released: false,
            stats: RasterBuilderStats::default(),
        }));
        let owner = Rc::downgrade(&imp) as Weak<RefCell<dyn GridOwner>>;
        runtime.register_owner(id, owner);
        drop(runtime);

        Ok(Self {
            rt: Rc::clone(rt),
            imp,
            released: false,
        })
    }

    fn with<T>(&self, f: impl FnOnce(&mut CohortBuilder, &mut Runtime) -> Result<T>) -> Result<T> {
        if self.released {
            return Err(PathRingError::ReleasedBuilder);
        }
        let mut rt = self.rt.borrow_mut();
        let mut imp = self.imp.borrow_mut();
        f(&mut imp, &mut rt)
    }

    /// Starts a raster.
    pub fn begin(&mut self) -> Result<()> {
        self.with(|imp, _| imp.begin())
    }

    /// Adds paths to the raster being built.
    pub fn add(&mut self, paths: &[Path]) -> Result<()> {
        self.with(|imp, rt| imp.add(rt, paths))
    }

    /// Finishes the raster.
    pub fn end(&mut self) -> Result<Raster> {
        let raster = self.with(|imp, rt| imp.end(rt))?;
        self.rt.borrow_mut().dispatch(None)?;
        Ok(raster)
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> RasterBuilderStats {
        self.imp.borrow().stats.clone()
    }

    /// Builds pending cohorts, waits for them and frees the builder.
    pub fn release(mut self) -> Result<()> {
        let result = self.with(|imp, rt| imp.release(rt));
        self.released = true;
        result
    }
}

impl std::fmt::Debug for RasterBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RasterBuilder")
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for RasterBuilder {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let (Ok(mut rt), Ok(mut imp)) = (self.rt.try_borrow_mut(), self.imp.try_borrow_mut())
        else {
            return;
        };
        if let Err(err) = imp.release(&mut rt) {
            warn!(error = %err, "raster builder release on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::grid::GridState;
    use crate::path_builder::PathBuilder;
    use crate::testing::ImmediateDevice;
    use std::sync::Arc;

    fn runtime() -> (Arc<ImmediateDevice>, SharedRuntime) {
        let device = Arc::new(ImmediateDevice::new());
        let rt = Runtime::new(RuntimeConfig::minimal(), device.clone())
            .unwrap()
            .into_shared();
        (device, rt)
    }

    fn path(pb: &mut PathBuilder, x: f32) -> Path {
        pb.begin().unwrap();
        pb.line([x, 0.0, x + 1.0, 1.0]).unwrap();
        pb.end().unwrap()
    }

    #[test]
    fn test_cohort_runs_after_paths_copied() {
        let (device, rt) = runtime();
        let mut pb = PathBuilder::new(&rt).unwrap();
        let mut rb = RasterBuilder::new(&rt).unwrap();

        for i in 0..4 {
            let p = path(&mut pb, i as f32);
            rb.begin().unwrap();
            rb.add(&[p]).unwrap();
            rb.end().unwrap();
        }
        rt.borrow_mut().wait_idle().unwrap();

        let launched = device.launched();
        let copy = launched.iter().position(|k| *k == "paths_copy").unwrap();
        let build = launched.iter().position(|k| *k == "rasters_build").unwrap();
        assert!(copy < build);

        let rasters = device
            .kernels()
            .into_iter()
            .find_map(|k| match k {
                Kernel::RastersBuild { paths, rasters } => Some((paths, rasters)),
                _ => None,
            })
            .unwrap();
        assert_eq!(rasters.0.len(), 4);
        assert_eq!(rasters.1.len(), 4);
        assert_eq!(rasters.1[3].first, 3);
        assert_eq!(rasters.1[3].count, 1);
        assert_eq!(rb.stats().cohorts, 1);
    }

    #[test]
    fn test_device_references_dropped_after_build() {
        let (_device, rt) = runtime();
        let mut pb = PathBuilder::new(&rt).unwrap();
        let mut rb = RasterBuilder::new(&rt).unwrap();

        let p = path(&mut pb, 0.0);
        rb.add(&[p, p]).unwrap();
        let r = rb.end().unwrap();
        rt.borrow_mut().wait_idle().unwrap();

        let rt = rt.borrow();
        let path_rc = rt.handles().refcount(p.handle().unwrap()).unwrap();
        assert_eq!((path_rc.host(), path_rc.device()), (1, 0));
        let raster_rc = rt.handles().refcount(r.handle().unwrap()).unwrap();
        assert_eq!((raster_rc.host(), raster_rc.device()), (1, 0));
    }

    #[test]
    fn test_raster_reclaimed_after_host_release() {
        let (device, rt) = runtime();
        let mut pb = PathBuilder::new(&rt).unwrap();
        let mut rb = RasterBuilder::new(&rt).unwrap();

        let p = path(&mut pb, 0.0);
        rb.add(&[p]).unwrap();
        let r = rb.end().unwrap();
        {
            let rt = rt.borrow();
            let rc = rt.handles().refcount(r.handle().unwrap()).unwrap();
            assert_eq!((rc.host(), rc.device()), (1, 1));
        }

        let mut rt = rt.borrow_mut();
        rt.wait_idle().unwrap();
        rt.release(&[r.raw()], HandleType::Raster).unwrap();
        rt.wait_idle().unwrap();

        assert!(rt.handles().refcount(r.handle().unwrap()).unwrap().is_zero());
        assert_eq!(rt.stats().handles.reclaimed, 1);
        let reclaimed = device.kernels().into_iter().any(|k| {
            matches!(k, Kernel::RastersReclaim { handles } if handles.contains(&r.handle().unwrap()))
        });
        assert!(reclaimed);
    }

    #[test]
    fn test_waiting_cohort_keeps_collecting() {
        let (_device, rt) = runtime();
        let mut pb = PathBuilder::new(&rt).unwrap();
        let mut rb = RasterBuilder::new(&rt).unwrap();

        // the paths are not copied yet, so the cohort waits on them
        for i in 0..3 {
            let p = path(&mut pb, i as f32);
            rb.add(&[p]).unwrap();
            rb.end().unwrap();
        }
        let grid = {
            let imp = rb.imp.borrow();
            let slot = imp.current.unwrap();
            imp.cohorts[slot].as_ref().unwrap().grid
        };
        assert_eq!(rt.borrow().grids().state(grid), Some(GridState::Waiting));
        assert_eq!(rb.stats().cohorts, 1);

        // the fourth raster fills it and the fifth opens another
        for i in 3..5 {
            let p = path(&mut pb, i as f32);
            rb.add(&[p]).unwrap();
            rb.end().unwrap();
        }
        assert_eq!(rb.stats().cohorts, 2);

        rb.release().unwrap();
        assert!(rt.borrow().grids().state(grid).is_none());
    }

    #[test]
    fn test_failed_add_takes_no_references() {
        let (_device, rt) = runtime();
        let mut pb = PathBuilder::new(&rt).unwrap();
        let mut rb = RasterBuilder::new(&rt).unwrap();

        let p = path(&mut pb, 0.0);
        rt.borrow_mut().wait_idle().unwrap();
        {
            // no grid is left for a cohort
            let mut rt = rt.borrow_mut();
            let squatter = rt.reserve_owner();
            while rt.grids_mut().try_attach(squatter, 0).is_some() {}
        }

        let err = rb.add(&[p]).unwrap_err();
        assert!(matches!(err, PathRingError::Stalled(_)));
        let rt = rt.borrow();
        let rc = rt.handles().refcount(p.handle().unwrap()).unwrap();
        assert_eq!((rc.host(), rc.device()), (1, 0));
    }

    #[test]
    fn test_add_rejects_raster_handles() {
        let (_device, rt) = runtime();
        let mut rb = RasterBuilder::new(&rt).unwrap();
        let bogus = Path::from_raw(Raster::from_handle(3).raw());
        let err = rb.add(&[bogus]).unwrap_err();
        assert!(err.is_validation_error());
    }

    #[test]
    fn test_release_discards_open_raster() {
        let (_device, rt) = runtime();
        let mut pb = PathBuilder::new(&rt).unwrap();
        let mut rb = RasterBuilder::new(&rt).unwrap();

        let p = path(&mut pb, 0.0);
        rb.begin().unwrap();
        rb.add(&[p]).unwrap();
        rb.release().unwrap();
        rt.borrow_mut().wait_idle().unwrap();

        let rt = rt.borrow();
        assert_eq!(rt.handles().refcount(p.handle().unwrap()).unwrap().device(), 0);
    }
}
