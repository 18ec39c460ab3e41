//! Ordered directory of live trampoline regions
//!
//! Regions are kept sorted by base address so a placement query can start at
//! the region nearest the requested window and probe outward, one step below
//! and one step above per round, until both directions run out.

use crate::trampoline::region::TrampolineRegion;
use crate::trampoline::EngineConfig;

pub(crate) struct RegionDirectory {
    regions: Vec<TrampolineRegion>,
}

impl RegionDirectory {
    pub fn new() -> Self {
        Self {
            regions: Vec::with_capacity(8),
        }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrampolineRegion> {
        self.regions.iter()
    }

    /// insert a region, keeping the directory sorted by base address
    pub fn insert(&mut self, region: TrampolineRegion) {
        match self.position(region.base()) {
            Ok(_) => debug_assert!(false, "region inserted twice"),
            Err(index) => self.regions.insert(index, region),
        }
    }

    /// remove a region; returns false if it was not present
    pub fn remove(&mut self, region: &TrampolineRegion) -> bool {
        match self.position(region.base()) {
            Ok(index) => {
                self.regions.remove(index);
                true
            }
            Err(_) => false,
        }
    }

    pub fn contains(&self, region: &TrampolineRegion) -> bool {
        self.position(region.base()).is_ok()
    }

    /// find an unused chunk within rel32 reach of both `lo` and `hi`
    ///
    /// starts at the region nearest the midpoint of the window and probes
    /// outward alternately until a region yields a chunk or both directions
    /// are exhausted
    pub fn find_chunk(
        &self,
        lo: usize,
        hi: usize,
        config: &EngineConfig,
    ) -> Option<(TrampolineRegion, usize)> {
        if self.regions.is_empty() {
            return None;
        }

        let mid = lo + (hi - lo) / 2;
        let mut nearest = match self.position(mid) {
            Ok(index) | Err(index) => index,
        };
        if nearest == self.regions.len() {
            nearest -= 1;
        }

        let mut below = nearest as isize;
        let mut above = nearest + 1;
        loop {
            let mut exhausted = true;

            if below >= 0 {
                exhausted = false;
                let region = self.regions[below as usize];
                if let Some(index) = region.find_free_chunk(lo, hi, config) {
                    return Some((region, index));
                }
                below -= 1;
            }
            if above < self.regions.len() {
                exhausted = false;
                let region = self.regions[above];
                if let Some(index) = region.find_free_chunk(lo, hi, config) {
                    return Some((region, index));
                }
                above += 1;
            }

            if exhausted {
                return None;
            }
        }
    }

    fn position(&self, base: usize) -> core::result::Result<usize, usize> {
        self.regions.binary_search_by(|region| region.base().cmp(&base))
    }
}
