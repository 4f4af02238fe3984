//! A color per local element of a map.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::algs::collectives::all_reduce_max_u64;
use crate::algs::communicator::Communicator;
use crate::dist_error::DistError;
use crate::map::{GlobalIndex, IndexMap, LocalIndex};

pub type Color = i32;

#[derive(Clone, Debug)]
pub struct MapColoring {
    map: Arc<IndexMap>,
    colors: Vec<Color>,
    default_color: Color,
}

impl MapColoring {
    /// Every element starts with `default_color`.
    pub fn new(map: Arc<IndexMap>, default_color: Color) -> Self {
        let colors = vec![default_color; map.num_my()];
        Self {
            map,
            colors,
            default_color,
        }
    }

    pub fn from_colors(
        map: Arc<IndexMap>,
        colors: Vec<Color>,
        default_color: Color,
    ) -> Result<Self, DistError> {
        if colors.len() != map.num_my() {
            return Err(DistError::LocalLengthMismatch {
                expected: map.num_my(),
                got: colors.len(),
            });
        }
        Ok(Self {
            map,
            colors,
            default_color,
        })
    }

    pub fn map(&self) -> &Arc<IndexMap> {
        &self.map
    }

    pub fn default_color(&self) -> Color {
        self.default_color
    }

    pub fn element_colors(&self) -> &[Color] {
        &self.colors
    }

    pub fn color_of_lid(&self, lid: LocalIndex) -> Option<Color> {
        self.colors.get(lid).copied()
    }

    pub fn color_of_gid(&self, gid: GlobalIndex) -> Option<Color> {
        self.map.lid(gid).map(|l| self.colors[l])
    }

    pub fn set_color_lid(&mut self, lid: LocalIndex, color: Color) -> Result<(), DistError> {
        let len = self.colors.len();
        let slot = self
            .colors
            .get_mut(lid)
            .ok_or(DistError::LocalIndexOutOfBounds { index: lid, len })?;
        *slot = color;
        Ok(())
    }

    pub fn set_color_gid(&mut self, gid: GlobalIndex, color: Color) -> Result<(), DistError> {
        let lid = self.map.lid(gid).ok_or(DistError::GlobalIndexNotLocal(gid))?;
        self.colors[lid] = color;
        Ok(())
    }

    fn counts(&self) -> BTreeMap<Color, usize> {
        let mut counts = BTreeMap::new();
        for &c in &self.colors {
            *counts.entry(c).or_insert(0) += 1;
        }
        counts
    }

    /// Number of distinct colors on this rank.
    pub fn num_colors(&self) -> usize {
        self.counts().len()
    }

    /// Distinct local colors in ascending order.
    pub fn list_of_colors(&self) -> Vec<Color> {
        self.counts().into_keys().collect()
    }

    /// Largest local color count over all ranks. Collective.
    pub fn max_num_colors<C: Communicator>(&self, comm: &C) -> Result<usize, DistError> {
        Ok(all_reduce_max_u64(comm, self.num_colors() as u64)? as usize)
    }

    pub fn num_elements_with_color(&self, color: Color) -> usize {
        self.colors.iter().filter(|&&c| c == color).count()
    }

    /// Local indices having `color`, ascending.
    pub fn color_lid_list(&self, color: Color) -> Vec<LocalIndex> {
        self.colors
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c == color)
            .map(|(l, _)| l)
            .collect()
    }

    /// Sub-map of the indices having `color`, in local order. Collective.
    pub fn generate_map<C: Communicator>(
        &self,
        color: Color,
        comm: &C,
    ) -> Result<IndexMap, DistError> {
        let gids: Vec<u64> = self
            .color_lid_list(color)
            .into_iter()
            .map(|l| self.map.my_gids()[l])
            .collect();
        IndexMap::from_gids(None, &gids, self.map.index_base(), comm)
    }
}
