//! A uniform-grid spatial hash, for finding the particles near a point without checking
//! every particle. Points are sorted by the hash of the grid cell containing them; a
//! fixed-size table maps each hash to the start of its run in the sorted array.
//!
//! Different cells may alias to the same bucket. We accept this; the bucket scan returns
//! every point sharing the hash, and the distance filter (if enabled) rejects the ones
//! that are far away.

use bincode::{Decode, Encode};
use lin_alg::f32::Vec3;

/// Marks a table slot with no points.
pub const EMPTY_BUCKET: u32 = u32::MAX;

pub const DEFAULT_TABLE_SIZE: u32 = 262_144;

// Large odd multipliers for combining cell coordinates.
const HASH_MUL_X: u32 = 73_856_093;
const HASH_MUL_Y: u32 = 19_349_663;
const HASH_MUL_Z: u32 = 83_492_791;

/// Implemented by anything that can be placed in the hash.
pub trait HashPoint {
    fn posit(&self) -> Vec3;
    /// The cached hash of the cell containing `posit`. Must be current when building.
    fn grid_hash(&self) -> u32;
}

/// Whether a neighbor query rejects candidates farther than its radius, or returns every
/// point from the buckets it scans.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub enum NeighborFilter {
    #[default]
    Radius,
    Bucket,
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    /// Index into the slice passed to `build`.
    id: usize,
    /// Position at build time. Queries use this snapshot, not the live point.
    posit: Vec3,
    hash: u32,
}

#[derive(Debug)]
pub struct SpatialHash {
    cell_size: f32,
    table_size: u32,
    /// Index into `sorted` of the first entry with a given hash, or `EMPTY_BUCKET`.
    table: Vec<u32>,
    sorted: Vec<Entry>,
}

impl SpatialHash {
    pub fn new(cell_size: f32, table_size: u32) -> Self {
        let table_size = table_size.max(1);

        Self {
            cell_size,
            table_size,
            table: vec![EMPTY_BUCKET; table_size as usize],
            sorted: Vec::new(),
        }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    pub fn table_size(&self) -> u32 {
        self.table_size
    }

    /// Number of points in the last build.
    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn position_to_cell(&self, posit: Vec3) -> [i32; 3] {
        [
            (posit.x / self.cell_size).floor() as i32,
            (posit.y / self.cell_size).floor() as i32,
            (posit.z / self.cell_size).floor() as i32,
        ]
    }

    pub fn compute_hash(&self, cell: [i32; 3]) -> u32 {
        let h = (cell[0] as u32).wrapping_mul(HASH_MUL_X)
            ^ (cell[1] as u32).wrapping_mul(HASH_MUL_Y)
            ^ (cell[2] as u32).wrapping_mul(HASH_MUL_Z);

        h % self.table_size
    }

    pub fn hash_position(&self, posit: Vec3) -> u32 {
        self.compute_hash(self.position_to_cell(posit))
    }

    /// Rebuild from scratch. Any previous contents are discarded.
    pub fn build<T: HashPoint>(&mut self, points: &[T]) {
        self.sorted.clear();
        self.sorted.extend(points.iter().enumerate().map(|(id, p)| Entry {
            id,
            posit: p.posit(),
            hash: p.grid_hash(),
        }));

        // Stable, so points within a bucket keep their input order.
        self.sorted.sort_by_key(|e| e.hash);

        self.table.fill(EMPTY_BUCKET);

        let mut prev = None;
        for (i, entry) in self.sorted.iter().enumerate() {
            if prev != Some(entry.hash) {
                self.table[entry.hash as usize] = i as u32;
                prev = Some(entry.hash);
            }
        }
    }

    /// Append to `out` the indices (into the slice last passed to `build`) of the points
    /// near `posit`. With `NeighborFilter::Radius`, only points within `radius` are included.
    pub fn query_neighbors(
        &self,
        posit: Vec3,
        radius: f32,
        filter: NeighborFilter,
        out: &mut Vec<usize>,
    ) {
        if self.sorted.is_empty() {
            return;
        }

        let base = self.position_to_cell(posit);
        let search_r = (radius / self.cell_size).ceil() as i32;
        let radius_sq = radius * radius;

        // Several cells in the search cube may alias to one bucket; scan each bucket once.
        let side = (2 * search_r + 1) as usize;
        let mut hashes = Vec::with_capacity(side * side * side);

        for dx in -search_r..=search_r {
            for dy in -search_r..=search_r {
                for dz in -search_r..=search_r {
                    hashes.push(self.compute_hash([base[0] + dx, base[1] + dy, base[2] + dz]));
                }
            }
        }

        hashes.sort_unstable();
        hashes.dedup();

        for hash in hashes {
            let start = self.table[hash as usize];
            if start == EMPTY_BUCKET {
                continue;
            }

            for entry in &self.sorted[start as usize..] {
                if self.hash_position(entry.posit) != hash {
                    break;
                }

                let include = match filter {
                    NeighborFilter::Radius => {
                        (entry.posit - posit).magnitude_squared() <= radius_sq
                    }
                    NeighborFilter::Bucket => true,
                };

                if include {
                    out.push(entry.id);
                }
            }
        }
    }
}
