//! Surface extraction. A fixed lattice of sample points covers the domain; each step we
//! sample a colour field (an SPH-smoothed indicator of the fluid) at every point, then
//! triangulate the iso-surface with marching cubes.
//!
//! Triangulation is split into slabs along the x axis, one per worker. Each slab keeps its
//! own map from edge key to (vertex position, summed face normal), and records triangles as
//! edge keys. After all slabs finish, the maps are merged by key, so an edge on a slab
//! boundary ends up with one position and the normal contributions from both sides; the
//! triangles are then resolved to vertices.

use std::ops::Range;

use bincode::{Decode, Encode};
use bytemuck::{Pod, Zeroable};
use lin_alg::f32::Vec3;
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::{
    kernels::KernelConsts,
    particle::{vec_to_arr, Particle},
    spatial_hash::{NeighborFilter, SpatialHash},
    tables::{CORNER_OFFSETS, CUBE_EDGES, EDGE_TABLE, TRI_END, TRI_TABLE},
    util, Config,
};

/// Interpolation falls back to an endpoint when a difference is smaller than this.
const INTERP_EPS: f32 = 1e-5;
/// Normals shorter than this are treated as degenerate, and skipped.
const NORMAL_EPS: f32 = 1e-12;

#[derive(Clone, Debug)]
pub struct CubeCell {
    pub posit: Vec3,
    pub color: f32,
    /// Particle indices, rebuilt each step from the shared hash.
    pub neighbors: Vec<usize>,
}

/// The lattice edge between two corner indices, regardless of direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeKey(usize, usize);

impl EdgeKey {
    pub fn new(a: usize, b: usize) -> Self {
        if a <= b {
            Self(a, b)
        } else {
            Self(b, a)
        }
    }

    pub fn corners(&self) -> (usize, usize) {
        (self.0, self.1)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EdgeVertex {
    pub posit: Vec3,
    /// Sum of the unit normals of every triangle using this vertex. Not normalized.
    pub normal_sum: Vec3,
}

/// The output of one triangulation worker.
#[derive(Debug, Default)]
pub struct SlabMesh {
    pub edges: FxHashMap<EdgeKey, EdgeVertex>,
    pub triangles: Vec<[EdgeKey; 3]>,
}

/// One vertex of the triangle stream handed to the renderer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct SurfaceVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub enum NormalMode {
    /// Per-vertex normals, averaged over every triangle sharing the vertex.
    #[default]
    Smooth,
    /// Each triangle uses its own face normal.
    Flat,
}

pub struct CubeMarch {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
    pub len_cube: f32,
    pub iso_value: f32,
    pub kernels: KernelConsts,
    pub mass: f32,
    pub filter: NeighborFilter,
    /// Indexed by `index(i, j, k)`.
    pub cells: Vec<CubeCell>,
}

impl CubeMarch {
    pub fn new(cfg: &Config) -> Self {
        let len = cfg.len_cube;
        let [lim_x, lim_y, lim_z] = cfg.lim;

        let nx = points_along(lim_x, len);
        let ny = points_along(lim_y, len);
        let nz = points_along(lim_z, len);

        let mut cells = Vec::with_capacity(nx * ny * nz);
        for i in 0..nx {
            for j in 0..ny {
                for k in 0..nz {
                    cells.push(CubeCell {
                        posit: Vec3::new(
                            -lim_x + i as f32 * len,
                            -lim_y + j as f32 * len,
                            -lim_z + k as f32 * len,
                        ),
                        color: 0.,
                        neighbors: Vec::new(),
                    });
                }
            }
        }

        Self {
            nx,
            ny,
            nz,
            len_cube: len,
            iso_value: cfg.iso_value,
            kernels: KernelConsts::new(cfg.h),
            mass: cfg.mass,
            filter: cfg.lattice_filter,
            cells,
        }
    }

    pub fn set_smoothing_radius(&mut self, h: f32) {
        self.kernels = KernelConsts::new(h);
    }

    pub fn index(&self, i: usize, j: usize, k: usize) -> usize {
        (i * self.ny + j) * self.nz + k
    }

    /// Run all surface phases against a hash built from `particles` this frame.
    pub fn update(
        &mut self,
        hash: &SpatialHash,
        particles: &[Particle],
        normals: NormalMode,
    ) -> Vec<SurfaceVertex> {
        self.update_neighbors(hash);
        self.update_color(particles);
        self.march(normals)
    }

    pub fn update_neighbors(&mut self, hash: &SpatialHash) {
        let chunk = util::chunk_len(self.cells.len());
        let radius = 2. * self.kernels.h;
        let filter = self.filter;

        self.cells.par_chunks_mut(chunk).for_each(|cells| {
            for c in cells {
                c.neighbors.clear();
                hash.query_neighbors(c.posit, radius, filter, &mut c.neighbors);
            }
        });
    }

    /// Σ mass / ρ × poly6 over neighbors; particles with zero density don't contribute.
    pub fn update_color(&mut self, particles: &[Particle]) {
        let chunk = util::chunk_len(self.cells.len());
        let kernels = self.kernels;
        let mass = self.mass;

        self.cells.par_chunks_mut(chunk).for_each(|cells| {
            for c in cells {
                c.color = 0.;
                for &j in &c.neighbors {
                    let p = &particles[j];
                    if p.density <= 0. {
                        continue;
                    }
                    c.color += mass / p.density * kernels.poly6(c.posit - p.posit);
                }
            }
        });
    }

    /// Triangulate the current colour field.
    pub fn march(&self, normals: NormalMode) -> Vec<SurfaceVertex> {
        if self.nx < 2 || self.ny < 2 || self.nz < 2 {
            return Vec::new();
        }

        let slabs: Vec<SlabMesh> = util::partition(self.nx - 1)
            .into_par_iter()
            .map(|range| self.march_slab(range))
            .collect();

        resolve(&slabs, &merge_edges(&slabs), normals)
    }

    /// Triangulate the cubes whose lowest x index falls in `x_range`.
    pub fn march_slab(&self, x_range: Range<usize>) -> SlabMesh {
        let mut result = SlabMesh::default();

        for i in x_range {
            for j in 0..self.ny.saturating_sub(1) {
                for k in 0..self.nz.saturating_sub(1) {
                    self.march_cube(i, j, k, &mut result);
                }
            }
        }

        result
    }

    fn march_cube(&self, i: usize, j: usize, k: usize, mesh: &mut SlabMesh) {
        let corners: [usize; 8] = CORNER_OFFSETS
            .map(|[dx, dy, dz]| self.index(i + dx, j + dy, k + dz));

        let mut case = 0;
        for (bit, &c) in corners.iter().enumerate() {
            if self.cells[c].color > self.iso_value {
                case |= 1 << bit;
            }
        }

        // Entirely inside or outside.
        if EDGE_TABLE[case] == 0 {
            return;
        }

        let mut keys = [EdgeKey(0, 0); 12];
        for (e, [a, b]) in CUBE_EDGES.iter().enumerate() {
            if EDGE_TABLE[case] & (1 << e) == 0 {
                continue;
            }

            let key = EdgeKey::new(corners[*a], corners[*b]);
            keys[e] = key;

            mesh.edges.entry(key).or_insert_with(|| EdgeVertex {
                posit: self.edge_crossing(key),
                normal_sum: Vec3::new_zero(),
            });
        }

        for tri in TRI_TABLE[case].chunks(3) {
            if tri[0] == TRI_END {
                break;
            }

            let tri_keys = [
                keys[tri[0] as usize],
                keys[tri[1] as usize],
                keys[tri[2] as usize],
            ];

            let posits = tri_keys.map(|key| mesh.edges.get(&key).map(|v| v.posit));
            let [Some(p0), Some(p1), Some(p2)] = posits else {
                continue;
            };

            if let Some(normal) = face_normal([p0, p1, p2]) {
                for key in &tri_keys {
                    if let Some(v) = mesh.edges.get_mut(key) {
                        v.normal_sum += normal;
                    }
                }
            }

            mesh.triangles.push(tri_keys);
        }
    }

    /// Interpolate where the iso-surface crosses an edge. Always interpolates from the lower
    /// corner index, so every cube sharing the edge gets a bit-identical position.
    fn edge_crossing(&self, key: EdgeKey) -> Vec3 {
        let (a, b) = key.corners();
        let (c1, c2) = (&self.cells[a], &self.cells[b]);

        interpolate(self.iso_value, c1.posit, c2.posit, c1.color, c2.color)
    }
}

/// Lattice points spanning `-lim..=lim`; none if the edge length or extent is degenerate.
fn points_along(lim: f32, len: f32) -> usize {
    if !(len > 0.) || !(lim >= 0.) || !lim.is_finite() {
        return 0;
    }
    (2. * lim / len + 1.) as usize
}

/// `p1 + (iso - c1) / (c2 - c1) × (p2 - p1)`, returning an endpoint when the iso-value sits
/// on one, or the two samples are equal.
pub fn interpolate(iso: f32, p1: Vec3, p2: Vec3, c1: f32, c2: f32) -> Vec3 {
    if (iso - c1).abs() < INTERP_EPS {
        return p1;
    }
    if (iso - c2).abs() < INTERP_EPS {
        return p2;
    }
    if (c1 - c2).abs() < INTERP_EPS {
        return p1;
    }

    let t = (iso - c1) / (c2 - c1);
    p1 + (p2 - p1) * t
}

/// Unit normal of a triangle, pointing out of the fluid, or `None` if it's degenerate.
/// Corners above the iso-value are inside, so the table's winding is reversed here.
fn face_normal(p: [Vec3; 3]) -> Option<Vec3> {
    let n = (p[2] - p[0]).cross(p[1] - p[0]);
    let mag_sq = n.magnitude_squared();

    if mag_sq < NORMAL_EPS {
        return None;
    }

    Some(n / mag_sq.sqrt())
}

/// Combine every slab's edge map. Positions agree between slabs; normal sums are added.
pub fn merge_edges(slabs: &[SlabMesh]) -> FxHashMap<EdgeKey, EdgeVertex> {
    let capacity = slabs.iter().map(|s| s.edges.len()).sum();
    let mut result: FxHashMap<EdgeKey, EdgeVertex> =
        FxHashMap::with_capacity_and_hasher(capacity, Default::default());

    for slab in slabs {
        for (key, v) in &slab.edges {
            result
                .entry(*key)
                .and_modify(|existing| existing.normal_sum += v.normal_sum)
                .or_insert(*v);
        }
    }

    result
}

/// Build the flat triangle stream, in slab order.
pub fn resolve(
    slabs: &[SlabMesh],
    edges: &FxHashMap<EdgeKey, EdgeVertex>,
    normals: NormalMode,
) -> Vec<SurfaceVertex> {
    let num_tris: usize = slabs.iter().map(|s| s.triangles.len()).sum();
    let mut result = Vec::with_capacity(num_tris * 3);

    for slab in slabs {
        for tri in &slab.triangles {
            let verts = (*tri).map(|key| edges.get(&key).copied());
            let [Some(v0), Some(v1), Some(v2)] = verts else {
                continue;
            };

            let flat = match normals {
                NormalMode::Flat => {
                    Some(face_normal([v0.posit, v1.posit, v2.posit]).unwrap_or(Vec3::new_zero()))
                }
                NormalMode::Smooth => None,
            };

            for v in [v0, v1, v2] {
                let normal = flat.unwrap_or_else(|| {
                    let mag = v.normal_sum.magnitude();
                    if mag > 0. {
                        v.normal_sum / mag
                    } else {
                        Vec3::new_zero()
                    }
                });

                result.push(SurfaceVertex {
                    position: vec_to_arr(v.posit),
                    normal: vec_to_arr(normal),
                });
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A lattice of `n` points per axis with unit spacing, starting at the origin.
    fn lattice(nx: usize, ny: usize, nz: usize) -> CubeMarch {
        let len = 1.;
        let cfg = Config {
            lim: [
                (nx - 1) as f32 * len / 2.,
                (ny - 1) as f32 * len / 2.,
                (nz - 1) as f32 * len / 2.,
            ],
            len_cube: len,
            iso_value: 0.5,
            ..Default::default()
        };
        let cm = CubeMarch::new(&cfg);
        assert_eq!((cm.nx, cm.ny, cm.nz), (nx, ny, nz));
        cm
    }

    #[test]
    fn lattice_positions_cover_domain() {
        let cm = lattice(3, 2, 4);
        assert_eq!(cm.cells.len(), 24);

        let last = &cm.cells[cm.index(2, 1, 3)];
        assert_eq!(last.posit.x, 1.);
        assert_eq!(last.posit.y, 0.5);
        assert_eq!(last.posit.z, 1.5);
        assert_eq!(cm.cells[0].posit.x, -1.);
    }

    #[test]
    fn degenerate_edge_length_gives_empty_lattice() {
        for len_cube in [0., -0.5, f32::NAN] {
            let cfg = Config {
                len_cube,
                ..Default::default()
            };
            let cm = CubeMarch::new(&cfg);
            assert!(cm.cells.is_empty());
            assert!(cm.march(NormalMode::Smooth).is_empty());
        }
    }

    #[test]
    fn uniform_field_gives_no_triangles() {
        let mut cm = lattice(4, 4, 4);

        for c in &mut cm.cells {
            c.color = 0.1;
        }
        assert!(cm.march(NormalMode::Smooth).is_empty());

        for c in &mut cm.cells {
            c.color = 0.9;
        }
        assert!(cm.march(NormalMode::Smooth).is_empty());
    }

    #[test]
    fn single_corner_gives_one_triangle() {
        let mut cm = lattice(2, 2, 2);
        let i = cm.index(0, 0, 0);
        cm.cells[i].color = 1.;

        let verts = cm.march(NormalMode::Smooth);
        assert_eq!(verts.len(), 3);

        for v in &verts {
            // Each crossing sits halfway along an edge leaving the hot corner at -0.5.
            let p = v.position;
            assert_eq!(p.iter().filter(|&&c| c == 0.).count(), 1);
            assert_eq!(p.iter().filter(|&&c| c == -0.5).count(), 2);
            let n = v.normal;
            let mag = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
            assert!((mag - 1.).abs() < 1e-5);
        }
    }

    #[test]
    fn interpolate_guards_degenerate_denominators() {
        let p1 = Vec3::new(0., 0., 0.);
        let p2 = Vec3::new(1., 0., 0.);

        assert_eq!(interpolate(0.5, p1, p2, 0.5, 0.9).x, 0.);
        assert_eq!(interpolate(0.5, p1, p2, 0.1, 0.5).x, 1.);
        assert_eq!(interpolate(0.5, p1, p2, 0.2, 0.2).x, 0.);
        assert!((interpolate(0.5, p1, p2, 0., 1.).x - 0.5).abs() < 1e-6);
    }

    #[test]
    fn edge_key_is_undirected() {
        assert_eq!(EdgeKey::new(3, 9), EdgeKey::new(9, 3));
        assert_ne!(EdgeKey::new(3, 9), EdgeKey::new(3, 10));
    }

    /// Two cubes sharing the x = 1 face, each triangulated by its own slab.
    #[test]
    fn shared_face_edges_merge() {
        let mut cm = lattice(3, 2, 2);

        // A field that varies across both cubes, so the surface crosses the shared face.
        for i in 0..3 {
            for j in 0..2 {
                for k in 0..2 {
                    let idx = cm.index(i, j, k);
                    cm.cells[idx].color = 0.2 + 0.35 * j as f32 + 0.2 * k as f32 + 0.03 * i as f32;
                }
            }
        }

        let left = cm.march_slab(0..1);
        let right = cm.march_slab(1..2);
        assert!(!left.triangles.is_empty() && !right.triangles.is_empty());

        let shared: Vec<EdgeKey> = left
            .edges
            .keys()
            .filter(|k| right.edges.contains_key(k))
            .copied()
            .collect();
        assert!(!shared.is_empty());

        let slabs = [left, right];
        let merged = merge_edges(&slabs);

        for key in &shared {
            let (a, b) = (slabs[0].edges[key], slabs[1].edges[key]);
            assert_eq!(a.posit.x.to_bits(), b.posit.x.to_bits());
            assert_eq!(a.posit.y.to_bits(), b.posit.y.to_bits());
            assert_eq!(a.posit.z.to_bits(), b.posit.z.to_bits());

            let sum = a.normal_sum + b.normal_sum;
            let m = merged[key].normal_sum;
            assert_eq!((m.x, m.y, m.z), (sum.x, sum.y, sum.z));
        }

        // Resolving through the merged map matches a single-slab pass over both cubes.
        let joined = resolve(&slabs, &merged, NormalMode::Smooth);
        let whole = cm.march_slab(0..2);
        let whole = resolve(std::slice::from_ref(&whole), &whole.edges, NormalMode::Smooth);

        assert_eq!(joined.len(), whole.len());
        for (a, b) in joined.iter().zip(&whole) {
            assert_eq!(a.position, b.position);
            for d in 0..3 {
                assert!((a.normal[d] - b.normal[d]).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn normals_point_away_from_hot_corner() {
        for (ci, cj, ck) in [(0, 0, 0), (1, 1, 1), (1, 0, 1)] {
            let mut cm = lattice(2, 2, 2);
            let i = cm.index(ci, cj, ck);
            cm.cells[i].color = 1.;
            let hot = cm.cells[i].posit;

            for mode in [NormalMode::Smooth, NormalMode::Flat] {
                let verts = cm.march(mode);
                assert_eq!(verts.len(), 3);

                for v in &verts {
                    let p = Vec3::new(v.position[0], v.position[1], v.position[2]);
                    let n = Vec3::new(v.normal[0], v.normal[1], v.normal[2]);
                    assert!((p - hot).dot(n) > 0.1, "corner {ci},{cj},{ck}, {mode:?}");
                }
            }
        }
    }

    #[test]
    fn flat_normals_match_face() {
        let mut cm = lattice(2, 2, 2);
        let i = cm.index(1, 1, 1);
        cm.cells[i].color = 1.;

        let verts = cm.march(NormalMode::Flat);
        assert_eq!(verts.len(), 3);
        assert_eq!(verts[0].normal, verts[1].normal);
        assert_eq!(verts[1].normal, verts[2].normal);
    }

    #[test]
    fn color_skips_zero_density_neighbors() {
        let mut cm = lattice(2, 2, 2);
        let mut particles = vec![
            Particle::new(Vec3::new(-0.5, -0.5, -0.5), Vec3::new_zero(), [1.; 4]),
            Particle::new(Vec3::new(-0.5, -0.5, -0.5), Vec3::new_zero(), [1.; 4]),
        ];
        particles[0].density = 2.;
        particles[1].density = 0.;
        cm.set_smoothing_radius(0.5);

        let idx = cm.index(0, 0, 0);
        cm.cells[idx].neighbors = vec![0, 1];
        cm.update_color(&particles);

        let expected = cm.mass / 2. * cm.kernels.poly6(Vec3::new_zero());
        assert_eq!(cm.cells[idx].color, expected);
        assert!(cm.cells.iter().all(|c| c.color.is_finite()));
    }
}
