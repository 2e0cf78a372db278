use bytemuck::{Pod, Zeroable};
use lin_alg::f32::Vec3;

use crate::spatial_hash::HashPoint;

#[derive(Clone, Debug)]
pub struct Particle {
    pub posit: Vec3,
    pub vel: Vec3,
    /// Scratch; written by the force pass each step.
    pub accel: Vec3,
    /// Display only.
    pub color: [f32; 4],
    pub density: f32,
    pub pressure: f32,
    /// Hash of the grid cell containing `posit`, as of the last `update_hash`.
    pub grid_hash: u32,
    /// Indices into the particle array. Only valid until a particle moves; rebuilt every step.
    pub neighbors: Vec<usize>,
}

impl Particle {
    pub fn new(posit: Vec3, vel: Vec3, color: [f32; 4]) -> Self {
        Self {
            posit,
            vel,
            accel: Vec3::new_zero(),
            color,
            density: 0.,
            pressure: 0.,
            grid_hash: 0,
            neighbors: Vec::new(),
        }
    }

    pub fn to_record(&self) -> ParticleRecord {
        ParticleRecord {
            position: vec_to_arr(self.posit),
            color: self.color,
            density: self.density,
            velocity: vec_to_arr(self.vel),
            pressure: self.pressure,
        }
    }

    /// Overwrite the recorded state. Neighbors and acceleration are left stale; they're
    /// rebuilt on the next step.
    pub fn apply_record(&mut self, record: &ParticleRecord) {
        self.posit = arr_to_vec(record.position);
        self.vel = arr_to_vec(record.velocity);
        self.color = record.color;
        self.density = record.density;
        self.pressure = record.pressure;
    }
}

impl HashPoint for Particle {
    fn posit(&self) -> Vec3 {
        self.posit
    }

    fn grid_hash(&self) -> u32 {
        self.grid_hash
    }
}

/// Tightly packed particle state, as uploaded to the GPU and stored in recorded frames.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ParticleRecord {
    pub position: [f32; 3],
    pub color: [f32; 4],
    pub density: f32,
    pub velocity: [f32; 3],
    pub pressure: f32,
}

pub fn vec_to_arr(v: Vec3) -> [f32; 3] {
    [v.x, v.y, v.z]
}

pub fn arr_to_vec(v: [f32; 3]) -> Vec3 {
    Vec3::new(v[0], v[1], v[2])
}
