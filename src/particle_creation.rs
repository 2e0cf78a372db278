#![allow(non_ascii_idents)]

//! Creates initial particle distributions.

use std::f32::consts::TAU;

use bincode::{Decode, Encode};
use lin_alg::f32::Vec3;
use rand::Rng;

use crate::particle::Particle;

/// How to place particles at startup. Positions and lengths are in simulation units.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub enum Seeding {
    /// Uniformly distributed inside a sphere, with random velocities up to `speed` per axis.
    Sphere {
        count: usize,
        center: [f32; 3],
        radius: f32,
        speed: f32,
    },
    /// A regular lattice filling a cube, at rest.
    Cube {
        center: [f32; 3],
        side_len: f32,
        spacing: f32,
    },
}

impl Seeding {
    pub fn make_particles<R: Rng>(&self, color: [f32; 4], rng: &mut R) -> Vec<Particle> {
        match self {
            Self::Sphere {
                count,
                center,
                radius,
                speed,
            } => make_particles_sphere(*count, arr(*center), *radius, *speed, color, rng),
            Self::Cube {
                center,
                side_len,
                spacing,
            } => make_particles_cube(arr(*center), *side_len, *spacing, color),
        }
    }
}

fn arr(v: [f32; 3]) -> Vec3 {
    Vec3::new(v[0], v[1], v[2])
}

/// Uniform in volume: the cube root on the radius keeps the outer shells from being
/// under-populated.
pub fn make_particles_sphere<R: Rng>(
    count: usize,
    center: Vec3,
    radius: f32,
    speed: f32,
    color: [f32; 4],
    rng: &mut R,
) -> Vec<Particle> {
    let mut result = Vec::with_capacity(count);

    for _ in 0..count {
        let r = radius * rng.random_range(0.0..=1.0f32).cbrt();
        let θ = rng.random_range(0.0..TAU);
        let φ = (1. - 2. * rng.random_range(0.0..=1.0f32)).acos();

        let posit = center
            + Vec3::new(
                r * φ.sin() * θ.cos(),
                r * φ.sin() * θ.sin(),
                r * φ.cos(),
            );

        let vel = Vec3::new(
            rng.random_range(-1.0..=1.0f32) * speed,
            rng.random_range(-1.0..=1.0f32) * speed,
            rng.random_range(-1.0..=1.0f32) * speed,
        );

        result.push(Particle::new(posit, vel, color));
    }

    result
}

/// Fill a cube centered on `center` with a lattice at the given spacing.
pub fn make_particles_cube(
    center: Vec3,
    side_len: f32,
    spacing: f32,
    color: [f32; 4],
) -> Vec<Particle> {
    if spacing <= 0. || side_len < 0. {
        return Vec::new();
    }

    // The epsilon keeps an exact multiple from truncating down a layer.
    let per_side = (side_len / spacing + 1e-4) as usize + 1;
    let start = center - Vec3::new(side_len / 2., side_len / 2., side_len / 2.);

    let mut result = Vec::with_capacity(per_side.pow(3));

    for i in 0..per_side {
        for j in 0..per_side {
            for k in 0..per_side {
                let posit = start
                    + Vec3::new(
                        i as f32 * spacing,
                        j as f32 * spacing,
                        k as f32 * spacing,
                    );
                result.push(Particle::new(posit, Vec3::new_zero(), color));
            }
        }
    }

    result
}

/// The 12 edges of the simulation box, as 24 line-segment endpoints, for drawing its outline.
pub fn box_outline(lim: [f32; 3]) -> Vec<Vec3> {
    let [x, y, z] = lim;

    let corners = [
        Vec3::new(-x, -y, -z),
        Vec3::new(x, -y, -z),
        Vec3::new(x, y, -z),
        Vec3::new(-x, y, -z),
        Vec3::new(-x, -y, z),
        Vec3::new(x, -y, z),
        Vec3::new(x, y, z),
        Vec3::new(-x, y, z),
    ];

    crate::tables::CUBE_EDGES
        .iter()
        .flat_map(|[a, b]| [corners[*a], corners[*b]])
        .collect()
}
