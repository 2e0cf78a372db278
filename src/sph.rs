#![allow(non_ascii_idents)]

//! Smoothed-particle hydrodynamics. Each step rebuilds the shared spatial hash, finds
//! neighbors, computes density and pressure, accumulates pressure, viscosity and gravity
//! accelerations, integrates, and reflects particles off the domain walls.
//!
//! Phases run strictly in sequence; each is a parallel pass over disjoint chunks of the
//! particle array.

use lin_alg::f32::Vec3;
use rayon::prelude::*;

use crate::{
    kernels::KernelConsts,
    particle::{Particle, ParticleRecord},
    playback::FrameError,
    spatial_hash::{NeighborFilter, SpatialHash},
    util, Config,
};

/// Particles in contact with others are drawn in this colour; isolated ones keep the
/// configured particle colour.
pub const CONTACT_COLOR: [f32; 4] = [1.0, 0.0, 0.0, 0.8];

pub struct Sph {
    pub particles: Vec<Particle>,
    pub kernels: KernelConsts,
    pub dt: f32,
    pub damping: f32,
    pub mass: f32,
    /// Rest density.
    pub ρ0: f32,
    /// Pressure stiffness.
    pub k: f32,
    /// Viscosity coefficient.
    pub μ: f32,
    pub gravity: Vec3,
    /// Domain half-extents.
    pub lim: [f32; 3],
    pub sprite_size: f32,
    pub filter: NeighborFilter,
    pub color: [f32; 4],
}

impl Sph {
    pub fn new(cfg: &Config, particles: Vec<Particle>) -> Self {
        Self {
            particles,
            kernels: KernelConsts::new(cfg.h),
            dt: cfg.dt,
            damping: cfg.damping,
            mass: cfg.mass,
            ρ0: cfg.rest_density,
            k: cfg.stiffness,
            μ: cfg.viscosity,
            gravity: Vec3::new(cfg.gravity[0], cfg.gravity[1], cfg.gravity[2]),
            lim: cfg.lim,
            sprite_size: cfg.sprite_size,
            filter: cfg.sph_filter,
            color: cfg.particle_color,
        }
    }

    pub fn h(&self) -> f32 {
        self.kernels.h
    }

    pub fn set_smoothing_radius(&mut self, h: f32) {
        self.kernels = KernelConsts::new(h);
    }

    /// Radius used for neighbor queries.
    pub fn query_radius(&self) -> f32 {
        2. * self.kernels.h
    }

    /// Advance one time step. `hash` is rebuilt from the particles, and is left in that state
    /// so the surface extraction can query it.
    pub fn step(&mut self, hash: &mut SpatialHash) {
        self.update_hash(hash);
        hash.build(&self.particles);
        self.update_neighbors(hash);
        self.update_properties();
        self.calculate_forces();
        self.update_state();
        self.boundary_conditions();
    }

    pub fn update_hash(&mut self, hash: &SpatialHash) {
        let chunk = util::chunk_len(self.particles.len());

        self.particles.par_chunks_mut(chunk).for_each(|ps| {
            for p in ps {
                p.grid_hash = hash.hash_position(p.posit);
            }
        });
    }

    /// Requires `hash` to have been built from the current positions.
    pub fn update_neighbors(&mut self, hash: &SpatialHash) {
        let chunk = util::chunk_len(self.particles.len());
        let radius = self.query_radius();
        let filter = self.filter;

        self.particles.par_chunks_mut(chunk).for_each(|ps| {
            for p in ps {
                p.neighbors.clear();
                hash.query_neighbors(p.posit, radius, filter, &mut p.neighbors);
            }
        });
    }

    /// Density and pressure, from the current neighbor lists.
    pub fn update_properties(&mut self) {
        let densities: Vec<f32> = self
            .particles
            .par_iter()
            .map(|p| {
                p.neighbors
                    .iter()
                    .map(|&j| self.mass * self.kernels.poly6(p.posit - self.particles[j].posit))
                    .sum()
            })
            .collect();

        let chunk = util::chunk_len(self.particles.len());
        let (k, ρ0) = (self.k, self.ρ0);

        self.particles
            .par_chunks_mut(chunk)
            .zip(densities.par_chunks(chunk))
            .for_each(|(ps, ds)| {
                for (p, &ρ) in ps.iter_mut().zip(ds) {
                    p.density = ρ;
                    p.pressure = k * (ρ - ρ0);
                }
            });
    }

    /// Acceleration on particle `i` from gravity, and from pressure and viscosity of its
    /// neighbors. Particles with zero density neither receive nor exert pressure or viscosity.
    fn accel(&self, i: usize) -> Vec3 {
        let p = &self.particles[i];
        let mut result = self.gravity;

        if p.density <= 0. {
            return result;
        }

        let mut f_pressure = Vec3::new_zero();
        let mut f_viscosity = Vec3::new_zero();

        for &j in &p.neighbors {
            if j == i {
                continue;
            }
            let other = &self.particles[j];
            if other.density <= 0. {
                continue;
            }

            let r_v = p.posit - other.posit;

            f_pressure += self.kernels.spiky_grad(r_v)
                * (-self.mass * (p.pressure + other.pressure) / (2. * other.density));

            f_viscosity += (other.vel - p.vel)
                * (self.μ * self.mass / other.density * self.kernels.viscosity_laplace(r_v));
        }

        result += f_pressure / p.density;
        result += f_viscosity / p.density;
        result
    }

    pub fn calculate_forces(&mut self) {
        let accels: Vec<Vec3> = (0..self.particles.len())
            .into_par_iter()
            .map(|i| self.accel(i))
            .collect();

        let chunk = util::chunk_len(self.particles.len());
        let color = self.color;

        self.particles
            .par_chunks_mut(chunk)
            .zip(accels.par_chunks(chunk))
            .for_each(|(ps, accs)| {
                for (p, &a) in ps.iter_mut().zip(accs) {
                    p.accel = a;
                    // A particle always finds itself; anything more means it has contact.
                    p.color = if p.neighbors.len() > 1 {
                        CONTACT_COLOR
                    } else {
                        color
                    };
                }
            });
    }

    /// Semi-implicit Euler.
    pub fn update_state(&mut self) {
        let chunk = util::chunk_len(self.particles.len());
        let dt = self.dt;

        self.particles.par_chunks_mut(chunk).for_each(|ps| {
            for p in ps {
                p.vel += p.accel * dt;
                p.posit += p.vel * dt;
            }
        });
    }

    /// Clamp particles to the domain, shrunk by half the sprite size, reversing and damping
    /// the velocity component normal to any wall they crossed.
    pub fn boundary_conditions(&mut self) {
        let chunk = util::chunk_len(self.particles.len());
        let half_sprite = self.sprite_size / 2.;
        let lim = self.lim.map(|l| l - half_sprite);
        let damping = self.damping;

        self.particles.par_chunks_mut(chunk).for_each(|ps| {
            for p in ps {
                reflect(&mut p.posit.x, &mut p.vel.x, lim[0], damping);
                reflect(&mut p.posit.y, &mut p.vel.y, lim[1], damping);
                reflect(&mut p.posit.z, &mut p.vel.z, lim[2], damping);
            }
        });
    }

    pub fn records(&self) -> Vec<ParticleRecord> {
        self.particles.par_iter().map(|p| p.to_record()).collect()
    }

    /// Overwrite particle state from a recorded frame. The particle array is never resized,
    /// so the count must match.
    pub fn restore(&mut self, records: &[ParticleRecord]) -> Result<(), FrameError> {
        if records.len() != self.particles.len() {
            return Err(FrameError::ParticleCountMismatch {
                expected: self.particles.len(),
                found: records.len(),
            });
        }

        for (p, record) in self.particles.iter_mut().zip(records) {
            p.apply_record(record);
            p.neighbors.clear();
        }
        Ok(())
    }

    /// Σ mass × velocity.
    pub fn momentum(&self) -> Vec3 {
        let mut result = Vec3::new_zero();
        for p in &self.particles {
            result += p.vel * self.mass;
        }
        result
    }
}

fn reflect(posit: &mut f32, vel: &mut f32, lim: f32, damping: f32) {
    if *posit < -lim {
        *posit = -lim;
        *vel = -*vel * damping;
    } else if *posit > lim {
        *posit = lim;
        *vel = -*vel * damping;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle_creation::make_particles_cube;

    fn test_cfg() -> Config {
        Config {
            lim: [1., 1., 1.],
            ..Default::default()
        }
    }

    fn hash_for(sph: &Sph, cfg: &Config) -> SpatialHash {
        SpatialHash::new(sph.h() * cfg.hash_cell_scale, cfg.hash_table_size)
    }

    /// Runs every phase but the boundary pass.
    fn step_unbounded(sph: &mut Sph, hash: &mut SpatialHash) {
        sph.update_hash(hash);
        hash.build(&sph.particles);
        sph.update_neighbors(hash);
        sph.update_properties();
        sph.calculate_forces();
        sph.update_state();
    }

    #[test]
    fn momentum_conserved_without_gravity() {
        let cfg = Config {
            gravity: [0.; 3],
            stiffness: 3.,
            ..test_cfg()
        };
        let h = cfg.h;

        let mut particles = make_particles_cube(Vec3::new_zero(), h, h / 3.5, [1.; 4]);
        // Give it some shear so viscosity has work to do.
        for (i, p) in particles.iter_mut().enumerate() {
            let s = (i % 5) as f32 - 2.;
            p.vel = Vec3::new(0.1 * s, -0.05 * s, 0.02);
        }

        let mut sph = Sph::new(&cfg, particles);
        let mut hash = hash_for(&sph, &cfg);

        for _ in 0..3 {
            let before = sph.momentum();
            let vel_before: Vec<Vec3> = sph.particles.iter().map(|p| p.vel).collect();

            step_unbounded(&mut sph, &mut hash);

            let change_scale: f32 = sph
                .particles
                .iter()
                .zip(&vel_before)
                .map(|(p, v)| (p.vel - *v).magnitude() * sph.mass)
                .sum();
            assert!(change_scale > 0.);

            let drift = (sph.momentum() - before).magnitude();
            assert!(drift <= 1e-3 * change_scale + 1e-5, "drift {drift}, scale {change_scale}");
        }
    }

    #[test]
    fn neighbors_are_symmetric() {
        let cfg = test_cfg();
        let particles = make_particles_cube(Vec3::new(0.03, -0.02, 0.01), 0.2, 0.025, [1.; 4]);
        let mut sph = Sph::new(&cfg, particles);
        let mut hash = hash_for(&sph, &cfg);

        sph.update_hash(&hash);
        hash.build(&sph.particles);
        sph.update_neighbors(&hash);

        for (i, p) in sph.particles.iter().enumerate() {
            assert!(p.neighbors.contains(&i));
            for &j in &p.neighbors {
                assert!(sph.particles[j].neighbors.contains(&i), "{i} -> {j}");
            }
        }
    }

    #[test]
    fn boundary_pass_is_idempotent() {
        let cfg = test_cfg();
        let mut particles = make_particles_cube(Vec3::new_zero(), 2.5, 0.5, [1.; 4]);
        for (i, p) in particles.iter_mut().enumerate() {
            p.vel = Vec3::new(i as f32, -(i as f32), 0.5);
        }
        let mut sph = Sph::new(&cfg, particles);

        // The first pass pulls everything inside.
        sph.boundary_conditions();
        let once = sph.records();

        sph.boundary_conditions();
        assert_eq!(sph.records(), once);

        let lim = cfg.lim[0] - cfg.sprite_size / 2.;
        assert!(sph.particles.iter().all(|p| p.posit.x.abs() <= lim));
    }

    #[test]
    fn wall_hit_reverses_and_damps() {
        let cfg = test_cfg();
        let mut sph = Sph::new(
            &cfg,
            vec![Particle::new(Vec3::new(2., 0., 0.), Vec3::new(4., 1., 0.), [1.; 4])],
        );
        sph.boundary_conditions();

        let p = &sph.particles[0];
        assert_eq!(p.posit.x, cfg.lim[0] - cfg.sprite_size / 2.);
        assert_eq!(p.vel.x, -4. * cfg.damping);
        assert_eq!(p.vel.y, 1.);
    }

    #[test]
    fn lone_particle_has_density_from_itself_only() {
        let cfg = test_cfg();
        let mut sph = Sph::new(
            &cfg,
            vec![Particle::new(Vec3::new_zero(), Vec3::new_zero(), [1.; 4])],
        );
        let mut hash = hash_for(&sph, &cfg);
        step_unbounded(&mut sph, &mut hash);

        let p = &sph.particles[0];
        assert_eq!(p.density, cfg.mass * sph.kernels.poly6(Vec3::new_zero()));
        assert_eq!(p.color, cfg.particle_color);
        assert!(p.accel.x == 0. && p.accel.z == 0.);
        assert_eq!(p.accel.y, cfg.gravity[1]);
    }

    #[test]
    fn touching_particles_are_highlighted() {
        let cfg = test_cfg();
        let mut sph = Sph::new(
            &cfg,
            vec![
                Particle::new(Vec3::new_zero(), Vec3::new_zero(), cfg.particle_color),
                Particle::new(Vec3::new(0.01, 0., 0.), Vec3::new_zero(), cfg.particle_color),
                Particle::new(Vec3::new(0.5, 0., 0.), Vec3::new_zero(), cfg.particle_color),
            ],
        );
        let mut hash = hash_for(&sph, &cfg);
        step_unbounded(&mut sph, &mut hash);

        assert_eq!(sph.particles[0].color, CONTACT_COLOR);
        assert_eq!(sph.particles[1].color, CONTACT_COLOR);
        assert_eq!(sph.particles[2].color, cfg.particle_color);
    }

    #[test]
    fn zero_density_particles_get_gravity_only() {
        let cfg = test_cfg();
        let mut sph = Sph::new(
            &cfg,
            vec![
                Particle::new(Vec3::new_zero(), Vec3::new(1., 0., 0.), [1.; 4]),
                Particle::new(Vec3::new(0.01, 0., 0.), Vec3::new_zero(), [1.; 4]),
            ],
        );
        // Neighbor lists without density, as if the property pass saw nothing.
        sph.particles[0].neighbors = vec![0, 1];
        sph.particles[1].neighbors = vec![0, 1];
        sph.particles[1].density = 0.;
        sph.particles[0].density = 1_000.;
        sph.particles[0].pressure = 50.;

        sph.calculate_forces();

        for p in &sph.particles {
            assert!(p.accel.x.is_finite() && p.accel.y.is_finite() && p.accel.z.is_finite());
            assert_eq!(p.accel.x, 0.);
            assert_eq!(p.accel.y, cfg.gravity[1]);
        }
    }

    #[test]
    fn restore_rejects_count_mismatch() {
        let cfg = test_cfg();
        let mut sph = Sph::new(&cfg, make_particles_cube(Vec3::new_zero(), 0.02, 0.01, [1.; 4]));

        let records = sph.records();
        assert!(sph.restore(&records[1..]).is_err());
        assert!(sph.restore(&records).is_ok());
        assert_eq!(sph.records(), records);
    }
}
