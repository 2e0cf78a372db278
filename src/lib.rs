#![allow(non_ascii_idents)]

//! Particle fluid simulation (SPH) with per-frame iso-surface extraction (marching cubes).
//!
//! `State` owns the solver, the spatial hash both stages share, and the sample lattice. Each
//! call to `State::step` advances the fluid one time step, then rebuilds the surface.

use std::{
    io::{self, ErrorKind},
    path::Path,
    time::Instant,
};

use bincode::{Decode, Encode};
use lin_alg::f32::Vec3;
use log::{debug, info};

pub mod cube_march;
pub mod kernels;
pub mod particle;
pub mod particle_creation;
pub mod playback;
pub mod spatial_hash;
pub mod sph;
pub mod tables;
pub mod util;

pub use cube_march::{CubeMarch, NormalMode, SurfaceVertex};
pub use particle::{Particle, ParticleRecord};
pub use particle_creation::Seeding;
pub use playback::{Frame, FrameError, FrameHeader, FrameReader, FrameWriter};
pub use spatial_hash::{NeighborFilter, SpatialHash};
pub use sph::Sph;

use crate::particle::vec_to_arr;

// Display colours.
const PARTICLE_COLOR: [f32; 4] = [62. / 255., 164. / 255., 240. / 255., 0.8];
const BOX_COLOR: [f32; 4] = [0., 0., 0., 0.2];

/// Simulation parameters. Lengths are in simulation units, with the domain centered on the
/// origin.
#[derive(Clone, Debug, Encode, Decode)]
pub struct Config {
    /// Domain half-extents.
    pub lim: [f32; 3],
    /// Smoothing radius.
    pub h: f32,
    pub dt: f32,
    /// Applied to the velocity component normal to a wall on contact.
    pub damping: f32,
    /// Per-particle.
    pub mass: f32,
    pub rest_density: f32,
    pub stiffness: f32,
    pub viscosity: f32,
    pub gravity: [f32; 3],
    /// Particles are kept half this far from the walls.
    pub sprite_size: f32,
    /// Lattice edge length.
    pub len_cube: f32,
    pub iso_value: f32,
    /// Hash cell size, as a multiple of h.
    pub hash_cell_scale: f32,
    pub hash_table_size: u32,
    pub seeding: Seeding,
    pub particle_color: [f32; 4],
    pub box_color: [f32; 4],
    pub sph_filter: NeighborFilter,
    pub lattice_filter: NeighborFilter,
    /// Frames the headless driver runs.
    pub num_frames: usize,
}

impl Default for Config {
    fn default() -> Self {
        let h = 0.06;

        Self {
            lim: [0.5, 0.25, 0.5],
            h,
            dt: 0.016,
            damping: 0.3,
            mass: 0.05,
            rest_density: 1_000.,
            stiffness: 1.,
            viscosity: 1.5,
            gravity: [0., -9.81, 0.],
            sprite_size: 0.0625,
            len_cube: h / 4.,
            iso_value: 0.6,
            hash_cell_scale: 2.,
            hash_table_size: spatial_hash::DEFAULT_TABLE_SIZE,
            seeding: Seeding::Sphere {
                count: 5_000,
                center: [0.; 3],
                radius: 0.125,
                speed: 10.,
            },
            particle_color: PARTICLE_COLOR,
            box_color: BOX_COLOR,
            sph_filter: NeighborFilter::Radius,
            lattice_filter: NeighborFilter::Radius,
            num_frames: 300,
        }
    }
}

impl Config {
    /// Loads and validates.
    pub fn load(path: &Path) -> io::Result<Self> {
        let result: Self = util::load(path)?;
        result.validate()?;
        Ok(result)
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        util::save(path, self)
    }

    /// Rejects lengths that would leave the kernels, hash, or lattice degenerate.
    pub fn validate(&self) -> io::Result<()> {
        let lengths = [
            ("h", self.h),
            ("len_cube", self.len_cube),
            ("hash_cell_scale", self.hash_cell_scale),
        ];

        for (name, v) in lengths {
            if !(v > 0. && v.is_finite()) {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("{name} must be positive; got {v}"),
                ));
            }
        }

        if self.lim.iter().any(|l| !(*l > 0. && l.is_finite())) {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("Domain limits must be positive; got {:?}", self.lim),
            ));
        }

        Ok(())
    }

    pub fn hash_cell_size(&self) -> f32 {
        self.h * self.hash_cell_scale
    }
}

pub struct State {
    pub config: Config,
    pub sph: Sph,
    /// Shared by the solver and the lattice; rebuilt each step.
    pub hash: SpatialHash,
    /// `None` when surface extraction is off.
    pub cube_march: Option<CubeMarch>,
    pub normals: NormalMode,
    /// Three vertices per triangle, from the last step.
    pub surface: Vec<SurfaceVertex>,
    pub time_elapsed: f64,
}

impl State {
    /// Seed particles from the config.
    pub fn new(config: Config, extract_surface: bool, normals: NormalMode) -> Self {
        let particles = config
            .seeding
            .make_particles(config.particle_color, &mut rand::rng());

        Self::with_particles(config, particles, extract_surface, normals)
    }

    pub fn with_particles(
        config: Config,
        particles: Vec<Particle>,
        extract_surface: bool,
        normals: NormalMode,
    ) -> Self {
        let hash = SpatialHash::new(config.hash_cell_size(), config.hash_table_size);
        let cube_march = extract_surface.then(|| CubeMarch::new(&config));

        match &cube_march {
            Some(cm) => info!(
                "Initialized {} particles, with a {}x{}x{} surface lattice",
                particles.len(),
                cm.nx,
                cm.ny,
                cm.nz
            ),
            None => info!("Initialized {} particles", particles.len()),
        }

        Self {
            sph: Sph::new(&config, particles),
            config,
            hash,
            cube_march,
            normals,
            surface: Vec::new(),
            time_elapsed: 0.,
        }
    }

    /// Advance one frame: step the fluid, rebuild the hash from the new positions, and
    /// extract the surface if enabled.
    pub fn step(&mut self) {
        let start = Instant::now();
        self.sph.step(&mut self.hash);
        let sph_time = start.elapsed().as_micros();

        self.time_elapsed += self.config.dt as f64;

        let Some(cube_march) = &mut self.cube_march else {
            debug!("SPH time: {sph_time}μs");
            return;
        };

        let start = Instant::now();
        self.sph.update_hash(&self.hash);
        self.hash.build(&self.sph.particles);
        self.surface = cube_march.update(&self.hash, &self.sph.particles, self.normals);
        let surface_time = start.elapsed().as_micros();

        debug!(
            "SPH time: {sph_time}μs. Surface time: {surface_time}μs. Triangles: {}",
            self.surface.len() / 3
        );
    }

    /// Changes the kernels and the hash cell size.
    pub fn set_smoothing_radius(&mut self, h: f32) {
        self.config.h = h;
        self.sph.set_smoothing_radius(h);
        if let Some(cm) = &mut self.cube_march {
            cm.set_smoothing_radius(h);
        }
        self.hash = SpatialHash::new(self.config.hash_cell_size(), self.config.hash_table_size);
    }

    pub fn particle_records(&self) -> Vec<ParticleRecord> {
        self.sph.records()
    }

    /// Snapshot the current state for recording.
    pub fn frame(&self, view: [[f32; 4]; 4], projection: [[f32; 4]; 4]) -> Frame {
        let cfg = &self.config;
        let [x, y, z] = cfg.lim;

        let header = FrameHeader {
            timestamp: self.time_elapsed,
            h: self.sph.h(),
            dt: cfg.dt,
            view,
            projection,
            gravity: vec_to_arr(self.sph.gravity),
            damping: cfg.damping,
            box_limits: [x, y, z, cfg.sprite_size],
            len_cube: cfg.len_cube,
            iso_value: cfg.iso_value,
            ..Default::default()
        };

        Frame::new(header, self.particle_records(), self.surface.clone())
    }

    /// Continue from a recorded frame. On error, the state is unchanged.
    pub fn restore(&mut self, frame: &Frame) -> Result<(), FrameError> {
        self.sph.restore(&frame.particles)?;
        self.surface = frame.vertices.clone();
        self.time_elapsed = frame.header.timestamp;
        Ok(())
    }

    pub fn box_outline(&self) -> BoxOutline {
        BoxOutline {
            segments: particle_creation::box_outline(self.config.lim),
            color: self.config.box_color,
        }
    }
}

/// The domain box, drawn as a wireframe.
#[derive(Clone, Debug)]
pub struct BoxOutline {
    /// Line-segment endpoints; two per edge.
    pub segments: Vec<Vec3>,
    pub color: [f32; 4],
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn config_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.sph");

        let cfg = Config {
            h: 0.05,
            lattice_filter: NeighborFilter::Bucket,
            seeding: Seeding::Cube {
                center: [0.1, 0., 0.],
                side_len: 0.2,
                spacing: 0.02,
            },
            ..Default::default()
        };
        cfg.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.h, 0.05);
        assert_eq!(loaded.lattice_filter, NeighborFilter::Bucket);
        assert_eq!(loaded.seeding, cfg.seeding);
        assert_eq!(loaded.gravity, cfg.gravity);
    }

    #[test]
    fn config_load_errors() {
        let dir = tempdir().unwrap();

        let missing = Config::load(&dir.path().join("missing.sph")).unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        let path = dir.path().join("garbage.sph");
        std::fs::write(&path, [0xff; 3]).unwrap();
        let garbage = Config::load(&path).unwrap_err();
        assert_ne!(garbage.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn config_load_rejects_degenerate_lengths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.sph");

        let bad = [
            Config {
                len_cube: 0.,
                ..Default::default()
            },
            Config {
                h: -0.06,
                ..Default::default()
            },
            Config {
                hash_cell_scale: f32::NAN,
                ..Default::default()
            },
            Config {
                lim: [0.5, 0., 0.5],
                ..Default::default()
            },
        ];

        for cfg in bad {
            cfg.save(&path).unwrap();
            let err = Config::load(&path).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput);
        }

        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn box_outline_uses_configured_color() {
        let cfg = Config {
            lim: [0.3, 0.2, 0.1],
            box_color: [0.1, 0.2, 0.3, 0.4],
            ..Default::default()
        };
        let state = State::with_particles(cfg, Vec::new(), false, NormalMode::Smooth);
        let outline = state.box_outline();

        assert_eq!(outline.color, [0.1, 0.2, 0.3, 0.4]);
        assert_eq!(outline.segments.len(), 24);
        for p in &outline.segments {
            assert_eq!([p.x.abs(), p.y.abs(), p.z.abs()], [0.3, 0.2, 0.1]);
        }
    }

    #[test]
    fn restore_rejects_wrong_count() {
        let cfg = Config {
            seeding: Seeding::Cube {
                center: [0.; 3],
                side_len: 0.04,
                spacing: 0.02,
            },
            ..Default::default()
        };
        let mut state = State::new(cfg, false, NormalMode::Smooth);
        state.step();

        let mut frame = state.frame(playback::IDENTITY, playback::IDENTITY);
        frame.particles.pop();
        let before = state.particle_records();

        assert!(matches!(
            state.restore(&frame),
            Err(FrameError::ParticleCountMismatch { expected: 27, found: 26 })
        ));
        assert_eq!(state.particle_records(), before);
    }

    #[test]
    fn smoothing_radius_resizes_hash() {
        let mut state = State::with_particles(Config::default(), Vec::new(), true, NormalMode::Flat);
        state.set_smoothing_radius(0.1);

        assert_eq!(state.hash.cell_size(), 0.2);
        assert_eq!(state.sph.h(), 0.1);
        assert_eq!(state.cube_march.as_ref().map(|cm| cm.kernels.h), Some(0.1));

        // No particles: steps run, and produce nothing.
        state.step();
        assert!(state.surface.is_empty());
    }
}
