//! Smoothing kernels used by the SPH solver and the surface colour field.
//!
//! All kernels have compact support: they are zero for `r > h`. The normalization
//! factors depend only on `h`, so they're cached in `KernelConsts`, and must be rebuilt
//! when the smoothing radius changes.

use std::f32::consts::PI;

use lin_alg::f32::Vec3;

/// Below this distance, we treat two points as coincident for gradient purposes.
const R_EPS: f32 = 1e-9;

#[derive(Clone, Copy, Debug)]
pub struct KernelConsts {
    /// Smoothing radius.
    pub h: f32,
    pub poly6: f32,
    pub spiky_grad: f32,
    pub viscosity_laplace: f32,
}

impl KernelConsts {
    pub fn new(h: f32) -> Self {
        Self {
            h,
            poly6: 315. / (64. * PI * h.powi(9)),
            spiky_grad: -45. / (PI * h.powi(6)),
            viscosity_laplace: 45. / (PI * h.powi(6)),
        }
    }

    /// Used for density, and the surface colour field. `r_v` is the vector between the two points.
    pub fn poly6(&self, r_v: Vec3) -> f32 {
        let r_sq = r_v.magnitude_squared();
        let h_sq = self.h * self.h;

        if r_sq > h_sq {
            return 0.;
        }

        self.poly6 * (h_sq - r_sq).powi(3)
    }

    /// Pressure gradient. Points along `r_v`, scaled by a negative constant; zero at `r = 0`,
    /// where the direction is undefined.
    pub fn spiky_grad(&self, r_v: Vec3) -> Vec3 {
        let r = r_v.magnitude();

        if r > self.h || r < R_EPS {
            return Vec3::new_zero();
        }

        r_v / r * (self.spiky_grad * (self.h - r).powi(2))
    }

    pub fn viscosity_laplace(&self, r_v: Vec3) -> f32 {
        let r = r_v.magnitude();

        if r > self.h {
            return 0.;
        }

        self.viscosity_laplace * (self.h - r)
    }
}
