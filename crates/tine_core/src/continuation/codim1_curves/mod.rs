//! Two-parameter continuation of codim-1 bifurcation curves of equilibria,
//! with codim-2 singularity detection.

mod fold_curve;
mod hopf_curve;

pub use fold_curve::FoldCurveProblem;
pub use hopf_curve::{hopf_kappa_from_jacobian, HopfCurveProblem};

use nalgebra::{DMatrix, DVector};

use crate::error::KernelResult;
use crate::linalg;

/// Bordering vectors for the minimally-augmented fold condition.
#[derive(Debug, Clone)]
pub struct Borders {
    /// Right border: tracks the null space of the Jacobian.
    pub v: DVector<f64>,
    /// Left border: tracks the null space of the transpose.
    pub w: DVector<f64>,
}

impl Borders {
    pub fn new(v: DVector<f64>, w: DVector<f64>) -> Self {
        Self { v, w }
    }

    /// Initializes borders from the singular vectors of the smallest
    /// singular value.
    pub fn from_jacobian(jac: &DMatrix<f64>) -> KernelResult<Self> {
        let n = jac.nrows();
        let svd = jac.clone().svd(true, true);
        if let (Some(u), Some(vt)) = (svd.u, svd.v_t) {
            let v: DVector<f64> = vt.row(n - 1).transpose().into();
            let w: DVector<f64> = u.column(n - 1).into();
            Ok(Self::new(v.normalize(), w.normalize()))
        } else {
            let uniform = DVector::from_element(n, 1.0 / (n as f64).sqrt());
            Ok(Self::new(uniform.clone(), uniform))
        }
    }

    /// Refreshes the borders after an accepted step so they keep spanning
    /// the (near-)null spaces of the current Jacobian.
    pub fn update(&mut self, jac: &DMatrix<f64>) -> KernelResult<()> {
        let n = jac.nrows();
        if n == 0 {
            return Ok(());
        }

        if let Ok((v_new, _)) = linalg::solve_bordered(jac, &self.v, &self.w) {
            let norm = v_new.norm();
            if norm > 1e-12 {
                self.v = v_new / norm;
            }
        }
        if let Ok((w_new, _)) = linalg::solve_bordered(&jac.transpose(), &self.w, &self.v) {
            let norm = w_new.norm();
            if norm > 1e-12 {
                self.w = w_new / norm;
            }
        }

        Ok(())
    }
}

/// Two-column bordering for the Hopf condition on `J^2 + kappa I`.
#[derive(Debug, Clone)]
pub struct HopfBorders {
    pub v: DMatrix<f64>,
    pub w: DMatrix<f64>,
    /// Entries of the 2x2 bordered solution used as the two singularity
    /// functions.
    pub index1: (usize, usize),
    pub index2: (usize, usize),
}

impl HopfBorders {
    pub fn new(v: DMatrix<f64>, w: DMatrix<f64>) -> Self {
        Self {
            v,
            w,
            index1: (0, 0),
            index2: (1, 1),
        }
    }

    /// Initializes the borders from the two smallest singular directions of
    /// `J^2 + kappa I`.
    pub fn from_jacobian(jac: &DMatrix<f64>, kappa: f64) -> KernelResult<Self> {
        let n = jac.nrows();
        let red = jac * jac + DMatrix::identity(n, n) * kappa;
        let svd = red.svd(true, true);

        let mut v = DMatrix::zeros(n, 2);
        let mut w = DMatrix::zeros(n, 2);
        if let (Some(u), Some(vt)) = (svd.u, svd.v_t) {
            v.set_column(0, &vt.row(n - 1).transpose());
            v.set_column(1, &vt.row(n - 2).transpose());
            w.set_column(0, &u.column(n - 1));
            w.set_column(1, &u.column(n - 2));
            v = v.qr().q();
            w = w.qr().q();
        } else {
            v[(0, 0)] = 1.0;
            v[(1, 1)] = 1.0;
            w[(0, 0)] = 1.0;
            w[(1, 1)] = 1.0;
        }

        Ok(Self::new(v, w))
    }

    /// Refreshes both border pairs through the doubly-bordered solve and
    /// re-orthonormalizes with QR.
    pub fn update(&mut self, jac: &DMatrix<f64>, kappa: f64) -> KernelResult<()> {
        let n = jac.nrows();
        if n == 0 {
            return Ok(());
        }
        let red = jac * jac + DMatrix::identity(n, n) * kappa;

        let vext = match linalg::solve_bordered2(&red, &self.v, &self.w) {
            Ok(vext) => vext,
            Err(_) => return Ok(()),
        };
        let wext = match linalg::solve_bordered2(&red.transpose(), &self.w, &self.v) {
            Ok(wext) => wext,
            Err(_) => return Ok(()),
        };

        let q_v = vext.qr().q();
        self.v = q_v.view((0, 0), (n, 2)).into();
        let q_w = wext.qr().q();
        self.w = q_w.view((0, 0), (n, 2)).into();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn border_update_tracks_the_null_space() {
        // Matrix with kernel span{(0, 1)} after the update the right border
        // should align with it.
        let jac = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 0.0]);
        let mut borders = Borders::new(
            DVector::from_vec(vec![0.6, 0.8]),
            DVector::from_vec(vec![0.6, 0.8]),
        );
        borders.update(&jac).expect("update");
        assert!(
            borders.v[1].abs() > 0.99,
            "right border should align with the kernel: {:?}",
            borders.v
        );
    }

    #[test]
    fn fold_borders_come_normalized() {
        let jac = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        let borders = Borders::from_jacobian(&jac).expect("borders");
        assert!((borders.v.norm() - 1.0).abs() < 1e-12);
        assert!((borders.w.norm() - 1.0).abs() < 1e-12);
        // The kernel of [[1,2],[2,4]] is span{(2,-1)}.
        let alignment = (borders.v[0] * 2.0 - borders.v[1]).abs() / 5.0_f64.sqrt();
        assert!(alignment > 0.99, "v should span the kernel: {:?}", borders.v);
    }
}
