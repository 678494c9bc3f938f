//! Dense linear-algebra helpers shared across the kernel.
//!
//! Everything here is a thin policy layer over nalgebra: bordered solves for
//! singularity functions and tangents, eigenvalue extraction with the wire
//! ordering, and the bialternate product used by Hopf-type test functions.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use num_complex::Complex;

use crate::error::{KernelError, KernelResult};

/// Solves `A x = b` by dense LU.
pub fn lu_solve(a: DMatrix<f64>, b: &DVector<f64>) -> KernelResult<DVector<f64>> {
    a.lu()
        .solve(b)
        .ok_or_else(|| KernelError::singular("LU solve failed"))
}

/// Solves the bordered system `[A, w; v', 0] * [q; g] = [0; 1]`.
///
/// Returns `(q, g)`; `g` vanishes exactly when `A` is singular with the
/// bordering vectors transversal to the kernel.
pub fn solve_bordered(
    a: &DMatrix<f64>,
    v: &DVector<f64>,
    w: &DVector<f64>,
) -> KernelResult<(DVector<f64>, f64)> {
    let n = a.nrows();
    let mut bordered = DMatrix::zeros(n + 1, n + 1);
    bordered.view_mut((0, 0), (n, n)).copy_from(a);
    for i in 0..n {
        bordered[(i, n)] = w[i];
        bordered[(n, i)] = v[i];
    }

    let mut rhs = DVector::zeros(n + 1);
    rhs[n] = 1.0;

    let sol = bordered
        .lu()
        .solve(&rhs)
        .ok_or_else(|| KernelError::singular("bordered system is singular"))?;
    let q = sol.rows(0, n).into_owned();
    let g = sol[n];
    Ok((q, g))
}

/// Solves the doubly-bordered system `[A, W; V', 0] * [Q; G] = [0; I_2]`
/// with two border columns. Returns the full `(n+2) x 2` solution.
pub fn solve_bordered2(
    a: &DMatrix<f64>,
    v: &DMatrix<f64>,
    w: &DMatrix<f64>,
) -> KernelResult<DMatrix<f64>> {
    let n = a.nrows();
    let mut bordered = DMatrix::zeros(n + 2, n + 2);
    bordered.view_mut((0, 0), (n, n)).copy_from(a);
    for i in 0..n {
        bordered[(i, n)] = w[(i, 0)];
        bordered[(i, n + 1)] = w[(i, 1)];
        bordered[(n, i)] = v[(i, 0)];
        bordered[(n + 1, i)] = v[(i, 1)];
    }

    let mut rhs = DMatrix::zeros(n + 2, 2);
    rhs[(n, 0)] = 1.0;
    rhs[(n + 1, 1)] = 1.0;

    bordered
        .lu()
        .solve(&rhs)
        .ok_or_else(|| KernelError::singular("doubly-bordered system is singular"))
}

/// Computes a unit tangent spanning the null space of a `m x (m+1)` extended
/// Jacobian.
///
/// Tries the Gram-matrix eigendecomposition first and falls back to bordered
/// linear solves over a sweep of unit bordering rows.
pub fn nullspace_tangent(j_ext: &DMatrix<f64>) -> KernelResult<DVector<f64>> {
    if let Some(vec) = try_gram_eigen(j_ext) {
        return Ok(vec);
    }
    tangent_bordered_sweep(j_ext)
}

fn try_gram_eigen(j_ext: &DMatrix<f64>) -> Option<DVector<f64>> {
    if j_ext.ncols() == 0 {
        return None;
    }

    let gram = j_ext.transpose() * j_ext;
    if gram.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let identity = DMatrix::identity(gram.nrows(), gram.ncols());
    let mut epsilon = 0.0;

    for _ in 0..5 {
        let adjusted = if epsilon == 0.0 {
            gram.clone()
        } else {
            &gram + identity.scale(epsilon)
        };

        let eig = SymmetricEigen::new(adjusted);
        if eig.eigenvalues.is_empty() {
            return None;
        }

        let mut min_idx = 0;
        let mut min_val = eig.eigenvalues[0];
        for (i, &val) in eig.eigenvalues.iter().enumerate().skip(1) {
            if !val.is_finite() {
                continue;
            }
            if val < min_val {
                min_val = val;
                min_idx = i;
            }
        }

        if !min_val.is_finite() {
            epsilon = if epsilon == 0.0 { 1e-12 } else { epsilon * 10.0 };
            continue;
        }

        let vec = eig.eigenvectors.column(min_idx).into_owned();
        if vec.norm_squared() == 0.0 || vec.iter().any(|v| !v.is_finite()) {
            return None;
        }
        return Some(vec.normalize());
    }

    None
}

fn tangent_bordered_sweep(j_ext: &DMatrix<f64>) -> KernelResult<DVector<f64>> {
    let dim = j_ext.nrows();
    if dim == 0 {
        return Err(KernelError::singular("zero-dimensional tangent system"));
    }

    let mut a = DMatrix::zeros(dim + 1, dim + 1);
    a.view_mut((0, 0), (dim, dim + 1)).copy_from(j_ext);
    let mut rhs = DVector::zeros(dim + 1);
    rhs[dim] = 1.0;

    for col in 0..=dim {
        for j in 0..=dim {
            a[(dim, j)] = 0.0;
        }
        a[(dim, col)] = 1.0;

        if let Some(solution) = a.clone().lu().solve(&rhs) {
            if solution.iter().all(|v| v.is_finite()) && solution.norm_squared() != 0.0 {
                return Ok(solution.normalize());
            }
        }
    }

    Err(KernelError::singular("all bordered tangent solves failed"))
}

/// Complex spectrum of a real matrix.
pub fn complex_eigenvalues(mat: &DMatrix<f64>) -> Vec<Complex<f64>> {
    if mat.nrows() == 0 {
        return Vec::new();
    }
    mat.clone().complex_eigenvalues().iter().cloned().collect()
}

/// Eigenvector of `mat` for the eigenvalue `lambda`, via SVD of the shifted
/// matrix. Returned normalized.
pub fn complex_eigenvector(
    mat: &DMatrix<f64>,
    lambda: Complex<f64>,
) -> KernelResult<Vec<Complex<f64>>> {
    let dim = mat.nrows();
    let mut shifted = mat.map(|v| Complex::new(v, 0.0));
    for i in 0..dim {
        shifted[(i, i)] -= lambda;
    }
    let svd = nalgebra::linalg::SVD::new(shifted, true, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| KernelError::singular("SVD failed to produce an eigenvector basis"))?;
    let row_index = v_t.nrows().saturating_sub(1);
    let mut vector: Vec<Complex<f64>> = (0..dim).map(|i| v_t[(row_index, i)].conj()).collect();
    let norm = vector.iter().map(|c| c.norm_sqr()).sum::<f64>().sqrt();
    if norm > 0.0 {
        for entry in &mut vector {
            *entry /= norm;
        }
    }
    Ok(vector)
}

/// Wire ordering for flow spectra: descending real part, ties broken by
/// descending |imag|, then positive imaginary part first.
pub fn sort_eigenvalues_flow(values: &mut [Complex<f64>]) {
    values.sort_by(|a, b| {
        b.re.partial_cmp(&a.re)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.im.abs()
                    .partial_cmp(&a.im.abs())
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(b.im.partial_cmp(&a.im).unwrap_or(std::cmp::Ordering::Equal))
    });
}

/// Wire ordering for map spectra and Floquet multipliers: descending
/// modulus, ties broken by descending |imag|, then positive imaginary part
/// first.
pub fn sort_eigenvalues_modulus(values: &mut [Complex<f64>]) {
    values.sort_by(|a, b| {
        b.norm()
            .partial_cmp(&a.norm())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.im.abs()
                    .partial_cmp(&a.im.abs())
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(b.im.partial_cmp(&a.im).unwrap_or(std::cmp::Ordering::Equal))
    });
}

/// Hopf test function for flows: the product of pairwise eigenvalue sums,
/// i.e. the determinant of the bialternate product `2*J (x) I`. The sign
/// flips when a complex pair crosses the imaginary axis.
pub fn hopf_test(eigenvalues: &[Complex<f64>]) -> f64 {
    let mut product = Complex::new(1.0, 0.0);
    for i in 0..eigenvalues.len() {
        for j in (i + 1)..eigenvalues.len() {
            product *= eigenvalues[i] + eigenvalues[j];
        }
    }
    product.re
}

/// Neutral-saddle companion of [`hopf_test`]: product of pairwise sums over
/// real eigenvalues only. A sign change here with a simultaneous Hopf sign
/// change indicates a real pair crossing, not a Hopf point.
pub fn neutral_saddle_test(eigenvalues: &[Complex<f64>]) -> f64 {
    const IMAG_EPS: f64 = 1e-8;
    let mut product = 1.0;
    let mut found_pair = false;

    for i in 0..eigenvalues.len() {
        if eigenvalues[i].im.abs() >= IMAG_EPS {
            continue;
        }
        for j in (i + 1)..eigenvalues.len() {
            if eigenvalues[j].im.abs() >= IMAG_EPS {
                continue;
            }
            found_pair = true;
            product *= eigenvalues[i].re + eigenvalues[j].re;
        }
    }

    if found_pair {
        product
    } else {
        1.0
    }
}

/// Neimark-Sacker test for map spectra: product of `lambda_i * lambda_j - 1`
/// over eigenvalue pairs; flips sign when a pair crosses the unit circle.
pub fn map_neimark_sacker_test(eigenvalues: &[Complex<f64>]) -> f64 {
    let mut product = Complex::new(1.0, 0.0);
    for i in 0..eigenvalues.len() {
        for j in (i + 1)..eigenvalues.len() {
            product *= eigenvalues[i] * eigenvalues[j] - Complex::new(1.0, 0.0);
        }
    }
    product.re
}

/// Period-doubling test for map spectra: `det(J + I)` computed as the
/// product of `lambda_i + 1`.
pub fn map_period_doubling_test(eigenvalues: &[Complex<f64>]) -> f64 {
    let mut product = Complex::new(1.0, 0.0);
    for value in eigenvalues {
        product *= value + Complex::new(1.0, 0.0);
    }
    product.re
}

/// The bialternate product `2 A (.) I` on the space of index pairs, of
/// dimension `n(n-1)/2`; its eigenvalues are the pairwise sums
/// `lambda_i + lambda_j` of the eigenvalues of `A`.
///
/// Entries follow the closed form over row pair `(i, j)` and column pair
/// `(k, l)` (both with first index smaller): the diagonal carries
/// `a_ii + a_jj`, pairs sharing one index pick up the off-diagonal entry
/// linking the distinct indices, signed by which slot is shared, and
/// disjoint pairs vanish.
pub fn bialternate_product(a: &DMatrix<f64>) -> DMatrix<f64> {
    let n = a.nrows();
    if n < 2 {
        return DMatrix::zeros(0, 0);
    }

    let pairs: Vec<(usize, usize)> = (0..n)
        .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
        .collect();

    DMatrix::from_fn(pairs.len(), pairs.len(), |row, col| {
        let (i, j) = pairs[row];
        let (k, l) = pairs[col];
        if (i, j) == (k, l) {
            a[(i, i)] + a[(j, j)]
        } else if k == i {
            a[(j, l)]
        } else if l == j {
            a[(i, k)]
        } else if l == i {
            -a[(j, k)]
        } else if k == j {
            -a[(i, l)]
        } else {
            0.0
        }
    })
}

/// Index pair of the critical eigenvalues: the pair whose sum is closest
/// to zero, preferring the more oscillatory pair when the sums tie. At a
/// Hopf point this picks out `+-i*omega`; on a fold it degenerates to the
/// two eigenvalues straddling zero.
pub fn critical_pair(eigenvalues: &[Complex<f64>]) -> Option<(usize, usize)> {
    let n = eigenvalues.len();
    let mut candidates = Vec::with_capacity(n.saturating_sub(1) * n / 2);
    for i in 0..n {
        for j in (i + 1)..n {
            let closeness = (eigenvalues[i] + eigenvalues[j]).norm();
            let oscillation = eigenvalues[i].im.abs().max(eigenvalues[j].im.abs());
            candidates.push((closeness, oscillation, i, j));
        }
    }
    candidates
        .into_iter()
        .min_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
        })
        .map(|(_, _, i, j)| (i, j))
}
