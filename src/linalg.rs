//! Dense kernels shared by the drivers.
//!
//! Matrices are column-major slices with an explicit leading dimension, so
//! the same buffer can hold an `m x n` Jacobian and, after factorization, its
//! `n x n` triangular factor in the leading rows.

use core::fmt;

const RDWARF: f64 = 3.834e-20;
const RGIANT: f64 = 1.304e19;

/// Euclidean norm of `x`.
///
/// Components are accumulated in three bands (small, intermediate, large)
/// and each band is scaled by its own largest magnitude, so the result is
/// finite whenever the true norm is representable.
pub fn enorm(x: &[f64]) -> f64 {
    let agiant = RGIANT / x.len().max(1) as f64;
    let mut s1 = 0.0;
    let mut s2 = 0.0;
    let mut s3 = 0.0;
    let mut x1max = 0.0_f64;
    let mut x3max = 0.0_f64;

    for &xi in x {
        let xabs = xi.abs();
        if xabs > RDWARF && xabs < agiant {
            s2 += xabs * xabs;
        } else if xabs <= RDWARF {
            if xabs > x3max {
                let ratio = x3max / xabs;
                s3 = 1.0 + s3 * ratio * ratio;
                x3max = xabs;
            } else if xabs != 0.0 {
                let ratio = xabs / x3max;
                s3 += ratio * ratio;
            }
        } else if xabs > x1max {
            let ratio = x1max / xabs;
            s1 = 1.0 + s1 * ratio * ratio;
            x1max = xabs;
        } else {
            let ratio = xabs / x1max;
            s1 += ratio * ratio;
        }
    }

    if s1 != 0.0 {
        x1max * (s1 + (s2 / x1max) / x1max).sqrt()
    } else if s2 != 0.0 {
        if s2 >= x3max {
            (s2 * (1.0 + (x3max / s2) * (x3max * s3))).sqrt()
        } else {
            (x3max * ((s2 / x3max) + (x3max * s3))).sqrt()
        }
    } else {
        x3max * s3.sqrt()
    }
}

/// A triangular factor whose numerical rank is below its column count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingularJacobian {
    /// Number of pivots above the rank threshold.
    pub rank: usize,
    /// Number of columns in the factored matrix.
    pub ncols: usize,
}

impl fmt::Display for SingularJacobian {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "jacobian is rank deficient: rank {} of {} columns",
            self.rank, self.ncols
        )
    }
}

impl std::error::Error for SingularJacobian {}

/// Checks the diagonal of a triangular factor for negligible pivots.
///
/// A pivot counts as zero when its magnitude is at most
/// `100 * n * EPSILON * max |r_jj|`.
pub(crate) fn check_rank(rdiag: &[f64]) -> Result<(), SingularJacobian> {
    let ncols = rdiag.len();
    let largest = rdiag.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    let threshold = 100.0 * ncols as f64 * f64::EPSILON * largest;
    let rank = rdiag
        .iter()
        .filter(|v| largest > 0.0 && v.abs() > threshold)
        .count();
    if rank < ncols {
        Err(SingularJacobian { rank, ncols })
    } else {
        Ok(())
    }
}

/// Householder QR of the `m x n` matrix `a`, optionally with column pivoting.
///
/// On return the strict upper triangle of `a` holds the strict upper
/// triangle of R, the lower trapezoid holds the Householder vectors, and
/// `rdiag` holds the diagonal of R. `acnorm` receives the norms of the
/// original columns. With pivoting, the column of largest remaining norm is
/// moved forward at every stage and `ipvt[j]` names the original column now
/// in position `j`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn qrfac(
    m: usize,
    n: usize,
    a: &mut [f64],
    lda: usize,
    pivot: bool,
    ipvt: &mut [usize],
    rdiag: &mut [f64],
    acnorm: &mut [f64],
    wa: &mut [f64],
) {
    for j in 0..n {
        acnorm[j] = enorm(&a[j * lda..j * lda + m]);
        rdiag[j] = acnorm[j];
        wa[j] = rdiag[j];
        ipvt[j] = j;
    }

    for j in 0..m.min(n) {
        if pivot {
            let mut kmax = j;
            for k in j..n {
                if rdiag[k] > rdiag[kmax] {
                    kmax = k;
                }
            }
            if kmax != j {
                for i in 0..m {
                    a.swap(i + j * lda, i + kmax * lda);
                }
                rdiag[kmax] = rdiag[j];
                wa[kmax] = wa[j];
                ipvt.swap(j, kmax);
            }
        }

        let jj = j + j * lda;
        let mut ajnorm = enorm(&a[jj..j * lda + m]);
        if ajnorm != 0.0 {
            if a[jj] < 0.0 {
                ajnorm = -ajnorm;
            }
            for i in j..m {
                a[i + j * lda] /= ajnorm;
            }
            a[jj] += 1.0;

            for k in j + 1..n {
                let mut sum = 0.0;
                for i in j..m {
                    sum += a[i + j * lda] * a[i + k * lda];
                }
                let temp = sum / a[jj];
                for i in j..m {
                    a[i + k * lda] -= temp * a[i + j * lda];
                }
                if pivot && rdiag[k] != 0.0 {
                    let temp = a[j + k * lda] / rdiag[k];
                    rdiag[k] *= (1.0 - temp * temp).max(0.0).sqrt();
                    let ratio = rdiag[k] / wa[k];
                    // Downdated norm has lost too many digits; recompute it.
                    if 0.05 * ratio * ratio <= f64::EPSILON {
                        rdiag[k] = enorm(&a[j + 1 + k * lda..k * lda + m]);
                        wa[k] = rdiag[k];
                    }
                }
            }
        }
        rdiag[j] = -ajnorm;
    }
}

/// Accumulates the `m x m` orthogonal factor from the Householder vectors
/// left in the first `min(m, n)` columns of `q` by [`qrfac`].
pub(crate) fn qform(m: usize, n: usize, q: &mut [f64], ldq: usize, wa: &mut [f64]) {
    let minmn = m.min(n);
    for j in 1..minmn {
        for i in 0..j {
            q[i + j * ldq] = 0.0;
        }
    }
    for j in n..m {
        for i in 0..m {
            q[i + j * ldq] = 0.0;
        }
        q[j + j * ldq] = 1.0;
    }

    for k in (0..minmn).rev() {
        for i in k..m {
            wa[i] = q[i + k * ldq];
            q[i + k * ldq] = 0.0;
        }
        q[k + k * ldq] = 1.0;
        if wa[k] != 0.0 {
            for j in k..m {
                let mut sum = 0.0;
                for i in k..m {
                    sum += q[i + j * ldq] * wa[i];
                }
                let temp = sum / wa[k];
                for i in k..m {
                    q[i + j * ldq] -= temp * wa[i];
                }
            }
        }
    }
}

/// Cosine and sine of the Givens rotation that zeroes `b` against `a`.
fn givens(a: f64, b: f64) -> (f64, f64) {
    if a.abs() < b.abs() {
        let cotan = a / b;
        let sin = 0.5 / (0.25 + 0.25 * cotan * cotan).sqrt();
        (sin * cotan, sin)
    } else {
        let tan = b / a;
        let cos = 0.5 / (0.25 + 0.25 * tan * tan).sqrt();
        (cos, cos * tan)
    }
}

/// Like [`givens`], also returning the single number `tau` from which
/// [`r1mpyq`] rebuilds the rotation.
fn givens_packed(a: f64, b: f64) -> (f64, f64, f64) {
    if a.abs() < b.abs() {
        let cotan = a / b;
        let sin = 0.5 / (0.25 + 0.25 * cotan * cotan).sqrt();
        let cos = sin * cotan;
        let tau = if cos.abs() * f64::MAX > 1.0 { 1.0 / cos } else { 1.0 };
        (cos, sin, tau)
    } else {
        let tan = b / a;
        let cos = 0.5 / (0.25 + 0.25 * tan * tan).sqrt();
        let sin = cos * tan;
        (cos, sin, sin)
    }
}

fn unpack_rotation(tau: f64) -> (f64, f64) {
    if tau.abs() > 1.0 {
        let cos = 1.0 / tau;
        (cos, (1.0 - cos * cos).max(0.0).sqrt())
    } else {
        ((1.0 - tau * tau).max(0.0).sqrt(), tau)
    }
}

/// Solves `min || [A; D] x - [b; 0] ||` given the pivoted QR `A P = Q R`.
///
/// `r` holds R in its upper triangle and `qtb` the first `n` entries of
/// `Q^T b`. The upper triangle and diagonal of `r` are left intact; the strict
/// lower triangle receives the transposed triangular factor of the augmented
/// system and `sdiag` its diagonal. Zero entries of `sdiag` mark directions
/// the solve treats as singular.
#[allow(clippy::too_many_arguments)]
pub(crate) fn qrsolv(
    n: usize,
    r: &mut [f64],
    ldr: usize,
    ipvt: &[usize],
    diag: &[f64],
    qtb: &[f64],
    x: &mut [f64],
    sdiag: &mut [f64],
    wa: &mut [f64],
) {
    for j in 0..n {
        for i in j..n {
            r[i + j * ldr] = r[j + i * ldr];
        }
        x[j] = r[j + j * ldr];
        wa[j] = qtb[j];
    }

    // Eliminate the diagonal matrix D with Givens rotations.
    for j in 0..n {
        let l = ipvt[j];
        if diag[l] != 0.0 {
            sdiag[j..n].fill(0.0);
            sdiag[j] = diag[l];
            let mut qtbpj = 0.0;
            for k in j..n {
                if sdiag[k] == 0.0 {
                    continue;
                }
                let kk = k + k * ldr;
                let (cos, sin) = givens(r[kk], sdiag[k]);
                r[kk] = cos * r[kk] + sin * sdiag[k];
                let temp = cos * wa[k] + sin * qtbpj;
                qtbpj = -sin * wa[k] + cos * qtbpj;
                wa[k] = temp;
                for i in k + 1..n {
                    let rik = r[i + k * ldr];
                    let temp = cos * rik + sin * sdiag[i];
                    sdiag[i] = -sin * rik + cos * sdiag[i];
                    r[i + k * ldr] = temp;
                }
            }
        }
        sdiag[j] = r[j + j * ldr];
        r[j + j * ldr] = x[j];
    }

    let mut nsing = n;
    for j in 0..n {
        if sdiag[j] == 0.0 && nsing == n {
            nsing = j;
        }
        if nsing < n {
            wa[j] = 0.0;
        }
    }
    for j in (0..nsing).rev() {
        let mut sum = 0.0;
        for i in j + 1..nsing {
            sum += r[i + j * ldr] * wa[i];
        }
        wa[j] = (wa[j] - sum) / sdiag[j];
    }
    for j in 0..n {
        x[ipvt[j]] = wa[j];
    }
}

/// Folds one row `w` (with right-hand side `alpha`) into the upper
/// triangular `r` and the vector `b` using Givens rotations.
///
/// The rotations are left in `cos` and `sin`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn rwupdt(
    n: usize,
    r: &mut [f64],
    ldr: usize,
    w: &[f64],
    b: &mut [f64],
    alpha: &mut f64,
    cos: &mut [f64],
    sin: &mut [f64],
) {
    for j in 0..n {
        let mut rowj = w[j];
        for i in 0..j {
            let rij = r[i + j * ldr];
            let temp = cos[i] * rij + sin[i] * rowj;
            rowj = -sin[i] * rij + cos[i] * rowj;
            r[i + j * ldr] = temp;
        }

        cos[j] = 1.0;
        sin[j] = 0.0;
        if rowj != 0.0 {
            let jj = j + j * ldr;
            let (c, s) = givens(r[jj], rowj);
            cos[j] = c;
            sin[j] = s;
            r[jj] = c * r[jj] + s * rowj;
            let temp = c * b[j] + s * *alpha;
            *alpha = -s * b[j] + c * *alpha;
            b[j] = temp;
        }
    }
}

/// Offset of the diagonal entry of column `j` in a packed lower trapezoid
/// with `m` rows (equivalently, of row `j` in a packed upper triangle).
pub(crate) fn packed_diag(m: usize, j: usize) -> usize {
    j * (2 * m + 1 - j) / 2
}

/// Rank-one update of a packed lower trapezoidal matrix.
///
/// Finds an orthogonal Q such that `(S + u v^T) Q` is again lower
/// trapezoidal and overwrites `s` with it. Q is returned in factored form:
/// `v` and `w` hold the packed rotations consumed by [`r1mpyq`]. Returns
/// `true` when a diagonal entry of the updated matrix is zero.
pub(crate) fn r1updt(
    m: usize,
    n: usize,
    s: &mut [f64],
    u: &[f64],
    v: &mut [f64],
    w: &mut [f64],
) -> bool {
    let last = n - 1;

    let jj = packed_diag(m, last);
    for (k, i) in (last..m).enumerate() {
        w[i] = s[jj + k];
    }

    // Rotate v into a multiple of the last unit vector, extending w into a
    // spike below the diagonal.
    for j in (0..last).rev() {
        w[j] = 0.0;
        if v[j] != 0.0 {
            let (cos, sin, tau) = givens_packed(v[last], v[j]);
            v[last] = sin * v[j] + cos * v[last];
            v[j] = tau;
            let jj = packed_diag(m, j);
            for (k, i) in (j..m).enumerate() {
                let l = jj + k;
                let temp = cos * s[l] - sin * w[i];
                w[i] = sin * s[l] + cos * w[i];
                s[l] = temp;
            }
        }
    }

    for i in 0..m {
        w[i] += v[last] * u[i];
    }

    let mut sing = false;
    for j in 0..last {
        let jj = packed_diag(m, j);
        if w[j] != 0.0 {
            let (cos, sin, tau) = givens_packed(s[jj], w[j]);
            for (k, i) in (j..m).enumerate() {
                let l = jj + k;
                let temp = cos * s[l] + sin * w[i];
                w[i] = -sin * s[l] + cos * w[i];
                s[l] = temp;
            }
            w[j] = tau;
        }
        if s[jj] == 0.0 {
            sing = true;
        }
    }

    let jj = packed_diag(m, last);
    for (k, i) in (last..m).enumerate() {
        s[jj + k] = w[i];
    }
    if s[jj] == 0.0 {
        sing = true;
    }
    sing
}

/// Multiplies the `m x n` matrix `a` on the right by the orthogonal matrix
/// produced by [`r1updt`].
pub(crate) fn r1mpyq(m: usize, n: usize, a: &mut [f64], lda: usize, v: &[f64], w: &[f64]) {
    if n < 2 {
        return;
    }
    let last = n - 1;
    for j in (0..last).rev() {
        let (cos, sin) = unpack_rotation(v[j]);
        for i in 0..m {
            let aij = a[i + j * lda];
            let ain = a[i + last * lda];
            a[i + j * lda] = cos * aij - sin * ain;
            a[i + last * lda] = sin * aij + cos * ain;
        }
    }
    for j in 0..last {
        let (cos, sin) = unpack_rotation(w[j]);
        for i in 0..m {
            let aij = a[i + j * lda];
            let ain = a[i + last * lda];
            a[i + j * lda] = cos * aij + sin * ain;
            a[i + last * lda] = -sin * aij + cos * ain;
        }
    }
}

/// Overwrites the `n x n` leading block of `r` with `(J^T J)^-1` in the
/// original column order, given the pivoted factor `J P = Q R`.
///
/// Columns whose pivot is at most `tol * |r_00|` are treated as linearly
/// dependent; their rows and columns of the result are zero.
pub(crate) fn covar(n: usize, r: &mut [f64], ldr: usize, ipvt: &[usize], tol: f64, wa: &mut [f64]) {
    let tolr = tol * r[0].abs();

    // Invert R in place, stopping at the first negligible pivot.
    let mut rank = 0;
    for k in 0..n {
        let kk = k + k * ldr;
        if r[kk].abs() <= tolr {
            break;
        }
        r[kk] = 1.0 / r[kk];
        for j in 0..k {
            let temp = r[kk] * r[j + k * ldr];
            r[j + k * ldr] = 0.0;
            for i in 0..=j {
                r[i + k * ldr] -= temp * r[i + j * ldr];
            }
        }
        rank = k + 1;
    }

    // Upper triangle of R^-1 (R^-1)^T.
    for k in 0..rank {
        for j in 0..k {
            let temp = r[j + k * ldr];
            for i in 0..=j {
                r[i + j * ldr] += temp * r[i + k * ldr];
            }
        }
        let temp = r[k + k * ldr];
        for i in 0..=k {
            r[i + k * ldr] *= temp;
        }
    }

    // Undo the permutation into the lower triangle.
    for j in 0..n {
        let jj = ipvt[j];
        let sing = j >= rank;
        for i in 0..=j {
            if sing {
                r[i + j * ldr] = 0.0;
            }
            let ii = ipvt[i];
            if ii > jj {
                r[ii + jj * ldr] = r[i + j * ldr];
            }
            if ii < jj {
                r[jj + ii * ldr] = r[i + j * ldr];
            }
        }
        wa[jj] = r[j + j * ldr];
    }

    for j in 0..n {
        for i in 0..=j {
            r[i + j * ldr] = r[j + i * ldr];
        }
        r[j + j * ldr] = wa[j];
    }
}
