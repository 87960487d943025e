//! Trust-region step calculators.

use crate::linalg::{enorm, packed_diag, qrsolv};

const P1: f64 = 0.1;
const P001: f64 = 0.001;

/// Levenberg-Marquardt parameter for a trust region of radius `delta`.
///
/// Given the pivoted factor `J P = Q R` (R in the upper triangle of `r`) and
/// `qtb = Q^T f`, finds `par >= 0` such that the solution `x` of
///
/// ```text
/// min || [J; sqrt(par) D] x - [f; 0] ||
/// ```
///
/// satisfies `| ||D x|| - delta | <= 0.1 delta`, or `par == 0` with
/// `||D x|| <= 1.1 delta` when the Gauss-Newton step already fits. The
/// search is a safeguarded Newton iteration on `par` bracketed by
/// `[parl, paru]`, limited to ten solves. `par` is the starting guess.
///
/// On return `x` holds the solution, `sdiag` the diagonal of the factor of
/// the augmented system, and the strict lower triangle of `r` its transpose.
#[allow(clippy::too_many_arguments)]
pub(crate) fn lmpar(
    n: usize,
    r: &mut [f64],
    ldr: usize,
    ipvt: &[usize],
    diag: &[f64],
    qtb: &[f64],
    delta: f64,
    par: f64,
    x: &mut [f64],
    sdiag: &mut [f64],
    wa1: &mut [f64],
    wa2: &mut [f64],
) -> f64 {
    let dwarf = f64::MIN_POSITIVE;

    // Gauss-Newton direction; a least-squares solution if R is singular.
    let mut nsing = n;
    for j in 0..n {
        wa1[j] = qtb[j];
        if r[j + j * ldr] == 0.0 && nsing == n {
            nsing = j;
        }
        if nsing < n {
            wa1[j] = 0.0;
        }
    }
    for j in (0..nsing).rev() {
        wa1[j] /= r[j + j * ldr];
        let temp = wa1[j];
        for i in 0..j {
            wa1[i] -= r[i + j * ldr] * temp;
        }
    }
    for j in 0..n {
        x[ipvt[j]] = wa1[j];
    }

    for j in 0..n {
        wa2[j] = diag[j] * x[j];
    }
    let mut dxnorm = enorm(&wa2[..n]);
    let mut fp = dxnorm - delta;
    if fp <= P1 * delta {
        return 0.0;
    }

    // Lower bound from the Newton step at par = 0; only valid at full rank.
    let mut parl = 0.0;
    if nsing >= n {
        for j in 0..n {
            let l = ipvt[j];
            wa1[j] = diag[l] * (wa2[l] / dxnorm);
        }
        for j in 0..n {
            let mut sum = 0.0;
            for i in 0..j {
                sum += r[i + j * ldr] * wa1[i];
            }
            wa1[j] = (wa1[j] - sum) / r[j + j * ldr];
        }
        let temp = enorm(&wa1[..n]);
        parl = ((fp / delta) / temp) / temp;
    }

    // Upper bound from the scaled gradient.
    for j in 0..n {
        let mut sum = 0.0;
        for i in 0..=j {
            sum += r[i + j * ldr] * qtb[i];
        }
        wa1[j] = sum / diag[ipvt[j]];
    }
    let gnorm = enorm(&wa1[..n]);
    let mut paru = gnorm / delta;
    if paru == 0.0 {
        paru = dwarf / delta.min(P1);
    }

    let mut par = par.max(parl).min(paru);
    if par == 0.0 {
        par = gnorm / dxnorm;
    }

    let mut iter = 0;
    loop {
        iter += 1;
        if par == 0.0 {
            par = dwarf.max(P001 * paru);
        }

        let temp = par.sqrt();
        for j in 0..n {
            wa1[j] = temp * diag[j];
        }
        qrsolv(n, r, ldr, ipvt, &wa1[..n], qtb, x, sdiag, wa2);
        for j in 0..n {
            wa2[j] = diag[j] * x[j];
        }
        dxnorm = enorm(&wa2[..n]);
        let previous = fp;
        fp = dxnorm - delta;

        if fp.abs() <= P1 * delta
            || (parl == 0.0 && fp <= previous && previous < 0.0)
            || iter == 10
        {
            return par;
        }

        // Newton correction.
        for j in 0..n {
            let l = ipvt[j];
            wa1[j] = diag[l] * (wa2[l] / dxnorm);
        }
        for j in 0..n {
            wa1[j] /= sdiag[j];
            let temp = wa1[j];
            for i in j + 1..n {
                wa1[i] -= r[i + j * ldr] * temp;
            }
        }
        let temp = enorm(&wa1[..n]);
        let parc = ((fp / delta) / temp) / temp;

        if fp > 0.0 {
            parl = parl.max(par);
        }
        if fp < 0.0 {
            paru = paru.min(par);
        }
        par = parl.max(par + parc);
    }
}

/// Powell's dogleg step for the packed upper triangular `r` (stored by rows).
///
/// Returns in `x` the point on the dogleg path between the scaled
/// steepest-descent minimizer and the Gauss-Newton step `R^-1 qtb` that
/// minimizes the linear model within `||D x|| <= delta`. Zero pivots of R
/// are replaced by a small multiple of the largest entry in their column,
/// which bends the Gauss-Newton direction towards steepest descent.
#[allow(clippy::too_many_arguments)]
pub(crate) fn dogleg(
    n: usize,
    r: &[f64],
    diag: &[f64],
    qtb: &[f64],
    delta: f64,
    x: &mut [f64],
    wa1: &mut [f64],
    wa2: &mut [f64],
) {
    let epsmch = f64::EPSILON;

    for j in (0..n).rev() {
        let jj = packed_diag(n, j);
        let mut sum = 0.0;
        for i in j + 1..n {
            sum += r[jj + i - j] * x[i];
        }
        let mut temp = r[jj];
        if temp == 0.0 {
            for i in 0..=j {
                temp = temp.max(r[packed_diag(n, i) + j - i].abs());
            }
            temp *= epsmch;
            if temp == 0.0 {
                temp = epsmch;
            }
        }
        x[j] = (qtb[j] - sum) / temp;
    }

    for j in 0..n {
        wa1[j] = 0.0;
        wa2[j] = diag[j] * x[j];
    }
    let qnorm = enorm(&wa2[..n]);
    if qnorm <= delta {
        return;
    }

    // Scaled gradient direction R^T qtb / D.
    let mut l = 0;
    for j in 0..n {
        let temp = qtb[j];
        for i in j..n {
            wa1[i] += r[l] * temp;
            l += 1;
        }
        wa1[j] /= diag[j];
    }

    let gnorm = enorm(&wa1[..n]);
    let mut sgnorm = 0.0;
    let mut alpha = delta / qnorm;
    if gnorm != 0.0 {
        for j in 0..n {
            wa1[j] = (wa1[j] / gnorm) / diag[j];
        }
        let mut l = 0;
        for j in 0..n {
            let mut sum = 0.0;
            for i in j..n {
                sum += r[l] * wa1[i];
                l += 1;
            }
            wa2[j] = sum;
        }
        let temp = enorm(&wa2[..n]);
        sgnorm = (gnorm / temp) / temp;

        alpha = 0.0;
        if sgnorm < delta {
            // Point along the dogleg where the path leaves the trust region.
            let bnorm = enorm(&qtb[..n]);
            let dq = delta / qnorm;
            let sd = sgnorm / delta;
            let mut temp = (bnorm / gnorm) * (bnorm / qnorm) * sd;
            temp = temp - dq * sd * sd
                + ((temp - dq) * (temp - dq) + (1.0 - dq * dq) * (1.0 - sd * sd)).sqrt();
            alpha = (dq * (1.0 - sd * sd)) / temp;
        }
    }

    let temp = (1.0 - alpha) * sgnorm.min(delta);
    for j in 0..n {
        x[j] = temp * wa1[j] + alpha * x[j];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // R = [[2, 1], [0, 3]], Q^T f = [4, 3]; Gauss-Newton solution (1.5, 1).
    fn full_r() -> Vec<f64> {
        vec![2.0, 0.0, 1.0, 3.0]
    }

    fn packed_r() -> Vec<f64> {
        vec![2.0, 1.0, 3.0]
    }

    const QTB: [f64; 2] = [4.0, 3.0];

    fn run_lmpar(delta: f64, diag: &[f64]) -> (f64, Vec<f64>) {
        let mut r = full_r();
        let mut x = vec![0.0; 2];
        let mut sdiag = vec![0.0; 2];
        let mut wa1 = vec![0.0; 2];
        let mut wa2 = vec![0.0; 2];
        let par = lmpar(
            2, &mut r, 2, &[0, 1], diag, &QTB, delta, 0.0, &mut x, &mut sdiag, &mut wa1,
            &mut wa2,
        );
        // Upper triangle must survive.
        assert_eq!(r[0], 2.0);
        assert_eq!(r[2], 1.0);
        assert_eq!(r[3], 3.0);
        (par, x)
    }

    #[test]
    fn lmpar_takes_gauss_newton_step_inside_region() {
        let (par, x) = run_lmpar(10.0, &[1.0, 1.0]);
        assert_eq!(par, 0.0);
        assert_relative_eq!(x[0], 1.5, epsilon = 1e-14);
        assert_relative_eq!(x[1], 1.0, epsilon = 1e-14);
    }

    #[test]
    fn lmpar_lands_near_boundary() {
        let diag = [1.0, 2.0];
        for &delta in &[0.05, 0.5, 1.5] {
            let (par, x) = run_lmpar(delta, &diag);
            assert!(par > 0.0);
            let dxnorm = enorm(&[diag[0] * x[0], diag[1] * x[1]]);
            assert!((dxnorm - delta).abs() <= 0.1 * delta, "delta={delta} dxnorm={dxnorm}");
        }
    }

    #[test]
    fn dogleg_inside_and_on_boundary() {
        let r = packed_r();
        let diag = [1.0, 1.0];
        let mut x = vec![0.0; 2];
        let mut wa1 = vec![0.0; 2];
        let mut wa2 = vec![0.0; 2];

        dogleg(2, &r, &diag, &QTB, 10.0, &mut x, &mut wa1, &mut wa2);
        assert_relative_eq!(x[0], 1.5, epsilon = 1e-14);
        assert_relative_eq!(x[1], 1.0, epsilon = 1e-14);

        for &delta in &[0.1, 1.0, 1.7] {
            dogleg(2, &r, &diag, &QTB, delta, &mut x, &mut wa1, &mut wa2);
            assert_relative_eq!(enorm(&x), delta, max_relative = 1e-12);
        }
    }

    #[test]
    fn dogleg_handles_singular_factor() {
        // Second pivot is zero: the step must stay finite and within the region.
        let r = vec![2.0, 1.0, 0.0];
        let diag = [1.0, 1.0];
        let mut x = vec![0.0; 2];
        let mut wa1 = vec![0.0; 2];
        let mut wa2 = vec![0.0; 2];
        dogleg(2, &r, &diag, &QTB, 0.5, &mut x, &mut wa1, &mut wa2);
        assert!(x.iter().all(|v| v.is_finite()));
        assert!(enorm(&x) <= 0.5 * (1.0 + 1e-12));
    }
}
