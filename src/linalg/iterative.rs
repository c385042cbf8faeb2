use sprs::CsMat;
use std::time::Instant;

use super::preconditioner::{build_preconditioner, Preconditioner, PreconditionerKind};
use super::solver::{LinearOperator, Solver, SolverStats, SolverUtils};

fn zero_rhs_stats(start: Instant) -> SolverStats {
    SolverStats {
        converged: true,
        solve_time: start.elapsed().as_secs_f64(),
        ..SolverStats::default()
    }
}

/// BiCGSTAB (Biconjugate Gradient Stabilized) for the non-symmetric block system
pub struct BiCGSTAB {
    max_iterations: usize,
    tolerance: f64,
    abs_tolerance: f64,
    preconditioner: PreconditionerKind,
    blocks: Option<Vec<Vec<usize>>>,
    name: String,
}

impl BiCGSTAB {
    pub fn new() -> Self {
        Self {
            max_iterations: 1000,
            tolerance: 1e-8,
            abs_tolerance: 1e-12,
            preconditioner: PreconditionerKind::Jacobi,
            blocks: None,
            name: "BiCGSTAB".to_string(),
        }
    }

    pub fn with_max_iterations(mut self, max_iter: usize) -> Self { self.max_iterations = max_iter; self }
    pub fn with_tolerance(mut self, tol: f64) -> Self { self.tolerance = tol; self }
    pub fn with_abs_tolerance(mut self, abs_tol: f64) -> Self { self.abs_tolerance = abs_tol; self }
    pub fn with_preconditioner(mut self, kind: PreconditionerKind) -> Self { self.preconditioner = kind; self }

    fn is_converged(&self, res: f64, b_norm: f64) -> bool {
        res < self.tolerance * b_norm || res < self.abs_tolerance
    }

    /// Right-preconditioned BiCGSTAB on an arbitrary operator
    pub fn solve_with_operator<O>(&self, a: &O, b: &[f64], precond: &dyn Preconditioner) -> (Vec<f64>, SolverStats)
    where
        O: LinearOperator + ?Sized,
    {
        let n = b.len();
        let start = Instant::now();
        let b_norm = SolverUtils::norm(b);
        if b_norm == 0.0 {
            return (vec![0.0; n], zero_rhs_stats(start));
        }

        let mut x = vec![0.0; n];
        let mut r = b.to_vec();
        let r_hat = r.clone();
        let mut p = vec![0.0; n];
        let mut v = vec![0.0; n];
        let (mut rho, mut alpha, mut omega) = (1.0, 1.0, 1.0);

        let mut iterations = 0;
        let mut res = b_norm;
        let mut converged = false;

        while iterations < self.max_iterations {
            let rho_new = SolverUtils::dot(&r_hat, &r);
            if rho_new.abs() < f64::MIN_POSITIVE {
                log::debug!("BiCGSTAB breakdown (rho = 0) after {} iterations", iterations);
                break;
            }

            if iterations == 0 {
                p.copy_from_slice(&r);
            } else {
                let beta = (rho_new / rho) * (alpha / omega);
                for i in 0..n {
                    p[i] = r[i] + beta * (p[i] - omega * v[i]);
                }
            }
            rho = rho_new;

            let p_hat = precond.apply(&p);
            v = a.apply(&p_hat);
            let rhat_v = SolverUtils::dot(&r_hat, &v);
            if rhat_v.abs() < f64::MIN_POSITIVE {
                break;
            }
            alpha = rho / rhat_v;

            let mut s = r.clone();
            SolverUtils::axpy(-alpha, &v, &mut s);
            iterations += 1;

            let s_norm = SolverUtils::norm(&s);
            if self.is_converged(s_norm, b_norm) {
                SolverUtils::axpy(alpha, &p_hat, &mut x);
                res = s_norm;
                converged = true;
                break;
            }

            let s_hat = precond.apply(&s);
            let t = a.apply(&s_hat);
            let t_t = SolverUtils::dot(&t, &t);
            if t_t < f64::MIN_POSITIVE {
                break;
            }
            omega = SolverUtils::dot(&t, &s) / t_t;

            SolverUtils::axpy(alpha, &p_hat, &mut x);
            SolverUtils::axpy(omega, &s_hat, &mut x);
            r = s;
            SolverUtils::axpy(-omega, &t, &mut r);

            res = SolverUtils::norm(&r);
            if iterations % 50 == 0 {
                log::trace!("BiCGSTAB iter {:4}: res = {:.3e}, rel = {:.3e}", iterations, res, res / b_norm);
            }
            if self.is_converged(res, b_norm) {
                converged = true;
                break;
            }
            if omega.abs() < f64::MIN_POSITIVE {
                break;
            }
        }

        let stats = SolverStats {
            iterations,
            residual_norm: res,
            relative_residual: res / b_norm,
            converged,
            solve_time: start.elapsed().as_secs_f64(),
        };
        (x, stats)
    }
}

impl Solver for BiCGSTAB {
    fn solve(&mut self, a: &CsMat<f64>, b: &[f64]) -> (Vec<f64>, SolverStats) {
        let precond = build_preconditioner(self.preconditioner, a, self.blocks.as_deref());
        self.solve_with_operator(a, b, precond.as_ref())
    }

    fn name(&self) -> &str { &self.name }
    fn set_block_partition(&mut self, blocks: Vec<Vec<usize>>) { self.blocks = Some(blocks); }
    fn abs_tolerance(&self) -> f64 { self.abs_tolerance }
    fn set_abs_tolerance(&mut self, tolerance: f64) { self.abs_tolerance = tolerance; }
    fn tolerance(&self) -> f64 { self.tolerance }
    fn set_tolerance(&mut self, tolerance: f64) { self.tolerance = tolerance; }
}

/// Restarted GMRES(m), right-preconditioned
pub struct GMRES {
    max_iterations: usize,
    restart: usize,
    tolerance: f64,
    abs_tolerance: f64,
    preconditioner: PreconditionerKind,
    blocks: Option<Vec<Vec<usize>>>,
    name: String,
}

impl GMRES {
    pub fn new() -> Self {
        Self {
            max_iterations: 1000,
            restart: 30,
            tolerance: 1e-8,
            abs_tolerance: 1e-12,
            preconditioner: PreconditionerKind::Jacobi,
            blocks: None,
            name: "GMRES".to_string(),
        }
    }

    pub fn with_restart(mut self, m: usize) -> Self { self.restart = m.max(1); self }
    pub fn with_max_iterations(mut self, max_iter: usize) -> Self { self.max_iterations = max_iter; self }
    pub fn with_tolerance(mut self, tol: f64) -> Self { self.tolerance = tol; self }
    pub fn with_abs_tolerance(mut self, abs_tol: f64) -> Self { self.abs_tolerance = abs_tol; self }
    pub fn with_preconditioner(mut self, kind: PreconditionerKind) -> Self { self.preconditioner = kind; self }

    fn is_converged(&self, res: f64, b_norm: f64) -> bool {
        res < self.tolerance * b_norm || res < self.abs_tolerance
    }

    pub fn solve_with_operator<O>(&self, a: &O, b: &[f64], precond: &dyn Preconditioner) -> (Vec<f64>, SolverStats)
    where
        O: LinearOperator + ?Sized,
    {
        let n = b.len();
        let start = Instant::now();
        let b_norm = SolverUtils::norm(b);
        if b_norm == 0.0 {
            return (vec![0.0; n], zero_rhs_stats(start));
        }

        let m = self.restart;
        let mut x = vec![0.0; n];
        let mut iterations = 0;
        let mut res = b_norm;
        let mut converged = false;

        while iterations < self.max_iterations {
            let r = SolverUtils::compute_residual(a, &x, b);
            let beta = SolverUtils::norm(&r);
            res = beta;
            if self.is_converged(beta, b_norm) {
                converged = true;
                break;
            }

            // Arnoldi basis, Hessenberg columns and Givens rotations
            let mut basis: Vec<Vec<f64>> = vec![r.iter().map(|ri| ri / beta).collect()];
            let mut hess: Vec<Vec<f64>> = Vec::with_capacity(m);
            let mut rotations: Vec<(f64, f64)> = Vec::with_capacity(m);
            let mut g = vec![0.0; m + 1];
            g[0] = beta;

            for j in 0..m {
                if iterations >= self.max_iterations {
                    break;
                }
                let mut w = a.apply(&precond.apply(&basis[j]));
                let mut h = vec![0.0; j + 2];
                for (i, vi) in basis.iter().enumerate() {
                    h[i] = SolverUtils::dot(vi, &w);
                    SolverUtils::axpy(-h[i], vi, &mut w);
                }
                h[j + 1] = SolverUtils::norm(&w);

                for (i, &(c, s)) in rotations.iter().enumerate() {
                    let tmp = c * h[i] + s * h[i + 1];
                    h[i + 1] = -s * h[i] + c * h[i + 1];
                    h[i] = tmp;
                }
                let (c, s) = givens(h[j], h[j + 1]);
                h[j] = c * h[j] + s * h[j + 1];
                h[j + 1] = 0.0;
                g[j + 1] = -s * g[j];
                g[j] *= c;
                rotations.push((c, s));

                let next_norm = SolverUtils::norm(&w);
                hess.push(h);
                iterations += 1;
                res = g[j + 1].abs();

                if self.is_converged(res, b_norm) || next_norm < f64::MIN_POSITIVE {
                    break;
                }
                basis.push(w.iter().map(|wi| wi / next_norm).collect());
            }

            // back substitution on the triangular factor
            let k = hess.len();
            let mut y = vec![0.0; k];
            for i in (0..k).rev() {
                let sum: f64 = ((i + 1)..k).map(|l| hess[l][i] * y[l]).sum();
                y[i] = (g[i] - sum) / hess[i][i];
            }

            let mut dy = vec![0.0; n];
            for (vj, yj) in basis.iter().zip(&y) {
                SolverUtils::axpy(*yj, vj, &mut dy);
            }
            SolverUtils::axpy(1.0, &precond.apply(&dy), &mut x);

            log::trace!("GMRES restart after {} iterations: res = {:.3e}", iterations, res);
        }

        // the rotated estimate is not trusted for the final verdict
        if !converged {
            res = SolverUtils::norm(&SolverUtils::compute_residual(a, &x, b));
            converged = self.is_converged(res, b_norm);
        }

        let stats = SolverStats {
            iterations,
            residual_norm: res,
            relative_residual: res / b_norm,
            converged,
            solve_time: start.elapsed().as_secs_f64(),
        };
        (x, stats)
    }
}

/// Rotation (c, s) with c*a + s*b = sqrt(a² + b²) and -s*a + c*b = 0
fn givens(a: f64, b: f64) -> (f64, f64) {
    if b == 0.0 {
        (1.0, 0.0)
    } else {
        let r = a.hypot(b);
        (a / r, b / r)
    }
}

impl Solver for GMRES {
    fn solve(&mut self, a: &CsMat<f64>, b: &[f64]) -> (Vec<f64>, SolverStats) {
        let precond = build_preconditioner(self.preconditioner, a, self.blocks.as_deref());
        self.solve_with_operator(a, b, precond.as_ref())
    }

    fn name(&self) -> &str { &self.name }
    fn set_block_partition(&mut self, blocks: Vec<Vec<usize>>) { self.blocks = Some(blocks); }
    fn abs_tolerance(&self) -> f64 { self.abs_tolerance }
    fn set_abs_tolerance(&mut self, tolerance: f64) { self.abs_tolerance = tolerance; }
    fn tolerance(&self) -> f64 { self.tolerance }
    fn set_tolerance(&mut self, tolerance: f64) { self.tolerance = tolerance; }
}

impl Default for BiCGSTAB { fn default() -> Self { Self::new() } }
impl Default for GMRES { fn default() -> Self { Self::new() } }

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use sprs::TriMat;

    /// 1D convection-diffusion stencil, non-symmetric
    fn convection_diffusion(n: usize) -> CsMat<f64> {
        let mut t = TriMat::new((n, n));
        for i in 0..n {
            t.add_triplet(i, i, 2.5);
            if i > 0 {
                t.add_triplet(i, i - 1, -1.5);
            }
            if i + 1 < n {
                t.add_triplet(i, i + 1, -0.5);
            }
        }
        t.to_csr()
    }

    fn check_solution(a: &CsMat<f64>, x: &[f64], b: &[f64]) {
        let (_, rel) = SolverUtils::relative_residual(a, x, b);
        assert!(rel < 1e-7, "relative residual {}", rel);
    }

    #[test]
    fn test_bicgstab_nonsymmetric() {
        let a = convection_diffusion(40);
        let b = vec![1.0; 40];
        let mut solver = BiCGSTAB::new().with_tolerance(1e-10);
        let (x, stats) = solver.solve(&a, &b);
        assert!(stats.converged);
        check_solution(&a, &x, &b);
    }

    #[test]
    fn test_gmres_with_short_restart() {
        let a = convection_diffusion(40);
        let b: Vec<f64> = (0..40).map(|i| (i as f64 * 0.3).sin()).collect();
        let mut solver = GMRES::new().with_restart(5).with_tolerance(1e-10);
        let (x, stats) = solver.solve(&a, &b);
        assert!(stats.converged);
        assert!(stats.iterations > 5);
        check_solution(&a, &x, &b);
    }

    #[test]
    fn test_gmres_block_jacobi() {
        let a = convection_diffusion(10);
        let b = vec![1.0; 10];
        let mut solver = GMRES::new().with_preconditioner(PreconditionerKind::BlockJacobi);
        solver.set_block_partition(vec![(0..5).collect(), (5..10).collect()]);
        let (x, stats) = solver.solve(&a, &b);
        assert!(stats.converged);
        check_solution(&a, &x, &b);
    }

    #[test]
    fn test_zero_rhs_gives_zero_solution() {
        let a = convection_diffusion(4);
        let (x, stats) = BiCGSTAB::new().solve(&a, &[0.0; 4]);
        assert!(stats.converged);
        assert_eq!(x, vec![0.0; 4]);
    }

    #[test]
    fn test_iteration_cap_is_reported() {
        let a = convection_diffusion(50);
        let b = vec![1.0; 50];
        let mut solver = GMRES::new()
            .with_restart(2)
            .with_max_iterations(2)
            .with_preconditioner(PreconditionerKind::None)
            .with_tolerance(1e-14);
        let (_, stats) = solver.solve(&a, &b);
        assert!(!stats.converged);
        assert_eq!(stats.iterations, 2);
        assert_relative_eq!(stats.relative_residual, stats.residual_norm / SolverUtils::norm(&b), epsilon = 1e-14);
    }
}
