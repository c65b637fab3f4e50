use std::fmt::Display;

use nalgebra::{DMatrix, DVector};
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    constraints::Constraint,
    particles::{BlockId, Kinematics, ParameterBlock, Parametrization},
    utils::{
        functions::chi2_probability,
        vectors::{Vec3, Vec4},
    },
    KinFitError, KinFitResult,
};

/// Stopping criteria for a [`Fitter`].
///
/// The defaults are those used by the decay finders: at most 50 iterations, with convergence
/// declared once the $`\chi^2`$ changes by less than `5e-5` between iterations and the sum of
/// the absolute constraint values is below `1e-4`.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitterConfig {
    /// The maximum number of iterations.
    pub max_iterations: usize,
    /// The largest change in $`S`$ between consecutive iterations for convergence.
    pub max_delta_s: f64,
    /// The largest $`\sum_k |f_k|`$ for convergence.
    pub max_f: f64,
}

impl Default for FitterConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            max_delta_s: 5e-5,
            max_f: 1e-4,
        }
    }
}

impl FitterConfig {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }
    pub fn with_max_delta_s(mut self, max_delta_s: f64) -> Self {
        self.max_delta_s = max_delta_s;
        self
    }
    pub fn with_max_f(mut self, max_f: f64) -> Self {
        self.max_f = max_f;
        self
    }
    fn validate(&self) -> KinFitResult<()> {
        if self.max_iterations == 0 {
            return Err(KinFitError::config("max_iterations must be at least 1"));
        }
        if !(self.max_delta_s.is_finite() && self.max_delta_s > 0.0) {
            return Err(KinFitError::config(format!(
                "max_delta_s must be positive (got {})",
                self.max_delta_s
            )));
        }
        if !(self.max_f.is_finite() && self.max_f > 0.0) {
            return Err(KinFitError::config(format!(
                "max_f must be positive (got {})",
                self.max_f
            )));
        }
        Ok(())
    }
}

/// Every [`ParameterBlock`] and [`Constraint`] describing one candidate hypothesis.
///
/// Blocks are added first and referred to by the [`BlockId`] returned from
/// [`FitSystem::add_block`]. Constraints are validated against the blocks as they are added.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FitSystem {
    blocks: Vec<ParameterBlock>,
    constraints: Vec<Box<dyn Constraint>>,
}

impl FitSystem {
    /// Register a block and return the tag constraints should use to refer to it.
    pub fn add_block(&mut self, block: ParameterBlock) -> BlockId {
        self.blocks.push(block);
        BlockId(self.blocks.len() - 1)
    }
    /// Register a constraint.
    ///
    /// # Errors
    ///
    /// Returns a [`KinFitError::ConfigurationError`] if [`Constraint::check`] rejects the
    /// blocks registered so far.
    pub fn add_constraint<C: Constraint + 'static>(&mut self, constraint: C) -> KinFitResult<()> {
        self.add_boxed_constraint(Box::new(constraint))
    }
    /// Register an already boxed constraint. See [`FitSystem::add_constraint`].
    pub fn add_boxed_constraint(&mut self, constraint: Box<dyn Constraint>) -> KinFitResult<()> {
        constraint.check(&self.blocks)?;
        self.constraints.push(constraint);
        Ok(())
    }
    pub fn blocks(&self) -> &[ParameterBlock] {
        &self.blocks
    }
    pub fn block(&self, id: BlockId) -> Option<&ParameterBlock> {
        self.blocks.get(id.index())
    }
    pub fn constraints(&self) -> &[Box<dyn Constraint>] {
        &self.constraints
    }
    /// The total number of scalar constraint equations.
    pub fn n_equations(&self) -> usize {
        self.constraints.iter().map(|c| c.n_equations()).sum()
    }
    /// The total number of nuisance parameters owned by the constraints.
    pub fn n_nuisance(&self) -> usize {
        self.constraints.iter().map(|c| c.n_nuisance()).sum()
    }
    /// The total number of unmeasured block parameters.
    pub fn n_unmeasured(&self) -> usize {
        self.blocks.iter().map(|b| b.n_unmeasured()).sum()
    }
    /// The number of degrees of freedom of the fit (which may be zero or negative).
    pub fn ndf(&self) -> i64 {
        self.n_equations() as i64 - self.n_nuisance() as i64 - self.n_unmeasured() as i64
    }
    /// The residual of every constraint at the measured values.
    pub fn init_values(&self) -> Vec<DVector<f64>> {
        self.constraints
            .iter()
            .map(|c| c.init_value(&self.blocks))
            .collect()
    }
    /// Check every block and constraint again. This catches systems assembled through
    /// deserialization, which bypasses [`FitSystem::add_constraint`].
    pub fn validate(&self) -> KinFitResult<()> {
        if self.constraints.is_empty() {
            return Err(KinFitError::config("the system has no constraints"));
        }
        for block in &self.blocks {
            block.validate()?;
        }
        for constraint in &self.constraints {
            constraint.check(&self.blocks)?;
            if let Some(nuisance) = constraint.nuisance() {
                nuisance.validate(constraint.name())?;
            }
            if constraint.initial_alpha().len() != constraint.n_nuisance() {
                return Err(KinFitError::config(format!(
                    "constraint \"{}\" starts with {} nuisance values but declares {}",
                    constraint.name(),
                    constraint.initial_alpha().len(),
                    constraint.n_nuisance()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug)]
enum Column {
    Measured(usize),
    Unmeasured(usize),
}

/// Where each parameter of the system lives in the stacked vectors the solver works with.
/// Measured block parameters come first in `y`, followed by the nuisance parameters of each
/// constraint in order. Unmeasured block parameters make up `a`.
struct Layout {
    columns: Vec<Vec<Column>>,
    measured: Vec<(usize, usize)>,
    unmeasured: Vec<(usize, usize)>,
    nuisance_offsets: Vec<usize>,
    equation_offsets: Vec<usize>,
    n_y: usize,
    n_eq: usize,
}

impl Layout {
    fn new(system: &FitSystem) -> Self {
        let mut columns = Vec::with_capacity(system.blocks.len());
        let mut measured = Vec::new();
        let mut unmeasured = Vec::new();
        for (b, block) in system.blocks.iter().enumerate() {
            let mut block_columns = Vec::with_capacity(block.n_par());
            for p in 0..block.n_par() {
                if block.is_unmeasured(p) {
                    block_columns.push(Column::Unmeasured(unmeasured.len()));
                    unmeasured.push((b, p));
                } else {
                    block_columns.push(Column::Measured(measured.len()));
                    measured.push((b, p));
                }
            }
            columns.push(block_columns);
        }
        let mut offset = measured.len();
        let mut nuisance_offsets = Vec::with_capacity(system.constraints.len());
        let mut equation = 0;
        let mut equation_offsets = Vec::with_capacity(system.constraints.len());
        for constraint in &system.constraints {
            nuisance_offsets.push(offset);
            offset += constraint.n_nuisance();
            equation_offsets.push(equation);
            equation += constraint.n_equations();
        }
        Self {
            columns,
            measured,
            unmeasured,
            nuisance_offsets,
            equation_offsets,
            n_y: offset,
            n_eq: equation,
        }
    }
    fn n_measured(&self) -> usize {
        self.measured.len()
    }
    fn n_a(&self) -> usize {
        self.unmeasured.len()
    }
    /// The block-diagonal covariance of `y`.
    fn covariance(&self, system: &FitSystem) -> DMatrix<f64> {
        let mut v = DMatrix::zeros(self.n_y, self.n_y);
        for (i, &(bi, pi)) in self.measured.iter().enumerate() {
            for (j, &(bj, pj)) in self.measured.iter().enumerate() {
                if bi == bj {
                    v[(i, j)] = system.blocks[bi].measured().covariance()[(pi, pj)];
                }
            }
        }
        for (constraint, &offset) in system.constraints.iter().zip(&self.nuisance_offsets) {
            if let Some(nuisance) = constraint.nuisance() {
                v.view_mut((offset, offset), (nuisance.len(), nuisance.len()))
                    .copy_from(nuisance.covariance());
            }
        }
        v
    }
    fn y(&self, state: &WorkingState) -> DVector<f64> {
        let mut y = DVector::zeros(self.n_y);
        for (i, &(b, p)) in self.measured.iter().enumerate() {
            y[i] = state.values[b][p];
        }
        for (alpha, &offset) in state.alpha.iter().zip(&self.nuisance_offsets) {
            y.rows_mut(offset, alpha.len()).copy_from(alpha);
        }
        y
    }
    fn a(&self, state: &WorkingState) -> DVector<f64> {
        DVector::from_iterator(
            self.n_a(),
            self.unmeasured.iter().map(|&(b, p)| state.values[b][p]),
        )
    }
}

/// The solver-owned values of every block parameter and nuisance parameter during one fit.
#[derive(Clone, Debug)]
struct WorkingState {
    values: Vec<DVector<f64>>,
    alpha: Vec<DVector<f64>>,
}

impl WorkingState {
    fn initial(system: &FitSystem) -> Self {
        Self {
            values: system
                .blocks
                .iter()
                .map(|b| b.measured().values().clone())
                .collect(),
            alpha: system
                .constraints
                .iter()
                .map(|c| c.initial_alpha())
                .collect(),
        }
    }
    fn update(&mut self, layout: &Layout, y: &DVector<f64>, a: &DVector<f64>) {
        for (i, &(b, p)) in layout.measured.iter().enumerate() {
            self.values[b][p] = y[i];
        }
        for (k, &(b, p)) in layout.unmeasured.iter().enumerate() {
            self.values[b][p] = a[k];
        }
        for (alpha, &offset) in self.alpha.iter_mut().zip(&layout.nuisance_offsets) {
            let n = alpha.len();
            alpha.copy_from(&y.rows(offset, n));
        }
    }
    fn residuals(&self, system: &FitSystem) -> KinFitResult<Vec<DVector<f64>>> {
        let kinematics = Kinematics::new(&system.blocks, &self.values);
        system
            .constraints
            .iter()
            .zip(&self.alpha)
            .map(|(c, alpha)| {
                let value = c.current_value(&kinematics, alpha);
                if value.len() != c.n_equations() {
                    return Err(KinFitError::config(format!(
                        "constraint \"{}\" returned {} values (expected {})",
                        c.name(),
                        value.len(),
                        c.n_equations()
                    )));
                }
                Ok(value)
            })
            .collect()
    }
    /// The Jacobians $`A = \partial f / \partial y`$ and $`B = \partial f / \partial a`$.
    fn derivatives(
        &self,
        system: &FitSystem,
        layout: &Layout,
    ) -> KinFitResult<(DMatrix<f64>, DMatrix<f64>)> {
        let kinematics = Kinematics::new(&system.blocks, &self.values);
        let mut a_mat = DMatrix::zeros(layout.n_eq, layout.n_y);
        let mut b_mat = DMatrix::zeros(layout.n_eq, layout.n_a());
        for (c, constraint) in system.constraints.iter().enumerate() {
            let row = layout.equation_offsets[c];
            let n_eq = constraint.n_equations();
            let alpha = &self.alpha[c];
            let mut ids = constraint.blocks();
            ids.sort();
            ids.dedup();
            for id in ids {
                let derivative = constraint.derivative(id, &kinematics, alpha);
                let n_par = kinematics.n_par(id);
                if derivative.shape() != (n_eq, n_par) {
                    return Err(KinFitError::config(format!(
                        "constraint \"{}\" returned a {}x{} derivative for block {} (expected {}x{})",
                        constraint.name(),
                        derivative.nrows(),
                        derivative.ncols(),
                        id,
                        n_eq,
                        n_par
                    )));
                }
                for (p, column) in layout.columns[id.index()].iter().enumerate() {
                    for k in 0..n_eq {
                        match *column {
                            Column::Measured(i) => a_mat[(row + k, i)] += derivative[(k, p)],
                            Column::Unmeasured(i) => b_mat[(row + k, i)] += derivative[(k, p)],
                        }
                    }
                }
            }
            let n_nuisance = constraint.n_nuisance();
            if n_nuisance > 0 {
                let derivative = constraint.derivative_alpha(&kinematics, alpha);
                if derivative.shape() != (n_eq, n_nuisance) {
                    return Err(KinFitError::config(format!(
                        "constraint \"{}\" returned a {}x{} nuisance derivative (expected {}x{})",
                        constraint.name(),
                        derivative.nrows(),
                        derivative.ncols(),
                        n_eq,
                        n_nuisance
                    )));
                }
                a_mat
                    .view_mut((row, layout.nuisance_offsets[c]), (n_eq, n_nuisance))
                    .copy_from(&derivative);
            }
        }
        Ok((a_mat, b_mat))
    }
}

fn stack(parts: &[DVector<f64>]) -> DVector<f64> {
    DVector::from_iterator(
        parts.iter().map(|p| p.len()).sum(),
        parts.iter().flat_map(|p| p.iter().copied()),
    )
}

fn ensure_finite<'a, I: IntoIterator<Item = &'a f64>>(
    iteration: usize,
    what: &str,
    values: I,
) -> KinFitResult<()> {
    if values.into_iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(KinFitError::singular(
            iteration,
            format!("non-finite values in {}", what),
        ))
    }
}

fn invert_positive_definite(
    matrix: DMatrix<f64>,
    iteration: usize,
    what: &str,
) -> KinFitResult<DMatrix<f64>> {
    let inverse = matrix
        .cholesky()
        .map(|c| c.inverse())
        .ok_or_else(|| KinFitError::singular(iteration, format!("{} is not positive definite", what)))?;
    ensure_finite(iteration, what, inverse.iter())?;
    Ok(inverse)
}

/// The linearized system from the last iteration, kept for error propagation.
struct Linearization {
    a: DMatrix<f64>,
    b: DMatrix<f64>,
    v_d: DMatrix<f64>,
    m_inv: DMatrix<f64>,
}

/// The Newton-Lagrange kinematic fitter.
///
/// Each iteration linearizes every constraint at the current point, eliminates the Lagrange
/// multipliers analytically, and takes the step
///
/// ```math
/// \Delta y = -V A^\intercal V_D \left(f + A(y_0 - y) + B\,\delta a\right), \quad
/// V_D = \left(A V A^\intercal\right)^{-1}
/// ```
///
/// from the measured point $`y_0`$, where
/// $`\delta a = -(B^\intercal V_D B)^{-1} B^\intercal V_D (f + A(y_0 - y))`$ updates any
/// unmeasured parameters. The fit stops once both the change in
/// $`S = \Delta y^\intercal V^{-1} \Delta y`$ and the sum of the absolute constraint values
/// fall below the [`FitterConfig`] tolerances.
#[derive(Clone, Debug, Default)]
pub struct Fitter {
    config: FitterConfig,
}

impl Fitter {
    /// Create a [`Fitter`] with the given stopping criteria.
    ///
    /// # Errors
    ///
    /// Returns a [`KinFitError::ConfigurationError`] for a zero iteration cap or a
    /// non-positive tolerance.
    pub fn new(config: FitterConfig) -> KinFitResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }
    pub fn config(&self) -> &FitterConfig {
        &self.config
    }

    /// Fit a single system. The system is not modified.
    ///
    /// # Errors
    ///
    /// * [`KinFitError::ConfigurationError`] if the system is malformed.
    /// * [`KinFitError::SingularSystemError`] if the covariance or a linearized system cannot
    ///   be inverted, or if any quantity becomes non-finite.
    /// * [`KinFitError::NonConvergenceError`] if the iteration cap is reached.
    pub fn fit(&self, system: &FitSystem) -> KinFitResult<FitResult> {
        self.config.validate()?;
        system.validate()?;
        let layout = Layout::new(system);
        log::trace!(
            "fitting {} measured, {} nuisance, and {} unmeasured parameters with {} equations",
            layout.n_measured(),
            layout.n_y - layout.n_measured(),
            layout.n_a(),
            layout.n_eq
        );
        let v = layout.covariance(system);
        let v_inv = invert_positive_definite(v.clone(), 0, "the measured covariance").map_err(|e| {
            log::warn!("kinematic fit failed: {}", e);
            e
        })?;
        let mut state = WorkingState::initial(system);
        let y0 = layout.y(&state);
        let mut a = layout.a(&state);
        let mut residuals = state.residuals(system)?;
        let mut f = stack(&residuals);
        ensure_finite(0, "the initial constraint values", f.iter())?;

        let mut s_prev = 0.0;
        let mut delta_s = f64::INFINITY;
        let mut f_sum = f.iter().map(|v| v.abs()).sum::<f64>();
        for iteration in 1..=self.config.max_iterations {
            let step = self.step(system, &layout, &v, &y0, &f, &mut state, &mut a, iteration);
            let (delta, linearization) = match step {
                Ok(step) => step,
                Err(e) => {
                    log::warn!("kinematic fit failed: {}", e);
                    return Err(e);
                }
            };
            residuals = state.residuals(system)?;
            f = stack(&residuals);
            let s = delta.dot(&(&v_inv * &delta));
            f_sum = f.iter().map(|v| v.abs()).sum::<f64>();
            if !s.is_finite() || !f_sum.is_finite() {
                let e = KinFitError::singular(iteration, "non-finite chi-square or constraint values");
                log::warn!("kinematic fit failed: {}", e);
                return Err(e);
            }
            delta_s = (s - s_prev).abs();
            log::debug!(
                "iteration {}: S = {:.6e}, delta S = {:.3e}, F = {:.3e}",
                iteration,
                s,
                delta_s,
                f_sum
            );
            if delta_s < self.config.max_delta_s && f_sum < self.config.max_f {
                return FitResult::new(
                    system,
                    &layout,
                    &state,
                    residuals,
                    &v,
                    &v_inv,
                    &delta,
                    &linearization,
                    iteration,
                );
            }
            s_prev = s;
        }
        log::warn!(
            "kinematic fit did not converge after {} iterations (delta S = {:e}, F = {:e})",
            self.config.max_iterations,
            delta_s,
            f_sum
        );
        Err(KinFitError::NonConvergenceError {
            iterations: self.config.max_iterations,
            delta_s,
            f: f_sum,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn step(
        &self,
        system: &FitSystem,
        layout: &Layout,
        v: &DMatrix<f64>,
        y0: &DVector<f64>,
        f: &DVector<f64>,
        state: &mut WorkingState,
        a: &mut DVector<f64>,
        iteration: usize,
    ) -> KinFitResult<(DVector<f64>, Linearization)> {
        let (a_mat, b_mat) = state.derivatives(system, layout)?;
        ensure_finite(iteration, "the constraint derivatives", a_mat.iter().chain(b_mat.iter()))?;
        let y = layout.y(state);
        let mut r = f + &a_mat * (y0 - &y);
        let v_d = invert_positive_definite(&a_mat * v * a_mat.transpose(), iteration, "A V A^T")?;
        let m_inv = if layout.n_a() > 0 {
            let bt_vd = b_mat.transpose() * &v_d;
            let m_inv = invert_positive_definite(&bt_vd * &b_mat, iteration, "B^T V_D B")?;
            let delta_a = -(&m_inv * (&bt_vd * &r));
            *a += &delta_a;
            r += &b_mat * &delta_a;
            m_inv
        } else {
            DMatrix::zeros(0, 0)
        };
        let lambda = &v_d * &r;
        let delta = -(v * (a_mat.transpose() * lambda));
        let y_new = y0 + &delta;
        ensure_finite(iteration, "the updated parameters", y_new.iter().chain(a.iter()))?;
        state.update(layout, &y_new, a);
        Ok((
            delta,
            Linearization {
                a: a_mat,
                b: b_mat,
                v_d,
                m_inv,
            },
        ))
    }

    /// Fit many independent systems, in parallel over the global [`rayon`] thread pool.
    /// One failed fit does not affect the others; the outcomes are returned in order.
    #[cfg(feature = "rayon")]
    pub fn fit_many(&self, systems: &[FitSystem]) -> Vec<KinFitResult<FitResult>> {
        systems.par_iter().map(|system| self.fit(system)).collect()
    }

    /// Fit many independent systems one after another. One failed fit does not affect the
    /// others; the outcomes are returned in order.
    #[cfg(not(feature = "rayon"))]
    pub fn fit_many(&self, systems: &[FitSystem]) -> Vec<KinFitResult<FitResult>> {
        systems.iter().map(|system| self.fit(system)).collect()
    }
}

/// A block's parameters after the fit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FittedBlock {
    name: String,
    parametrization: Parametrization,
    mass: f64,
    values: DVector<f64>,
    covariance: DMatrix<f64>,
}

impl FittedBlock {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn parametrization(&self) -> Parametrization {
        self.parametrization
    }
    /// The fitted parameter values.
    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }
    /// The covariance of the fitted parameters (including unmeasured ones).
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }
    /// The fitted four-momentum (zero for vertex blocks).
    pub fn p4(&self) -> Vec4 {
        self.parametrization.p4(&self.values, self.mass)
    }
    /// The fitted position (the origin for momentum blocks).
    pub fn position(&self) -> Vec3 {
        self.parametrization.position(&self.values)
    }
}

/// The outcome of a converged fit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FitResult {
    chi2_measured: f64,
    chi2_nuisance: f64,
    ndf: i64,
    p_value: Option<f64>,
    iterations: usize,
    blocks: Vec<FittedBlock>,
    nuisance: Vec<DVector<f64>>,
    residuals: Vec<DVector<f64>>,
}

impl FitResult {
    #[allow(clippy::too_many_arguments)]
    fn new(
        system: &FitSystem,
        layout: &Layout,
        state: &WorkingState,
        residuals: Vec<DVector<f64>>,
        v: &DMatrix<f64>,
        v_inv: &DMatrix<f64>,
        delta: &DVector<f64>,
        linearization: &Linearization,
        iterations: usize,
    ) -> KinFitResult<Self> {
        let n_m = layout.n_measured();
        let n_n = layout.n_y - n_m;
        let delta_m = delta.rows(0, n_m).into_owned();
        let delta_n = delta.rows(n_m, n_n).into_owned();
        let chi2_measured = delta_m.dot(&(v_inv.view((0, 0), (n_m, n_m)) * &delta_m));
        let chi2_nuisance = delta_n.dot(&(v_inv.view((n_m, n_m), (n_n, n_n)) * &delta_n));

        // V' = V - V A^T G A V, with G = V_D - V_D B M^-1 B^T V_D
        let Linearization { a, b, v_d, m_inv } = linearization;
        let v_at = v * a.transpose();
        let mut g = v_d.clone();
        let mut cov_ya = DMatrix::zeros(layout.n_y, layout.n_a());
        if layout.n_a() > 0 {
            let vd_b = v_d * b;
            g -= &vd_b * m_inv * vd_b.transpose();
            cov_ya = -(&v_at * &vd_b * m_inv);
        }
        let cov_yy = v - &v_at * g * v_at.transpose();
        ensure_finite(iterations, "the fitted covariance", cov_yy.iter().chain(cov_ya.iter()))?;

        let index = |column: &Column| match *column {
            Column::Measured(i) => (true, i),
            Column::Unmeasured(i) => (false, i),
        };
        let blocks = system
            .blocks
            .iter()
            .enumerate()
            .map(|(bi, block)| {
                let columns = &layout.columns[bi];
                let n = columns.len();
                let mut covariance = DMatrix::zeros(n, n);
                for (p, cp) in columns.iter().enumerate() {
                    for (q, cq) in columns.iter().enumerate() {
                        covariance[(p, q)] = match (index(cp), index(cq)) {
                            ((true, i), (true, j)) => cov_yy[(i, j)],
                            ((true, i), (false, j)) => cov_ya[(i, j)],
                            ((false, i), (true, j)) => cov_ya[(j, i)],
                            ((false, i), (false, j)) => m_inv[(i, j)],
                        };
                    }
                }
                FittedBlock {
                    name: block.name().to_string(),
                    parametrization: block.parametrization(),
                    mass: block.mass(),
                    values: state.values[bi].clone(),
                    covariance,
                }
            })
            .collect();
        let ndf = system.ndf();
        let chi2 = chi2_measured + chi2_nuisance;
        Ok(Self {
            chi2_measured,
            chi2_nuisance,
            ndf,
            p_value: chi2_probability(chi2, ndf),
            iterations,
            blocks,
            nuisance: state.alpha.clone(),
            residuals,
        })
    }

    /// The minimized $`S = \Delta y^\intercal V^{-1} \Delta y`$.
    pub fn chi2(&self) -> f64 {
        self.chi2_measured + self.chi2_nuisance
    }
    /// The part of [`FitResult::chi2`] from the measured block parameters.
    pub fn chi2_measured(&self) -> f64 {
        self.chi2_measured
    }
    /// The part of [`FitResult::chi2`] from the constraints' nuisance parameters.
    pub fn chi2_nuisance(&self) -> f64 {
        self.chi2_nuisance
    }
    pub fn ndf(&self) -> i64 {
        self.ndf
    }
    /// The $`\chi^2`$ upper-tail probability, or [`None`] unless `ndf > 0`.
    pub fn p_value(&self) -> Option<f64> {
        self.p_value
    }
    pub fn iterations(&self) -> usize {
        self.iterations
    }
    /// The fitted blocks, in the order they were added to the [`FitSystem`].
    pub fn blocks(&self) -> &[FittedBlock] {
        &self.blocks
    }
    pub fn block(&self, id: BlockId) -> Option<&FittedBlock> {
        self.blocks.get(id.index())
    }
    /// The fitted nuisance parameters of each constraint.
    pub fn nuisance(&self) -> &[DVector<f64>] {
        &self.nuisance
    }
    /// The residual of each constraint at the solution.
    pub fn residuals(&self) -> &[DVector<f64>] {
        &self.residuals
    }
}

impl Display for FitResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "chi2 / ndf = {:.4} / {} ({} iterations",
            self.chi2(),
            self.ndf,
            self.iterations
        )?;
        match self.p_value {
            Some(p) => writeln!(f, ", p = {:.4})", p)?,
            None => writeln!(f, ")")?,
        }
        for block in &self.blocks {
            write!(f, "  {} {}:", block.name, block.parametrization)?;
            for (i, value) in block.values.iter().enumerate() {
                write!(f, " {:.6} +/- {:.6}", value, block.covariance[(i, i)].max(0.0).sqrt())?;
                if i + 1 < block.values.len() {
                    write!(f, ",")?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use approx::assert_relative_eq;

    use super::*;
    use crate::{
        constraints::{
            eta::EtaConstraint,
            mass::{GaussianMassConstraint, MassConstraint},
            momentum::MomentumConstraint,
            pointing::PointingConstraint,
        },
        density::DensityTable,
        utils::enums::Component,
    };

    const KAON_MASS: f64 = 0.493677;
    const PION_MASS: f64 = 0.13957;
    const D0_MASS: f64 = 1.86484;

    fn track_cov(pt: f64) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_vec(vec![(0.05 * pt).powi(2), 1e-4, 1e-4]))
    }

    fn track(name: &str, mass: f64, pt: f64, eta: f64, phi: f64) -> ParameterBlock {
        ParameterBlock::new(name, Parametrization::PtEtaPhi, mass, &[pt, eta, phi], &track_cov(pt))
            .unwrap()
    }

    fn d0_system(target: f64) -> (FitSystem, BlockId, BlockId) {
        let mut system = FitSystem::default();
        let kaon = system.add_block(track("K-", KAON_MASS, 1.2, 0.3, 0.1));
        let pion = system.add_block(track("pi+", PION_MASS, 0.9, 0.1, 2.05));
        system
            .add_constraint(MassConstraint::new("m(D0)", &[kaon, pion], target))
            .unwrap();
        (system, kaon, pion)
    }

    fn initial_mass(system: &FitSystem) -> f64 {
        (system.blocks()[0].initial_p4() + system.blocks()[1].initial_p4()).m()
    }

    #[test]
    fn test_config() {
        let config = FitterConfig::default();
        assert_eq!(config.max_iterations, 50);
        assert_relative_eq!(config.max_delta_s, 5e-5);
        assert_relative_eq!(config.max_f, 1e-4);
        assert!(Fitter::new(config.with_max_iterations(0)).is_err());
        assert!(Fitter::new(config.with_max_delta_s(0.0)).is_err());
        assert!(Fitter::new(config.with_max_f(f64::NAN)).is_err());
        let fitter = Fitter::new(config.with_max_iterations(10)).unwrap();
        assert_eq!(fitter.config().max_iterations, 10);
        let partial: FitterConfig = serde_json::from_str(r#"{"max_iterations": 7}"#).unwrap();
        assert_eq!(partial.max_iterations, 7);
        assert_relative_eq!(partial.max_f, 1e-4);
    }

    #[test]
    fn test_two_track_mass_fit() {
        let (system, kaon, pion) = d0_system(D0_MASS);
        let start = initial_mass(&system);
        assert!((start - D0_MASS).abs() > 1e-3);
        let result = Fitter::default().fit(&system).unwrap();
        assert!(result.iterations() <= 10);
        let fitted = result.block(kaon).unwrap().p4() + result.block(pion).unwrap().p4();
        assert_relative_eq!(fitted.m(), D0_MASS, epsilon = 1e-4);
        assert!(result.chi2() > 0.0);
        assert_relative_eq!(result.chi2_nuisance(), 0.0);
        assert_eq!(result.ndf(), 1);
        let p = result.p_value().unwrap();
        assert!(p > 0.0 && p <= 1.0);
        assert!(result.residuals()[0][0].abs() < 1e-4);
        // the constraint removes one direction of freedom from the covariance
        let measured = system.blocks()[0].measured().covariance();
        let fitted_cov = result.block(kaon).unwrap().covariance();
        assert!(fitted_cov[(0, 0)] < measured[(0, 0)]);
        assert!(fitted_cov[(0, 0)] > 0.0);
        // the measured system is untouched
        assert_relative_eq!(system.blocks()[0].measured().values()[0], 1.2);
    }

    #[test]
    fn test_satisfied_constraint_is_a_fixed_point() {
        let (system, _, _) = d0_system(0.0);
        let exact = initial_mass(&system);
        let (system, _, _) = d0_system(exact);
        let result = Fitter::default().fit(&system).unwrap();
        assert_eq!(result.iterations(), 1);
        assert_relative_eq!(result.chi2(), 0.0, epsilon = 1e-20);
        for (fitted, block) in result.blocks().iter().zip(system.blocks()) {
            for (a, b) in fitted.values().iter().zip(block.measured().values().iter()) {
                assert_relative_eq!(*a, *b, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_fixed_point_with_nuisance() {
        let table = Arc::new(DensityTable::from_range((0.0, 2.0), &[1.0, 3.0, 5.0, 2.0]).unwrap());
        let mut system = FitSystem::default();
        let id = system.add_block(track("e", 0.000511, 30.0, table.mode(), 0.4));
        system
            .add_constraint(EtaConstraint::new("eta prior", id, table))
            .unwrap();
        assert_relative_eq!(system.init_values()[0][0], 0.0, epsilon = 1e-12);
        let result = Fitter::default().fit(&system).unwrap();
        assert_eq!(result.iterations(), 1);
        assert_relative_eq!(result.chi2_measured(), 0.0, epsilon = 1e-20);
        assert_relative_eq!(result.chi2(), result.chi2_nuisance());
        assert_relative_eq!(result.nuisance()[0][0], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_eta_prior_fit() {
        let table = Arc::new(DensityTable::from_range((0.0, 2.5), &[2.0, 6.0, 9.0, 5.0, 3.0]).unwrap());
        let mut system = FitSystem::default();
        let id = system.add_block(track("e", 0.000511, 30.0, 1.9, 0.4));
        system
            .add_constraint(EtaConstraint::new("eta prior", id, table))
            .unwrap();
        assert_eq!(system.ndf(), 0);
        let result = Fitter::default().fit(&system).unwrap();
        assert!(result.p_value().is_none());
        assert!(result.residuals()[0][0].abs() < 1e-4);
        // eta is far better measured than the prior, so the nuisance parameter absorbs the pull
        assert!(result.nuisance()[0][0] > 0.0);
        assert!(result.chi2_nuisance() > result.chi2_measured());
        assert_relative_eq!(result.blocks()[0].values()[1], 1.9, epsilon = 1e-2);
    }

    #[test]
    fn test_degrees_of_freedom() {
        let mut system = FitSystem::default();
        let k = system.add_block(track("K-", KAON_MASS, 1.2, 0.3, 0.1));
        let p = system.add_block(track("pi+", PION_MASS, 0.9, 0.1, 2.05));
        let s = system.add_block(track("pi+ soft", PION_MASS, 0.2, 0.2, 1.0));
        system
            .add_constraint(MassConstraint::new("m(D0)", &[k, p], D0_MASS))
            .unwrap();
        system
            .add_constraint(GaussianMassConstraint::new("m(D*)", &[k, p, s], 2.01026, 0.002))
            .unwrap();
        system
            .add_constraint(MomentumConstraint::new("pz", Component::Pz, &[k, p, s], 0.0))
            .unwrap();
        assert_eq!(system.n_equations(), 3);
        assert_eq!(system.n_nuisance(), 1);
        assert_eq!(system.ndf(), 2);
    }

    #[test]
    fn test_zero_row_covariance_is_singular() {
        let mut system = FitSystem::default();
        let cov = DMatrix::from_diagonal(&DVector::from_vec(vec![0.0, 1e-4, 1e-4]));
        let kaon = system.add_block(
            ParameterBlock::new("K-", Parametrization::PtEtaPhi, KAON_MASS, &[1.2, 0.3, 0.1], &cov)
                .unwrap(),
        );
        let pion = system.add_block(track("pi+", PION_MASS, 0.9, 0.1, 2.05));
        system
            .add_constraint(MassConstraint::new("m(D0)", &[kaon, pion], D0_MASS))
            .unwrap();
        match Fitter::default().fit(&system) {
            Err(KinFitError::SingularSystemError { iteration, .. }) => assert_eq!(iteration, 0),
            other => panic!("expected a singular system, got {:?}", other),
        }
    }

    #[test]
    fn test_non_convergence() {
        let (system, _, _) = d0_system(D0_MASS);
        let fitter = Fitter::new(
            FitterConfig::default()
                .with_max_iterations(1)
                .with_max_f(1e-14),
        )
        .unwrap();
        match fitter.fit(&system) {
            Err(KinFitError::NonConvergenceError { iterations, f, .. }) => {
                assert_eq!(iterations, 1);
                assert!(f.is_finite());
            }
            other => panic!("expected non-convergence, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_system() {
        let mut system = FitSystem::default();
        system.add_block(track("K-", KAON_MASS, 1.2, 0.3, 0.1));
        assert!(matches!(
            Fitter::default().fit(&system),
            Err(KinFitError::ConfigurationError { .. })
        ));
        assert!(system
            .add_constraint(MassConstraint::new("m", &[BlockId(3)], 1.0))
            .is_err());
    }

    #[test]
    fn test_unmeasured_parameter() {
        let cov = DMatrix::from_diagonal(&DVector::from_vec(vec![1e-4, 1e-4, 1e-4]));
        let mut system = FitSystem::default();
        let kaon = system.add_block(
            ParameterBlock::new("K-", Parametrization::PxPyPz, KAON_MASS, &[0.8, 0.2, 0.5], &cov)
                .unwrap(),
        );
        let pion = system.add_block(
            ParameterBlock::new("pi+", Parametrization::PxPyPz, PION_MASS, &[-0.7, 0.1, 0.5], &cov)
                .unwrap()
                .with_unmeasured(2)
                .unwrap(),
        );
        // the mass the pair would have with the pion pz at 0.6
        let target = (Vec3::new(0.8, 0.2, 0.5).with_mass(KAON_MASS)
            + Vec3::new(-0.7, 0.1, 0.6).with_mass(PION_MASS))
        .m();
        system
            .add_constraint(MassConstraint::new("m", &[kaon, pion], target))
            .unwrap();
        assert_eq!(system.ndf(), 0);
        let result = Fitter::default().fit(&system).unwrap();
        assert!(result.p_value().is_none());
        let fitted = result.block(kaon).unwrap().p4() + result.block(pion).unwrap().p4();
        assert_relative_eq!(fitted.m(), target, epsilon = 1e-4);
        // the unmeasured parameter absorbs the whole correction
        assert!(result.chi2() < 1e-8);
        assert_relative_eq!(result.block(pion).unwrap().values()[2], 0.6, epsilon = 1e-3);
        assert!(result.block(pion).unwrap().covariance()[(2, 2)] > 0.0);
    }

    #[test]
    fn test_unmeasured_with_extra_constraint() {
        let cov = DMatrix::from_diagonal(&DVector::from_vec(vec![1e-3, 1e-3, 1e-3]));
        let mut system = FitSystem::default();
        let a = system.add_block(
            ParameterBlock::new("a", Parametrization::PxPyPz, 0.1, &[1.0, 0.1, 0.5], &cov).unwrap(),
        );
        let b = system.add_block(
            ParameterBlock::new("b", Parametrization::PxPyPz, 0.1, &[-1.02, -0.08, 0.0], &cov)
                .unwrap()
                .with_unmeasured(2)
                .unwrap(),
        );
        for (name, component, value) in [
            ("px", Component::Px, 0.0),
            ("py", Component::Py, 0.0),
            ("pz", Component::Pz, 0.0),
        ] {
            system
                .add_constraint(MomentumConstraint::new(name, component, &[a, b], value))
                .unwrap();
        }
        assert_eq!(system.ndf(), 2);
        let result = Fitter::default().fit(&system).unwrap();
        let total = result.block(a).unwrap().p4() + result.block(b).unwrap().p4();
        assert_relative_eq!(total.px(), 0.0, epsilon = 1e-6);
        assert_relative_eq!(total.py(), 0.0, epsilon = 1e-6);
        assert_relative_eq!(total.pz(), 0.0, epsilon = 1e-6);
        // pz of b is fixed by momentum balance alone
        assert_relative_eq!(
            result.block(b).unwrap().values()[2],
            -result.block(a).unwrap().values()[2],
            epsilon = 1e-6
        );
        assert!(result.p_value().is_some());
        // symmetric fitted covariance
        let c = result.block(b).unwrap().covariance();
        assert_relative_eq!(c[(0, 2)], c[(2, 0)], epsilon = 1e-12);
    }

    #[test]
    fn test_pointing_fit() {
        let cov = DMatrix::from_diagonal(&DVector::from_vec(vec![1e-4, 1e-4, 1e-4]));
        let vertex_cov = DMatrix::identity(3, 3) * 1e-3;
        let mut system = FitSystem::default();
        let p1 = system.add_block(
            ParameterBlock::new("pi+", Parametrization::PxPyPz, PION_MASS, &[0.6, 0.3, 0.4], &cov)
                .unwrap(),
        );
        let p2 = system.add_block(
            ParameterBlock::new("pi-", Parametrization::PxPyPz, PION_MASS, &[0.4, 0.1, 0.2], &cov)
                .unwrap(),
        );
        let pv = system.add_block(ParameterBlock::vertex("pv", &Vec3::new(0.0, 0.0, 0.0), &vertex_cov).unwrap());
        // roughly along (1.0, 0.4, 0.6), slightly off
        let sv = system.add_block(ParameterBlock::vertex("sv", &Vec3::new(2.0, 0.85, 1.15), &vertex_cov).unwrap());
        system
            .add_constraint(PointingConstraint::new("K0S pointing", &[p1, p2], pv, sv))
            .unwrap();
        assert_eq!(system.ndf(), 2);
        let result = Fitter::default().fit(&system).unwrap();
        let momentum = (result.block(p1).unwrap().p4() + result.block(p2).unwrap().p4()).vec3();
        let flight = result.block(sv).unwrap().position() - result.block(pv).unwrap().position();
        assert_relative_eq!(momentum.phi(), flight.phi(), epsilon = 1e-4);
        assert_relative_eq!(momentum.theta(), flight.theta(), epsilon = 1e-4);
        assert!(result.chi2() > 0.0);
    }

    #[test]
    fn test_system_serde() {
        let (mut system, kaon, pion) = d0_system(D0_MASS);
        let table = Arc::new(DensityTable::from_range((0.0, 2.5), &[2.0, 6.0, 9.0, 5.0, 3.0]).unwrap());
        system
            .add_constraint(EtaConstraint::new("eta(K)", kaon, table))
            .unwrap();
        system
            .add_constraint(GaussianMassConstraint::new("m'", &[kaon, pion], D0_MASS, 0.01))
            .unwrap();
        let json = serde_json::to_string(&system).unwrap();
        let restored: FitSystem = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.constraints().len(), 3);
        assert_eq!(restored.ndf(), system.ndf());
        let fitter = Fitter::default();
        let a = fitter.fit(&system).unwrap();
        let b = fitter.fit(&restored).unwrap();
        assert_relative_eq!(a.chi2(), b.chi2(), epsilon = 1e-10);
        assert_eq!(a.iterations(), b.iterations());
    }

    #[test]
    fn test_deserialized_system_is_revalidated() {
        let (system, _, _) = d0_system(D0_MASS);
        let mut json = serde_json::to_value(&system).unwrap();
        // two values for a three-parameter block
        json["blocks"][0]["measured"]["values"] = serde_json::json!([[1.0, 0.2], 2, null]);
        let truncated: FitSystem = serde_json::from_value(json).unwrap();
        assert!(matches!(
            truncated.validate(),
            Err(KinFitError::ConfigurationError { .. })
        ));
        assert!(matches!(
            Fitter::default().fit(&truncated),
            Err(KinFitError::ConfigurationError { .. })
        ));
        let results = Fitter::default().fit_many(&[system.clone(), truncated, system.clone()]);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());

        let mut json = serde_json::to_value(&system).unwrap();
        json["blocks"][0]["unmeasured"] = serde_json::json!([false]);
        let flags: FitSystem = serde_json::from_value(json).unwrap();
        assert!(flags.validate().is_err());
        assert!(format!("{}", flags.blocks()[0]).contains("K-"));
    }

    #[test]
    fn test_deserialized_nuisance_is_revalidated() {
        let (mut system, kaon, _) = d0_system(D0_MASS);
        let table = Arc::new(DensityTable::from_range((0.0, 2.5), &[2.0, 6.0, 9.0, 5.0, 3.0]).unwrap());
        system
            .add_constraint(EtaConstraint::new("eta(K)", kaon, table))
            .unwrap();
        let mut json = serde_json::to_value(&system).unwrap();
        assert_eq!(json["constraints"][1]["type"], "EtaConstraint");
        json["constraints"][1]["nuisance"]["values"] = serde_json::json!([[], 0, null]);
        json["constraints"][1]["nuisance"]["covariance"] = serde_json::json!([[], 0, 0]);
        let restored: FitSystem = serde_json::from_value(json).unwrap();
        assert_eq!(restored.n_nuisance(), 0);
        assert!(matches!(
            Fitter::default().fit(&restored),
            Err(KinFitError::ConfigurationError { .. })
        ));
    }

    #[test]
    fn test_fit_many() {
        let good = d0_system(D0_MASS).0;
        let mut bad = FitSystem::default();
        bad.add_block(track("K-", KAON_MASS, 1.2, 0.3, 0.1));
        let systems = vec![good.clone(), bad, good];
        let results = Fitter::default().fit_many(&systems);
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert_relative_eq!(
            results[0].as_ref().unwrap().chi2(),
            results[2].as_ref().unwrap().chi2()
        );
    }

    #[test]
    fn test_display() {
        let (system, _, _) = d0_system(D0_MASS);
        let result = Fitter::default().fit(&system).unwrap();
        let text = format!("{}", result);
        assert!(text.starts_with("chi2 / ndf"));
        assert!(text.contains("K-"));
    }
}
