use std::{fmt::Display, str::FromStr};

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::{
    utils::vectors::{Vec3, Vec4},
    KinFitError, KinFitResult,
};

/// Relative tolerance used when checking that a covariance matrix is symmetric.
const SYMMETRY_TOLERANCE: f64 = 1e-9;
/// Relative tolerance (with respect to the largest eigenvalue) below which a negative
/// eigenvalue is considered round-off rather than a genuinely indefinite covariance.
const EIGENVALUE_TOLERANCE: f64 = 1e-12;

/// A tag which refers to a [`ParameterBlock`] registered with a
/// [`FitSystem`](crate::fitter::FitSystem). It should be obtained from
/// [`FitSystem::add_block`](crate::fitter::FitSystem::add_block).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub(crate) usize);

impl BlockId {
    /// The position of the block in its [`FitSystem`](crate::fitter::FitSystem).
    pub fn index(&self) -> usize {
        self.0
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The basis in which a [`ParameterBlock`]'s fit parameters are expressed.
///
/// The momentum parametrizations describe a particle of fixed mass, so the energy is always
/// derived as $`E = \sqrt{|\vec{p}|^2 + m^2}`$.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parametrization {
    /// $`(p_T, \eta, \phi)`$
    PtEtaPhi,
    /// $`(p_T, \theta, \phi)`$
    PtThetaPhi,
    /// $`(p_x, p_y, p_z)`$
    PxPyPz,
    /// A vertex position $`(x, y, z)`$ with no associated four-momentum.
    Position,
}

impl Display for Parametrization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Parametrization::PtEtaPhi => write!(f, "(pT, eta, phi)"),
            Parametrization::PtThetaPhi => write!(f, "(pT, theta, phi)"),
            Parametrization::PxPyPz => write!(f, "(px, py, pz)"),
            Parametrization::Position => write!(f, "(x, y, z)"),
        }
    }
}

impl FromStr for Parametrization {
    type Err = KinFitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace([' ', '_', '-'], "").as_str() {
            "ptetaphi" => Ok(Self::PtEtaPhi),
            "ptthetaphi" => Ok(Self::PtThetaPhi),
            "pxpypz" | "cartesian" => Ok(Self::PxPyPz),
            "position" | "vertex" | "xyz" => Ok(Self::Position),
            _ => Err(KinFitError::config(format!(
                "\"{}\" does not correspond to a valid parametrization",
                s
            ))),
        }
    }
}

impl Parametrization {
    /// The number of fit parameters in this basis.
    pub fn n_par(&self) -> usize {
        3
    }
    /// Whether the parameters describe a momentum (as opposed to a position).
    pub fn is_momentum(&self) -> bool {
        !matches!(self, Parametrization::Position)
    }
    /// The four-momentum described by `params` for a particle of the given `mass`. A
    /// [`Parametrization::Position`] always yields a zero four-vector.
    pub fn p4(&self, params: &DVector<f64>, mass: f64) -> Vec4 {
        match self {
            Parametrization::PtEtaPhi => {
                Vec3::from_pt_eta_phi(params[0], params[1], params[2]).with_mass(mass)
            }
            Parametrization::PtThetaPhi => {
                Vec3::from_pt_theta_phi(params[0], params[1], params[2]).with_mass(mass)
            }
            Parametrization::PxPyPz => Vec3::new(params[0], params[1], params[2]).with_mass(mass),
            Parametrization::Position => Vec4::default(),
        }
    }
    /// The position described by `params`. Momentum parametrizations yield the origin.
    pub fn position(&self, params: &DVector<f64>) -> Vec3 {
        match self {
            Parametrization::Position => Vec3::new(params[0], params[1], params[2]),
            _ => Vec3::default(),
        }
    }
    /// The inverse of [`Parametrization::p4`] (or [`Parametrization::position`]): the
    /// parameters which describe the given three-vector in this basis.
    pub fn parameters_of(&self, v: &Vec3) -> DVector<f64> {
        match self {
            Parametrization::PtEtaPhi => DVector::from_vec(vec![v.pt(), v.eta(), v.phi()]),
            Parametrization::PtThetaPhi => DVector::from_vec(vec![v.pt(), v.theta(), v.phi()]),
            Parametrization::PxPyPz | Parametrization::Position => {
                DVector::from_vec(vec![v.x, v.y, v.z])
            }
        }
    }
    /// The Jacobian $`\partial(p_x, p_y, p_z, E)/\partial(\text{params})`$ as a
    /// $`4 \times n`$ matrix. Columns hold the derivative with respect to each parameter.
    pub fn jacobian(&self, params: &DVector<f64>, mass: f64) -> DMatrix<f64> {
        let mut jac = DMatrix::zeros(4, self.n_par());
        match self {
            Parametrization::PtEtaPhi => {
                let (pt, eta, phi) = (params[0], params[1], params[2]);
                let (sin_phi, cos_phi) = phi.sin_cos();
                let (sinh_eta, cosh_eta) = (eta.sinh(), eta.cosh());
                let e = self.p4(params, mass).e();
                jac[(0, 0)] = cos_phi;
                jac[(1, 0)] = sin_phi;
                jac[(2, 0)] = sinh_eta;
                jac[(3, 0)] = pt * cosh_eta * cosh_eta / e;
                jac[(2, 1)] = pt * cosh_eta;
                jac[(3, 1)] = pt * pt * cosh_eta * sinh_eta / e;
                jac[(0, 2)] = -pt * sin_phi;
                jac[(1, 2)] = pt * cos_phi;
            }
            Parametrization::PtThetaPhi => {
                let (pt, theta, phi) = (params[0], params[1], params[2]);
                let (sin_phi, cos_phi) = phi.sin_cos();
                let (sin_theta, cos_theta) = theta.sin_cos();
                let sin2_theta = sin_theta * sin_theta;
                let cot_theta = cos_theta / sin_theta;
                let one_over_e_sin2 = 1.0 / (self.p4(params, mass).e() * sin2_theta);
                jac[(0, 0)] = cos_phi;
                jac[(1, 0)] = sin_phi;
                jac[(2, 0)] = cot_theta;
                jac[(3, 0)] = pt * one_over_e_sin2;
                jac[(2, 1)] = -pt / sin2_theta;
                jac[(3, 1)] = -pt * pt * cot_theta * one_over_e_sin2;
                jac[(0, 2)] = -pt * sin_phi;
                jac[(1, 2)] = pt * cos_phi;
            }
            Parametrization::PxPyPz => {
                let e = self.p4(params, mass).e();
                for i in 0..3 {
                    jac[(i, i)] = 1.0;
                    jac[(3, i)] = params[i] / e;
                }
            }
            Parametrization::Position => {}
        }
        jac
    }
}

/// The immutable pre-fit measurement of a [`ParameterBlock`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measured {
    values: DVector<f64>,
    covariance: DMatrix<f64>,
}

impl Measured {
    /// The measured parameter values.
    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }
    /// The measurement covariance.
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }
}

/// Check that `covariance` is an `n`×`n`, finite, symmetric, positive semi-definite matrix.
pub(crate) fn validate_covariance(name: &str, covariance: &DMatrix<f64>, n: usize) -> KinFitResult<()> {
    if covariance.nrows() != n || covariance.ncols() != n {
        return Err(KinFitError::config(format!(
            "covariance of \"{}\" is {}x{} but the block has {} parameters",
            name,
            covariance.nrows(),
            covariance.ncols(),
            n
        )));
    }
    if covariance.iter().any(|v| !v.is_finite()) {
        return Err(KinFitError::config(format!(
            "covariance of \"{}\" contains non-finite entries",
            name
        )));
    }
    for i in 0..n {
        for j in (i + 1)..n {
            let (a, b) = (covariance[(i, j)], covariance[(j, i)]);
            if (a - b).abs() > SYMMETRY_TOLERANCE * a.abs().max(b.abs()).max(f64::MIN_POSITIVE) {
                return Err(KinFitError::config(format!(
                    "covariance of \"{}\" is not symmetric at ({}, {})",
                    name, i, j
                )));
            }
        }
    }
    let eigenvalues = covariance.clone().symmetric_eigen().eigenvalues;
    let largest = eigenvalues.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    if eigenvalues
        .iter()
        .any(|&v| v < -EIGENVALUE_TOLERANCE * largest.max(1.0))
    {
        return Err(KinFitError::config(format!(
            "covariance of \"{}\" is not positive semi-definite",
            name
        )));
    }
    Ok(())
}

fn validate_values(name: &str, parametrization: Parametrization, values: &[f64]) -> KinFitResult<()> {
    let n = parametrization.n_par();
    if values.len() != n {
        return Err(KinFitError::config(format!(
            "\"{}\" has {} values but {} parametrization needs {}",
            name,
            values.len(),
            parametrization,
            n
        )));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(KinFitError::config(format!(
            "\"{}\" has non-finite parameter values",
            name
        )));
    }
    Ok(())
}

/// A measured particle (or vertex) whose parameters are adjusted by the fit.
///
/// The block itself is never modified by a fit. The [`Fitter`](crate::fitter::Fitter) keeps
/// the current parameter values in its own working state and reports them in the
/// [`FitResult`](crate::fitter::FitResult).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterBlock {
    name: String,
    parametrization: Parametrization,
    mass: f64,
    measured: Measured,
    unmeasured: Vec<bool>,
}

impl ParameterBlock {
    /// Construct a [`ParameterBlock`] from parameter values given in the `parametrization`
    /// basis and their covariance. The `mass` is held fixed during the fit (it is ignored for
    /// [`Parametrization::Position`]).
    ///
    /// # Errors
    ///
    /// Returns a [`KinFitError::ConfigurationError`] if the number of values does not match
    /// the parametrization or the covariance is not a symmetric positive semi-definite matrix
    /// of matching dimension.
    pub fn new(
        name: &str,
        parametrization: Parametrization,
        mass: f64,
        values: &[f64],
        covariance: &DMatrix<f64>,
    ) -> KinFitResult<Self> {
        validate_values(name, parametrization, values)?;
        validate_covariance(name, covariance, parametrization.n_par())?;
        Ok(Self {
            name: name.to_string(),
            parametrization,
            mass,
            measured: Measured {
                values: DVector::from_column_slice(values),
                covariance: covariance.clone(),
            },
            unmeasured: vec![false; parametrization.n_par()],
        })
    }

    /// Construct a particle [`ParameterBlock`] from a measured three-momentum and mass
    /// hypothesis, converting the momentum into the `parametrization` basis.
    pub fn from_p3(
        name: &str,
        parametrization: Parametrization,
        p3: &Vec3,
        mass: f64,
        covariance: &DMatrix<f64>,
    ) -> KinFitResult<Self> {
        if !parametrization.is_momentum() {
            return Err(KinFitError::config(format!(
                "\"{}\" cannot be built from a momentum in the {} parametrization",
                name, parametrization
            )));
        }
        let values = parametrization.parameters_of(p3);
        Self::new(name, parametrization, mass, values.as_slice(), covariance)
    }

    /// Construct a vertex [`ParameterBlock`] from a measured position.
    pub fn vertex(name: &str, position: &Vec3, covariance: &DMatrix<f64>) -> KinFitResult<Self> {
        Self::new(
            name,
            Parametrization::Position,
            0.0,
            &[position.x, position.y, position.z],
            covariance,
        )
    }

    /// Mark the parameter at `index` as unmeasured. Its measured value is then only used as a
    /// starting point and its covariance row and column are ignored.
    pub fn with_unmeasured(mut self, index: usize) -> KinFitResult<Self> {
        if index >= self.n_par() {
            return Err(KinFitError::config(format!(
                "\"{}\" has no parameter with index {}",
                self.name, index
            )));
        }
        self.unmeasured[index] = true;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn parametrization(&self) -> Parametrization {
        self.parametrization
    }
    pub fn mass(&self) -> f64 {
        self.mass
    }
    pub fn measured(&self) -> &Measured {
        &self.measured
    }
    pub fn n_par(&self) -> usize {
        self.parametrization.n_par()
    }
    pub fn is_unmeasured(&self, index: usize) -> bool {
        self.unmeasured.get(index).copied().unwrap_or(false)
    }
    pub fn n_unmeasured(&self) -> usize {
        self.unmeasured.iter().filter(|&&u| u).count()
    }
    /// The four-momentum for the given parameter values.
    pub fn p4(&self, params: &DVector<f64>) -> Vec4 {
        self.parametrization.p4(params, self.mass)
    }
    /// The four-momentum at the measured parameter values.
    pub fn initial_p4(&self) -> Vec4 {
        self.p4(&self.measured.values)
    }
    /// Run the construction checks again (used by the solver before it starts).
    pub(crate) fn validate(&self) -> KinFitResult<()> {
        validate_values(
            &self.name,
            self.parametrization,
            self.measured.values.as_slice(),
        )?;
        validate_covariance(&self.name, &self.measured.covariance, self.n_par())?;
        if self.unmeasured.len() != self.n_par() {
            return Err(KinFitError::config(format!(
                "\"{}\" has {} unmeasured flags for {} parameters",
                self.name,
                self.unmeasured.len(),
                self.n_par()
            )));
        }
        Ok(())
    }
}

impl Display for ParameterBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} {}:", self.name, self.parametrization)?;
        for (i, value) in self.measured.values.iter().enumerate() {
            let sigma = self
                .measured
                .covariance
                .get((i, i))
                .map_or(f64::NAN, |v| v.sqrt());
            if self.is_unmeasured(i) {
                writeln!(f, "  [{}] {:.6} (unmeasured)", i, value)?;
            } else {
                writeln!(f, "  [{}] {:.6} +/- {:.6}", i, value, sigma)?;
            }
        }
        if self.parametrization.is_momentum() {
            writeln!(f, "  p4: {}", self.initial_p4())?;
        }
        Ok(())
    }
}

/// A read-only view of every [`ParameterBlock`] in a system paired with a set of parameter
/// values (either the measured values or the solver's current values). This is what a
/// [`Constraint`](crate::constraints::Constraint) is evaluated against.
#[derive(Clone, Debug)]
pub struct Kinematics<'a> {
    blocks: &'a [ParameterBlock],
    values: Vec<&'a DVector<f64>>,
}

impl<'a> Kinematics<'a> {
    /// Pair the measured values of each block with the blocks themselves.
    pub fn initial(blocks: &'a [ParameterBlock]) -> Self {
        Self {
            blocks,
            values: blocks.iter().map(|b| &b.measured.values).collect(),
        }
    }
    /// Pair arbitrary values with the blocks (one vector per block, in order).
    pub fn new(blocks: &'a [ParameterBlock], values: &'a [DVector<f64>]) -> Self {
        debug_assert_eq!(blocks.len(), values.len());
        Self {
            blocks,
            values: values.iter().collect(),
        }
    }
    pub fn block(&self, id: BlockId) -> Option<&'a ParameterBlock> {
        self.blocks.get(id.0)
    }
    /// Number of parameters in the block, or zero if no such block exists.
    pub fn n_par(&self, id: BlockId) -> usize {
        self.block(id).map_or(0, |b| b.n_par())
    }
    pub fn p4(&self, id: BlockId) -> Vec4 {
        self.blocks[id.0].p4(self.values[id.0])
    }
    /// The summed four-momentum of several blocks.
    pub fn sum_p4(&self, ids: &[BlockId]) -> Vec4 {
        ids.iter()
            .fold(Vec4::default(), |acc, id| acc + self.p4(*id))
    }
    pub fn position(&self, id: BlockId) -> Vec3 {
        self.blocks[id.0]
            .parametrization
            .position(self.values[id.0])
    }
    /// The $`4 \times n`$ Jacobian of the block's four-momentum with respect to its parameters.
    pub fn p4_jacobian(&self, id: BlockId) -> DMatrix<f64> {
        let block = &self.blocks[id.0];
        block
            .parametrization
            .jacobian(self.values[id.0], block.mass)
    }
    /// Chain a derivative with respect to the four-momentum, `df_dp4` (one row per equation,
    /// columns $`(p_x, p_y, p_z, E)`$), into a derivative with respect to the block's
    /// parameters.
    pub fn chain(&self, id: BlockId, df_dp4: &DMatrix<f64>) -> DMatrix<f64> {
        df_dp4 * self.p4_jacobian(id)
    }
}
