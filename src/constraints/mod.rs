use std::fmt::Debug;

use dyn_clone::DynClone;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::{
    particles::{validate_covariance, BlockId, Kinematics, ParameterBlock},
    KinFitError, KinFitResult,
};

/// Breit-Wigner shaped mass priors.
pub mod breit_wigner;
/// The pseudorapidity shape prior.
pub mod eta;
/// Fixed, equal, and Gaussian-smeared invariant mass constraints.
pub mod mass;
/// Four-momentum component conservation.
pub mod momentum;
/// Alignment of a summed momentum with a flight direction between two vertices.
pub mod pointing;

/// The internal nuisance parameters owned by a [`Constraint`]. These are treated like extra
/// measured parameters by the [`Fitter`](crate::fitter::Fitter): they start at `values` and
/// contribute to the $`\chi^2`$ through `covariance`. The shape is fixed when the constraint
/// is built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Nuisance {
    values: DVector<f64>,
    covariance: DMatrix<f64>,
}

impl Nuisance {
    /// A set of nuisance parameters with the given starting values and covariance.
    pub fn new(values: DVector<f64>, covariance: DMatrix<f64>) -> Self {
        Self { values, covariance }
    }
    /// A single nuisance parameter.
    pub fn scalar(value: f64, variance: f64) -> Self {
        Self {
            values: DVector::from_element(1, value),
            covariance: DMatrix::from_element(1, 1, variance),
        }
    }
    pub fn len(&self) -> usize {
        self.values.len()
    }
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }
    /// Check the starting values are finite and the covariance is a symmetric positive
    /// semi-definite matrix of matching dimension.
    pub(crate) fn validate(&self, name: &str) -> KinFitResult<()> {
        if self.values.iter().any(|v| !v.is_finite()) {
            return Err(KinFitError::config(format!(
                "constraint \"{}\" has non-finite nuisance values",
                name
            )));
        }
        validate_covariance(name, &self.covariance, self.len())
    }
}

/// Shared validation for constraints owning exactly one nuisance parameter.
pub(crate) fn check_scalar_nuisance(name: &str, nuisance: &Nuisance) -> KinFitResult<()> {
    if nuisance.len() != 1 {
        return Err(KinFitError::config(format!(
            "constraint \"{}\" needs one nuisance parameter (got {})",
            name,
            nuisance.len()
        )));
    }
    nuisance.validate(name)
}

/// An equality constraint $`f(y, \alpha) = 0`$ on the parameters of one or more
/// [`ParameterBlock`]s and (optionally) on nuisance parameters the constraint owns.
///
/// Implementors provide the residual and its analytic derivatives. The
/// [`Fitter`](crate::fitter::Fitter) linearizes every constraint around the current point at
/// each iteration, so the derivatives must be consistent with
/// [`current_value`](Constraint::current_value). Constraints are never mutated by a fit and
/// hold no fit state beyond their fixed configuration.
///
/// Derivatives with respect to a four-momentum can be turned into derivatives with respect to
/// a block's own parameters with [`Kinematics::chain`].
#[typetag::serde(tag = "type")]
pub trait Constraint: DynClone + Send + Sync + Debug {
    /// A human-readable name used in logs and results.
    fn name(&self) -> &str;
    /// Every [`BlockId`] the residual depends on.
    fn blocks(&self) -> Vec<BlockId>;
    /// The number of scalar equations this constraint contributes.
    fn n_equations(&self) -> usize {
        1
    }
    /// The nuisance parameters owned by this constraint, if any.
    fn nuisance(&self) -> Option<&Nuisance> {
        None
    }
    /// The number of nuisance parameters.
    fn n_nuisance(&self) -> usize {
        self.nuisance().map_or(0, |n| n.len())
    }
    /// The starting values of the nuisance parameters (an empty vector if there are none).
    fn initial_alpha(&self) -> DVector<f64> {
        self.nuisance()
            .map_or_else(|| DVector::zeros(0), |n| n.values().clone())
    }
    /// Validate the constraint against the blocks of the system it is being added to. The
    /// default implementation requires every bound block to exist and carry a four-momentum.
    fn check(&self, blocks: &[ParameterBlock]) -> KinFitResult<()> {
        check_blocks(self.name(), &self.blocks(), blocks, BlockKind::Momentum)
    }
    /// The residual at the current block values and nuisance values `alpha`.
    fn current_value(&self, kinematics: &Kinematics, alpha: &DVector<f64>) -> DVector<f64>;
    /// The residual at the measured block values and the initial nuisance values.
    fn init_value(&self, blocks: &[ParameterBlock]) -> DVector<f64> {
        self.current_value(&Kinematics::initial(blocks), &self.initial_alpha())
    }
    /// The derivative of the residual with respect to the parameters of block `id` as an
    /// `n_equations × n_par` matrix. Blocks the constraint does not depend on get a zero
    /// matrix.
    fn derivative(&self, id: BlockId, kinematics: &Kinematics, alpha: &DVector<f64>) -> DMatrix<f64>;
    /// The derivative of the residual with respect to the nuisance parameters as an
    /// `n_equations × n_nuisance` matrix.
    #[allow(unused_variables)]
    fn derivative_alpha(&self, kinematics: &Kinematics, alpha: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::zeros(self.n_equations(), self.n_nuisance())
    }
}

dyn_clone::clone_trait_object!(Constraint);

/// What kind of [`ParameterBlock`] a constraint expects.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum BlockKind {
    Momentum,
    Position,
}

/// Shared validation: `ids` must be non-empty, refer to existing blocks, and every block must
/// be of the given kind.
pub(crate) fn check_blocks(
    name: &str,
    ids: &[BlockId],
    blocks: &[ParameterBlock],
    kind: BlockKind,
) -> KinFitResult<()> {
    if ids.is_empty() {
        return Err(KinFitError::config(format!(
            "constraint \"{}\" is not bound to any blocks",
            name
        )));
    }
    for id in ids {
        let block = blocks.get(id.index()).ok_or_else(|| {
            KinFitError::config(format!(
                "constraint \"{}\" refers to unknown block {}",
                name, id
            ))
        })?;
        let is_momentum = block.parametrization().is_momentum();
        if is_momentum != (kind == BlockKind::Momentum) {
            return Err(KinFitError::config(format!(
                "constraint \"{}\" expects a {} block but \"{}\" uses the {} parametrization",
                name,
                if kind == BlockKind::Momentum {
                    "momentum"
                } else {
                    "position"
                },
                block.name(),
                block.parametrization()
            )));
        }
    }
    Ok(())
}

/// Chain `df_dp4` through every block of `list` equal to `id`, weighted by `sign`, and add the
/// result to `derivative`. Blocks may appear in several lists (or several times).
pub(crate) fn accumulate_chain(
    derivative: &mut DMatrix<f64>,
    id: BlockId,
    list: &[BlockId],
    sign: f64,
    df_dp4: &DMatrix<f64>,
    kinematics: &Kinematics,
) {
    let count = list.iter().filter(|&&other| other == id).count();
    if count > 0 {
        *derivative += kinematics.chain(id, df_dp4) * (sign * count as f64);
    }
}
