use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::{
    constraints::{check_blocks, check_scalar_nuisance, BlockKind, Constraint, Nuisance},
    density::DensityTable,
    particles::{BlockId, Kinematics, ParameterBlock},
    utils::functions::{normal_cdf, normal_pdf},
    KinFitResult,
};

/// A soft prior which pulls the pseudorapidity of a block toward an empirical distribution.
///
/// The [`DensityTable`] describes the expected distribution of $`|\eta|`$. Writing $`F`$ for
/// its cumulative distribution, the constraint maps $`|\eta|`$ onto a standard normal nuisance
/// parameter $`y`$:
///
/// ```math
/// f = F(|\eta|) - \Phi(y + \Delta)
/// ```
///
/// where $`\Delta`$ is chosen so that the residual vanishes when $`|\eta|`$ sits at the mode of
/// the table and $`y = 0`$. The nuisance parameter starts at zero with unit variance, so
/// moving $`\eta`$ away from the mode costs $`\chi^2`$ in proportion to how improbable the new
/// value is.
///
/// The table is expected to be unimodal. This is not checked.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EtaConstraint {
    name: String,
    block: BlockId,
    table: Arc<DensityTable>,
    nuisance: Nuisance,
}

impl EtaConstraint {
    pub fn new(name: &str, block: BlockId, table: Arc<DensityTable>) -> Self {
        Self {
            name: name.to_string(),
            block,
            table,
            nuisance: Nuisance::scalar(0.0, 1.0),
        }
    }
    pub fn table(&self) -> &DensityTable {
        &self.table
    }
    /// $`\partial f / \partial \eta`$ at the given pseudorapidity. The sign follows
    /// $`\eta`$, with $`\eta = 0`$ treated as positive.
    pub fn eta_derivative(&self, eta: f64) -> f64 {
        let sign = if eta < 0.0 { -1.0 } else { 1.0 };
        sign * self.table.density(eta.abs())
    }
}

#[typetag::serde]
impl Constraint for EtaConstraint {
    fn name(&self) -> &str {
        &self.name
    }
    fn blocks(&self) -> Vec<BlockId> {
        vec![self.block]
    }
    fn nuisance(&self) -> Option<&Nuisance> {
        Some(&self.nuisance)
    }
    fn check(&self, blocks: &[ParameterBlock]) -> KinFitResult<()> {
        check_blocks(&self.name, &[self.block], blocks, BlockKind::Momentum)?;
        check_scalar_nuisance(&self.name, &self.nuisance)
    }
    fn current_value(&self, kinematics: &Kinematics, alpha: &DVector<f64>) -> DVector<f64> {
        let eta = kinematics.p4(self.block).eta();
        DVector::from_element(
            1,
            self.table.cdf(eta.abs()) - normal_cdf(alpha[0] + self.table.delta()),
        )
    }
    fn derivative(&self, id: BlockId, kinematics: &Kinematics, _alpha: &DVector<f64>) -> DMatrix<f64> {
        if id != self.block {
            return DMatrix::zeros(1, kinematics.n_par(id));
        }
        let p3 = kinematics.p4(id).vec3();
        let df_deta = self.eta_derivative(p3.eta());
        let gradient = p3.eta_gradient() * df_deta;
        let df_dp4 = DMatrix::from_row_slice(1, 4, &[gradient.x, gradient.y, gradient.z, 0.0]);
        kinematics.chain(id, &df_dp4)
    }
    fn derivative_alpha(&self, _kinematics: &Kinematics, alpha: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, -normal_pdf(alpha[0] + self.table.delta()))
    }
}
