use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::{
    constraints::{
        accumulate_chain, check_blocks, check_scalar_nuisance, BlockKind, Constraint, Nuisance,
    },
    particles::{BlockId, Kinematics, ParameterBlock},
    utils::vectors::Vec4,
    KinFitError, KinFitResult,
};

/// The gradient of the invariant mass with respect to $`(p_x, p_y, p_z, E)`$ as a
/// $`1 \times 4`$ row.
pub(crate) fn mass_gradient(p4: &Vec4) -> DMatrix<f64> {
    let m = p4.m();
    DMatrix::from_row_slice(1, 4, &[-p4.px() / m, -p4.py() / m, -p4.pz() / m, p4.e() / m])
}

/// Fixes the invariant mass of a set of blocks, either to a constant,
///
/// ```math
/// f = M\left(\sum_{i \in L_1} P_i\right) - M_0
/// ```
///
/// or to the invariant mass of a second set of blocks,
///
/// ```math
/// f = M\left(\sum_{i \in L_1} P_i\right) - M\left(\sum_{j \in L_2} P_j\right).
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MassConstraint {
    name: String,
    list1: Vec<BlockId>,
    list2: Vec<BlockId>,
    mass: f64,
}

impl MassConstraint {
    /// Constrain the invariant mass of `blocks` to `mass`.
    pub fn new(name: &str, blocks: &[BlockId], mass: f64) -> Self {
        Self {
            name: name.to_string(),
            list1: blocks.to_vec(),
            list2: Vec::new(),
            mass,
        }
    }
    /// Constrain the invariant masses of two sets of blocks to be equal.
    pub fn equal(name: &str, list1: &[BlockId], list2: &[BlockId]) -> Self {
        Self {
            name: name.to_string(),
            list1: list1.to_vec(),
            list2: list2.to_vec(),
            mass: 0.0,
        }
    }
    fn is_equal_mass(&self) -> bool {
        !self.list2.is_empty()
    }
}

#[typetag::serde]
impl Constraint for MassConstraint {
    fn name(&self) -> &str {
        &self.name
    }
    fn blocks(&self) -> Vec<BlockId> {
        self.list1.iter().chain(&self.list2).copied().collect()
    }
    fn check(&self, blocks: &[ParameterBlock]) -> KinFitResult<()> {
        check_blocks(&self.name, &self.list1, blocks, BlockKind::Momentum)?;
        if self.is_equal_mass() {
            check_blocks(&self.name, &self.list2, blocks, BlockKind::Momentum)
        } else if !self.mass.is_finite() || self.mass < 0.0 {
            Err(KinFitError::config(format!(
                "constraint \"{}\" has invalid target mass {}",
                self.name, self.mass
            )))
        } else {
            Ok(())
        }
    }
    fn current_value(&self, kinematics: &Kinematics, _alpha: &DVector<f64>) -> DVector<f64> {
        let m1 = kinematics.sum_p4(&self.list1).m();
        let reference = if self.is_equal_mass() {
            kinematics.sum_p4(&self.list2).m()
        } else {
            self.mass
        };
        DVector::from_element(1, m1 - reference)
    }
    fn derivative(&self, id: BlockId, kinematics: &Kinematics, _alpha: &DVector<f64>) -> DMatrix<f64> {
        let mut derivative = DMatrix::zeros(1, kinematics.n_par(id));
        if self.list1.contains(&id) {
            let gradient = mass_gradient(&kinematics.sum_p4(&self.list1));
            accumulate_chain(&mut derivative, id, &self.list1, 1.0, &gradient, kinematics);
        }
        if self.list2.contains(&id) {
            let gradient = mass_gradient(&kinematics.sum_p4(&self.list2));
            accumulate_chain(&mut derivative, id, &self.list2, -1.0, &gradient, kinematics);
        }
        derivative
    }
}

/// A soft mass constraint: the invariant mass is fixed to a scaled pole mass
/// $`f = M - \alpha M_0`$, where the nuisance parameter $`\alpha`$ starts at one with variance
/// $`(\Gamma / M_0)^2`$. This lets the mass follow a Gaussian of width $`\Gamma`$ around
/// $`M_0`$.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GaussianMassConstraint {
    name: String,
    blocks: Vec<BlockId>,
    mass: f64,
    width: f64,
    nuisance: Nuisance,
}

impl GaussianMassConstraint {
    pub fn new(name: &str, blocks: &[BlockId], mass: f64, width: f64) -> Self {
        Self {
            name: name.to_string(),
            blocks: blocks.to_vec(),
            mass,
            width,
            nuisance: Nuisance::scalar(1.0, (width / mass).powi(2)),
        }
    }
}

#[typetag::serde]
impl Constraint for GaussianMassConstraint {
    fn name(&self) -> &str {
        &self.name
    }
    fn blocks(&self) -> Vec<BlockId> {
        self.blocks.clone()
    }
    fn nuisance(&self) -> Option<&Nuisance> {
        Some(&self.nuisance)
    }
    fn check(&self, blocks: &[ParameterBlock]) -> KinFitResult<()> {
        check_blocks(&self.name, &self.blocks, blocks, BlockKind::Momentum)?;
        check_scalar_nuisance(&self.name, &self.nuisance)?;
        if !(self.mass.is_finite() && self.mass > 0.0 && self.width.is_finite() && self.width > 0.0) {
            return Err(KinFitError::config(format!(
                "constraint \"{}\" needs a positive mass and width (got {} and {})",
                self.name, self.mass, self.width
            )));
        }
        Ok(())
    }
    fn current_value(&self, kinematics: &Kinematics, alpha: &DVector<f64>) -> DVector<f64> {
        DVector::from_element(1, kinematics.sum_p4(&self.blocks).m() - alpha[0] * self.mass)
    }
    fn derivative(&self, id: BlockId, kinematics: &Kinematics, _alpha: &DVector<f64>) -> DMatrix<f64> {
        let mut derivative = DMatrix::zeros(1, kinematics.n_par(id));
        if self.blocks.contains(&id) {
            let gradient = mass_gradient(&kinematics.sum_p4(&self.blocks));
            accumulate_chain(&mut derivative, id, &self.blocks, 1.0, &gradient, kinematics);
        }
        derivative
    }
    fn derivative_alpha(&self, _kinematics: &Kinematics, _alpha: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, -self.mass)
    }
}
