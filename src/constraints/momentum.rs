use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::{
    constraints::{accumulate_chain, check_blocks, BlockKind, Constraint},
    particles::{BlockId, Kinematics, ParameterBlock},
    utils::enums::Component,
    KinFitError, KinFitResult,
};

/// Conservation of one four-momentum component,
///
/// ```math
/// f = \sum_{i \in L_1} P_{i,c} - \sum_{j \in L_2} P_{j,c} - C
/// ```
///
/// for a [`Component`] $`c`$ and constant $`C`$. Use one constraint per component to conserve
/// the full four-momentum (for instance against a known beam energy).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MomentumConstraint {
    name: String,
    component: Component,
    list1: Vec<BlockId>,
    list2: Vec<BlockId>,
    value: f64,
}

impl MomentumConstraint {
    /// Require the summed `component` of `blocks` to equal `value`.
    pub fn new(name: &str, component: Component, blocks: &[BlockId], value: f64) -> Self {
        Self {
            name: name.to_string(),
            component,
            list1: blocks.to_vec(),
            list2: Vec::new(),
            value,
        }
    }
    /// Require the summed `component` of `list1` minus that of `list2` to equal `value`.
    pub fn balance(
        name: &str,
        component: Component,
        list1: &[BlockId],
        list2: &[BlockId],
        value: f64,
    ) -> Self {
        Self {
            name: name.to_string(),
            component,
            list1: list1.to_vec(),
            list2: list2.to_vec(),
            value,
        }
    }
    fn gradient(&self) -> DMatrix<f64> {
        let mut gradient = DMatrix::zeros(1, 4);
        gradient[(0, self.component.index())] = 1.0;
        gradient
    }
}

#[typetag::serde]
impl Constraint for MomentumConstraint {
    fn name(&self) -> &str {
        &self.name
    }
    fn blocks(&self) -> Vec<BlockId> {
        self.list1.iter().chain(&self.list2).copied().collect()
    }
    fn check(&self, blocks: &[ParameterBlock]) -> KinFitResult<()> {
        check_blocks(&self.name, &self.blocks(), blocks, BlockKind::Momentum)?;
        if !self.value.is_finite() {
            return Err(KinFitError::config(format!(
                "constraint \"{}\" has a non-finite target {}",
                self.name, self.value
            )));
        }
        Ok(())
    }
    fn current_value(&self, kinematics: &Kinematics, _alpha: &DVector<f64>) -> DVector<f64> {
        let sum1 = self.component.of(&kinematics.sum_p4(&self.list1));
        let sum2 = self.component.of(&kinematics.sum_p4(&self.list2));
        DVector::from_element(1, sum1 - sum2 - self.value)
    }
    fn derivative(&self, id: BlockId, kinematics: &Kinematics, _alpha: &DVector<f64>) -> DMatrix<f64> {
        let mut derivative = DMatrix::zeros(1, kinematics.n_par(id));
        let gradient = self.gradient();
        accumulate_chain(&mut derivative, id, &self.list1, 1.0, &gradient, kinematics);
        accumulate_chain(&mut derivative, id, &self.list2, -1.0, &gradient, kinematics);
        derivative
    }
}
