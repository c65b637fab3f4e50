use std::f64::consts::{FRAC_1_SQRT_2, FRAC_PI_2, PI};

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use statrs::function::erf::erf;

use crate::{
    constraints::{
        accumulate_chain, check_blocks, check_scalar_nuisance, mass::mass_gradient, BlockKind,
        Constraint, Nuisance,
    },
    particles::{BlockId, Kinematics, ParameterBlock},
    utils::functions::{breit_wigner_cdf, breit_wigner_pdf, normal_cdf, normal_pdf},
    KinFitError, KinFitResult,
};

fn check_line_shape(name: &str, mass: f64, width: f64) -> KinFitResult<()> {
    if !(mass.is_finite() && mass > 0.0 && width.is_finite() && width > 0.0) {
        return Err(KinFitError::config(format!(
            "constraint \"{}\" needs a positive pole mass and width (got {} and {})",
            name, mass, width
        )));
    }
    Ok(())
}

/// Requires the invariant mass of a set of blocks to follow a Breit-Wigner line shape by
/// matching its cumulative distribution to that of a standard normal nuisance parameter
/// $`\mu`$:
///
/// ```math
/// f = F_{BW}(M) - \Phi(\mu)
/// ```
///
/// $`\mu`$ starts at zero with unit variance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BreitWignerConstraint {
    name: String,
    blocks: Vec<BlockId>,
    mass: f64,
    width: f64,
    nuisance: Nuisance,
}

impl BreitWignerConstraint {
    pub fn new(name: &str, blocks: &[BlockId], mass: f64, width: f64) -> Self {
        Self {
            name: name.to_string(),
            blocks: blocks.to_vec(),
            mass,
            width,
            nuisance: Nuisance::scalar(0.0, 1.0),
        }
    }
}

#[typetag::serde]
impl Constraint for BreitWignerConstraint {
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
        check_line_shape(&self.name, self.mass, self.width)
    }
    fn current_value(&self, kinematics: &Kinematics, alpha: &DVector<f64>) -> DVector<f64> {
        let m = kinematics.sum_p4(&self.blocks).m();
        DVector::from_element(
            1,
            breit_wigner_cdf(m, self.mass, self.width) - normal_cdf(alpha[0]),
        )
    }
    fn derivative(&self, id: BlockId, kinematics: &Kinematics, _alpha: &DVector<f64>) -> DMatrix<f64> {
        let mut derivative = DMatrix::zeros(1, kinematics.n_par(id));
        if self.blocks.contains(&id) {
            let total = kinematics.sum_p4(&self.blocks);
            let gradient = mass_gradient(&total) * breit_wigner_pdf(total.m(), self.mass, self.width);
            accumulate_chain(&mut derivative, id, &self.blocks, 1.0, &gradient, kinematics);
        }
        derivative
    }
    fn derivative_alpha(&self, _kinematics: &Kinematics, alpha: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, -normal_pdf(alpha[0]))
    }
}

/// The same Breit-Wigner prior as [`BreitWignerConstraint`] written directly in mass space,
///
/// ```math
/// f = M - \left(M_0 + \frac{\Gamma}{2}\tan\left(\frac{\pi}{2}\,\text{erf}\left(\frac{\mu}{\sqrt{2}}\right)\right)\right)
/// ```
///
/// which keeps the residual in units of mass.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BreitWignerMassConstraint {
    name: String,
    blocks: Vec<BlockId>,
    mass: f64,
    width: f64,
    nuisance: Nuisance,
}

impl BreitWignerMassConstraint {
    pub fn new(name: &str, blocks: &[BlockId], mass: f64, width: f64) -> Self {
        Self {
            name: name.to_string(),
            blocks: blocks.to_vec(),
            mass,
            width,
            nuisance: Nuisance::scalar(0.0, 1.0),
        }
    }
}

#[typetag::serde]
impl Constraint for BreitWignerMassConstraint {
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
        check_line_shape(&self.name, self.mass, self.width)
    }
    fn current_value(&self, kinematics: &Kinematics, alpha: &DVector<f64>) -> DVector<f64> {
        let m = kinematics.sum_p4(&self.blocks).m();
        let shift = 0.5 * self.width * f64::tan(FRAC_PI_2 * erf(alpha[0] * FRAC_1_SQRT_2));
        DVector::from_element(1, m - (self.mass + shift))
    }
    fn derivative(&self, id: BlockId, kinematics: &Kinematics, _alpha: &DVector<f64>) -> DMatrix<f64> {
        let mut derivative = DMatrix::zeros(1, kinematics.n_par(id));
        if self.blocks.contains(&id) {
            let gradient = mass_gradient(&kinematics.sum_p4(&self.blocks));
            accumulate_chain(&mut derivative, id, &self.blocks, 1.0, &gradient, kinematics);
        }
        derivative
    }
    fn derivative_alpha(&self, _kinematics: &Kinematics, alpha: &DVector<f64>) -> DMatrix<f64> {
        let mu = alpha[0];
        let cos = f64::cos(FRAC_PI_2 * erf(mu * FRAC_1_SQRT_2));
        let value = -f64::sqrt(PI / 2.0) / 2.0 * self.width * f64::exp(-0.5 * mu * mu) / (cos * cos);
        DMatrix::from_element(1, 1, value)
    }
}
