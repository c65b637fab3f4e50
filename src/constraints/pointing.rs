use std::f64::consts::{PI, TAU};

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::{
    constraints::{accumulate_chain, check_blocks, BlockKind, Constraint},
    particles::{BlockId, Kinematics, ParameterBlock},
    utils::vectors::Vec3,
    KinFitResult,
};

/// Wrap an angle difference into $`(-\pi, \pi]`$.
fn wrap_phi(dphi: f64) -> f64 {
    let wrapped = dphi % TAU;
    if wrapped > PI {
        wrapped - TAU
    } else if wrapped <= -PI {
        wrapped + TAU
    } else {
        wrapped
    }
}

/// Requires the summed momentum $`P`$ of a set of daughter blocks to point along the flight
/// direction $`\vec{d} = \vec{x}_{SV} - \vec{x}_{PV}`$ from a primary to a secondary vertex.
/// This contributes two equations,
///
/// ```math
/// f = \begin{pmatrix} \phi_P - \phi_d \\ \theta_P - \theta_d \end{pmatrix}
/// ```
///
/// with the azimuthal difference wrapped into $`(-\pi, \pi]`$. Both vertices must be
/// [`Parametrization::Position`](crate::particles::Parametrization::Position) blocks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PointingConstraint {
    name: String,
    daughters: Vec<BlockId>,
    primary: BlockId,
    secondary: BlockId,
}

impl PointingConstraint {
    pub fn new(name: &str, daughters: &[BlockId], primary: BlockId, secondary: BlockId) -> Self {
        Self {
            name: name.to_string(),
            daughters: daughters.to_vec(),
            primary,
            secondary,
        }
    }
    fn flight(&self, kinematics: &Kinematics) -> Vec3 {
        kinematics.position(self.secondary) - kinematics.position(self.primary)
    }
}

fn angle_rows(v: &Vec3) -> [Vec3; 2] {
    [v.phi_gradient(), v.theta_gradient()]
}

#[typetag::serde]
impl Constraint for PointingConstraint {
    fn name(&self) -> &str {
        &self.name
    }
    fn blocks(&self) -> Vec<BlockId> {
        let mut blocks = self.daughters.clone();
        blocks.push(self.primary);
        blocks.push(self.secondary);
        blocks
    }
    fn n_equations(&self) -> usize {
        2
    }
    fn check(&self, blocks: &[ParameterBlock]) -> KinFitResult<()> {
        check_blocks(&self.name, &self.daughters, blocks, BlockKind::Momentum)?;
        check_blocks(
            &self.name,
            &[self.primary, self.secondary],
            blocks,
            BlockKind::Position,
        )
    }
    fn current_value(&self, kinematics: &Kinematics, _alpha: &DVector<f64>) -> DVector<f64> {
        let p = kinematics.sum_p4(&self.daughters).vec3();
        let d = self.flight(kinematics);
        DVector::from_vec(vec![wrap_phi(p.phi() - d.phi()), p.theta() - d.theta()])
    }
    fn derivative(&self, id: BlockId, kinematics: &Kinematics, _alpha: &DVector<f64>) -> DMatrix<f64> {
        let mut derivative = DMatrix::zeros(2, kinematics.n_par(id));
        if self.daughters.contains(&id) {
            let p = kinematics.sum_p4(&self.daughters).vec3();
            let mut df_dp4 = DMatrix::zeros(2, 4);
            for (row, gradient) in angle_rows(&p).iter().enumerate() {
                df_dp4[(row, 0)] = gradient.x;
                df_dp4[(row, 1)] = gradient.y;
                df_dp4[(row, 2)] = gradient.z;
            }
            accumulate_chain(&mut derivative, id, &self.daughters, 1.0, &df_dp4, kinematics);
        }
        if id == self.primary || id == self.secondary {
            let rows = angle_rows(&self.flight(kinematics));
            // f depends on -d, and d = SV - PV
            let sign = (id == self.primary) as i32 as f64 - (id == self.secondary) as i32 as f64;
            for (row, gradient) in rows.iter().enumerate() {
                derivative[(row, 0)] += sign * gradient.x;
                derivative[(row, 1)] += sign * gradient.y;
                derivative[(row, 2)] += sign * gradient.z;
            }
        }
        derivative
    }
}
