use std::fmt::Display;

use auto_ops::{impl_op_ex, impl_op_ex_commutative};
use nalgebra::{Vector3, Vector4};
use serde::{Deserialize, Serialize};

/// A three-vector of `f64`s, typically a three-momentum or a position.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    /// The x-component
    pub x: f64,
    /// The y-component
    pub y: f64,
    /// The z-component
    pub z: f64,
}

impl Display for Vec3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:6.3}, {:6.3}, {:6.3}]", self.x, self.y, self.z)
    }
}

impl From<Vector3<f64>> for Vec3 {
    fn from(value: Vector3<f64>) -> Self {
        Self::new(value.x, value.y, value.z)
    }
}

impl From<Vec3> for Vector3<f64> {
    fn from(value: Vec3) -> Self {
        Vector3::new(value.x, value.y, value.z)
    }
}

impl From<[f64; 3]> for Vec3 {
    fn from(value: [f64; 3]) -> Self {
        Self::new(value[0], value[1], value[2])
    }
}

impl Vec3 {
    /// Create a new [`Vec3`] from its components.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
    /// Build the [`Vec3`] with transverse magnitude `pt`, pseudorapidity `eta`, and azimuth `phi`.
    pub fn from_pt_eta_phi(pt: f64, eta: f64, phi: f64) -> Self {
        Self::new(pt * phi.cos(), pt * phi.sin(), pt * eta.sinh())
    }
    /// Build the [`Vec3`] with transverse magnitude `pt`, polar angle `theta`, and azimuth `phi`.
    pub fn from_pt_theta_phi(pt: f64, theta: f64, phi: f64) -> Self {
        Self::new(pt * phi.cos(), pt * phi.sin(), pt / theta.tan())
    }
    /// Promote the three-momentum to a four-momentum with the given mass.
    pub fn with_mass(&self, mass: f64) -> Vec4 {
        let e = f64::sqrt(mass.powi(2) + self.mag2());
        Vec4::new(self.x, self.y, self.z, e)
    }
    /// Promote the three-momentum to a four-momentum with the given energy.
    pub fn with_energy(&self, energy: f64) -> Vec4 {
        Vec4::new(self.x, self.y, self.z, energy)
    }
    pub fn dot(&self, other: &Self) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }
    pub fn cross(&self, other: &Self) -> Self {
        Self::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }
    pub fn mag2(&self) -> f64 {
        self.dot(self)
    }
    pub fn mag(&self) -> f64 {
        self.mag2().sqrt()
    }
    /// The squared magnitude of the transverse (x, y) projection.
    pub fn pt2(&self) -> f64 {
        self.x * self.x + self.y * self.y
    }
    /// The magnitude of the transverse (x, y) projection.
    pub fn pt(&self) -> f64 {
        self.pt2().sqrt()
    }
    pub fn costheta(&self) -> f64 {
        self.z / self.mag()
    }
    pub fn theta(&self) -> f64 {
        self.pt().atan2(self.z)
    }
    pub fn phi(&self) -> f64 {
        self.y.atan2(self.x)
    }
    /// The pseudorapidity, $`\eta = \sinh^{-1}(p_z / p_T)`$.
    pub fn eta(&self) -> f64 {
        (self.z / self.pt()).asinh()
    }
    pub fn unit(&self) -> Self {
        let mag = self.mag();
        Self::new(self.x / mag, self.y / mag, self.z / mag)
    }
    /// The gradient of [`Vec3::eta`] with respect to the components.
    pub fn eta_gradient(&self) -> Self {
        let pt2 = self.pt2();
        let p = self.mag();
        Self::new(
            -self.x * self.z / (pt2 * p),
            -self.y * self.z / (pt2 * p),
            1.0 / p,
        )
    }
    /// The gradient of [`Vec3::phi`] with respect to the components.
    pub fn phi_gradient(&self) -> Self {
        let pt2 = self.pt2();
        Self::new(-self.y / pt2, self.x / pt2, 0.0)
    }
    /// The gradient of [`Vec3::theta`] with respect to the components.
    pub fn theta_gradient(&self) -> Self {
        let pt = self.pt();
        let p2 = self.mag2();
        Self::new(
            self.x * self.z / (pt * p2),
            self.y * self.z / (pt * p2),
            -pt / p2,
        )
    }
    fn add(&self, other: &Self) -> Self {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }
    fn sub(&self, other: &Self) -> Self {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }
    fn mul(&self, other: f64) -> Self {
        Self::new(self.x * other, self.y * other, self.z * other)
    }
    fn div(&self, other: f64) -> Self {
        Self::new(self.x / other, self.y / other, self.z / other)
    }
    fn neg(&self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

impl_op_ex!(+ |a: &Vec3, b: &Vec3| -> Vec3 { a.add(b) });
impl_op_ex!(-|a: &Vec3, b: &Vec3| -> Vec3 { a.sub(b) });
impl_op_ex!(-|a: &Vec3| -> Vec3 { a.neg() });
impl_op_ex_commutative!(*|a: &Vec3, b: &f64| -> Vec3 { a.mul(*b) });
impl_op_ex!(/ |a: &Vec3, b: &f64| -> Vec3 { a.div(*b) });

/// A four-momentum stored as $`(p_x, p_y, p_z, E)`$.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec4 {
    /// The x-component of the momentum
    pub x: f64,
    /// The y-component of the momentum
    pub y: f64,
    /// The z-component of the momentum
    pub z: f64,
    /// The energy
    pub t: f64,
}

impl Display for Vec4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[e = {:.5}; p = ({:.5}, {:.5}, {:.5}); m = {:.5}]",
            self.e(),
            self.px(),
            self.py(),
            self.pz(),
            self.m()
        )
    }
}

impl From<Vector4<f64>> for Vec4 {
    fn from(value: Vector4<f64>) -> Self {
        Self::new(value.x, value.y, value.z, value.w)
    }
}

impl From<Vec4> for Vector4<f64> {
    fn from(value: Vec4) -> Self {
        Vector4::new(value.x, value.y, value.z, value.t)
    }
}

impl Vec4 {
    /// Create a new [`Vec4`] from $`(p_x, p_y, p_z, E)`$.
    pub fn new(px: f64, py: f64, pz: f64, e: f64) -> Self {
        Self {
            x: px,
            y: py,
            z: pz,
            t: e,
        }
    }
    /// Sum an iterator of four-momenta.
    pub fn sum<'a, I>(p4s: I) -> Self
    where
        I: IntoIterator<Item = &'a Vec4>,
    {
        p4s.into_iter().fold(Vec4::default(), |acc, p4| acc + p4)
    }
    pub fn px(&self) -> f64 {
        self.x
    }
    pub fn py(&self) -> f64 {
        self.y
    }
    pub fn pz(&self) -> f64 {
        self.z
    }
    pub fn e(&self) -> f64 {
        self.t
    }
    /// The spatial part of the four-momentum.
    pub fn vec3(&self) -> Vec3 {
        Vec3::new(self.x, self.y, self.z)
    }
    pub fn pt(&self) -> f64 {
        self.vec3().pt()
    }
    pub fn eta(&self) -> f64 {
        self.vec3().eta()
    }
    pub fn theta(&self) -> f64 {
        self.vec3().theta()
    }
    pub fn phi(&self) -> f64 {
        self.vec3().phi()
    }
    pub fn beta(&self) -> Vec3 {
        self.vec3() / self.e()
    }
    pub fn gamma(&self) -> f64 {
        self.e() / self.m()
    }
    /// The Minkowski square $`E^2 - |\vec{p}|^2`$.
    pub fn m2(&self) -> f64 {
        self.e() * self.e() - self.vec3().mag2()
    }
    /// The invariant mass. Space-like vectors report the negative square root of $`-m^2`$ so
    /// that the value stays continuous through zero.
    pub fn m(&self) -> f64 {
        let m2 = self.m2();
        if m2 >= 0.0 {
            m2.sqrt()
        } else {
            -(-m2).sqrt()
        }
    }
    /// Boost the four-momentum by the velocity `beta`.
    pub fn boost(&self, beta: &Vec3) -> Self {
        let b2 = beta.dot(beta);
        if b2 == 0.0 {
            return *self;
        }
        let gamma = 1.0 / f64::sqrt(1.0 - b2);
        let p3 = self.vec3() + beta * ((gamma - 1.0) * self.vec3().dot(beta) / b2 + gamma * self.e());
        Self::new(p3.x, p3.y, p3.z, gamma * (self.e() + beta.dot(&self.vec3())))
    }
    fn add(&self, other: &Self) -> Self {
        Self::new(
            self.x + other.x,
            self.y + other.y,
            self.z + other.z,
            self.t + other.t,
        )
    }
    fn sub(&self, other: &Self) -> Self {
        Self::new(
            self.x - other.x,
            self.y - other.y,
            self.z - other.z,
            self.t - other.t,
        )
    }
    fn neg(&self) -> Self {
        Self::new(-self.x, -self.y, -self.z, -self.t)
    }
}

impl_op_ex!(+ |a: &Vec4, b: &Vec4| -> Vec4 { a.add(b) });
impl_op_ex!(-|a: &Vec4, b: &Vec4| -> Vec4 { a.sub(b) });
impl_op_ex!(-|a: &Vec4| -> Vec4 { a.neg() });

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn test_vec_sums() {
        let a = Vec3::new(1.0, 2.0, 3.0);
        let b = Vec3::new(4.0, 5.0, 6.0);
        let c = a + b;
        assert_eq!(c.x, 5.0);
        assert_eq!(c.y, 7.0);
        assert_eq!(c.z, 9.0);
        let total = Vec4::sum(&[a.with_mass(1.0), b.with_energy(10.0)]);
        assert_relative_eq!(total.e(), 15.0_f64.sqrt() + 10.0);
        assert_relative_eq!(total.pz(), 9.0);
    }

    #[test]
    fn test_three_to_four_momentum_conversion() {
        let p3 = Vec3::new(1.0, 2.0, 3.0);
        let target = Vec4::new(1.0, 2.0, 3.0, 10.0);
        let from_mass = p3.with_mass(target.m());
        assert_relative_eq!(from_mass.e(), target.e());
        assert_relative_eq!(from_mass.px(), target.px());
        assert_relative_eq!(from_mass.py(), target.py());
        assert_relative_eq!(from_mass.pz(), target.pz());
    }

    #[test]
    fn test_four_momentum_basics() {
        let p = Vec4::new(3.0, 4.0, 5.0, 10.0);
        assert_relative_eq!(p.m(), 50.0_f64.sqrt());
        assert_relative_eq!(p.m2(), 50.0);
        assert_relative_eq!(p.gamma(), 2.0_f64.sqrt());
        assert_relative_eq!(p.beta().x, 0.3);
        assert_relative_eq!(p.beta().y, 0.4);
        assert_relative_eq!(p.beta().z, 0.5);
        assert_relative_eq!(p.pt(), 5.0);
        let spacelike = Vec4::new(3.0, 4.0, 0.0, 3.0);
        assert_relative_eq!(spacelike.m(), -4.0);
    }

    #[test]
    fn test_angles() {
        let p = Vec3::from_pt_eta_phi(2.0, 0.7, -1.1);
        assert_relative_eq!(p.pt(), 2.0);
        assert_relative_eq!(p.eta(), 0.7, epsilon = 1e-12);
        assert_relative_eq!(p.phi(), -1.1, epsilon = 1e-12);
        let q = Vec3::from_pt_theta_phi(2.0, 0.4, 2.5);
        assert_relative_eq!(q.theta(), 0.4, epsilon = 1e-12);
        assert_relative_eq!(q.phi(), 2.5, epsilon = 1e-12);
        assert_relative_eq!(q.costheta(), 0.4_f64.cos(), epsilon = 1e-12);
    }

    #[test]
    fn test_angle_gradients() {
        let p = Vec3::new(0.7, -1.3, 2.1);
        let h = 1e-6;
        let shifts = [
            Vec3::new(h, 0.0, 0.0),
            Vec3::new(0.0, h, 0.0),
            Vec3::new(0.0, 0.0, h),
        ];
        let grads = [p.eta_gradient(), p.phi_gradient(), p.theta_gradient()];
        let funcs: [fn(&Vec3) -> f64; 3] = [Vec3::eta, Vec3::phi, Vec3::theta];
        for (grad, func) in grads.iter().zip(funcs) {
            let numeric: Vec<f64> = shifts
                .iter()
                .map(|s| (func(&(p + s)) - func(&(p - s))) / (2.0 * h))
                .collect();
            assert_relative_eq!(grad.x, numeric[0], epsilon = 1e-7);
            assert_relative_eq!(grad.y, numeric[1], epsilon = 1e-7);
            assert_relative_eq!(grad.z, numeric[2], epsilon = 1e-7);
        }
    }

    #[test]
    fn test_boost_com() {
        let p = Vec4::new(3.0, 4.0, 5.0, 10.0);
        let zero = p.boost(&-p.beta());
        assert_relative_eq!(zero.px(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(zero.py(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(zero.pz(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(zero.e(), p.m(), epsilon = 1e-12);
    }

    #[test]
    fn test_boost() {
        let pa = Vec4::new(3.0, 4.0, 5.0, 10.0);
        let pb = Vec4::new(3.4, 2.3, 1.2, 9.0);
        let boosted = pa.boost(&-pb.beta());
        assert_relative_eq!(boosted.e(), 8.157632144622882, epsilon = 1e-12);
        assert_relative_eq!(boosted.px(), -0.6489200627053444, epsilon = 1e-12);
        assert_relative_eq!(boosted.py(), 1.5316128987581492, epsilon = 1e-12);
        assert_relative_eq!(boosted.pz(), 3.712145860221643, epsilon = 1e-12);
    }
}
