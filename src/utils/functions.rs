use std::f64::consts::{FRAC_1_SQRT_2, PI, SQRT_2};

use statrs::{
    distribution::{ChiSquared, ContinuousCDF},
    function::erf,
};

/// The standard normal probability density $`\phi(x)`$.
pub fn normal_pdf(x: f64) -> f64 {
    f64::exp(-0.5 * x * x) / f64::sqrt(2.0 * PI)
}

/// The standard normal cumulative distribution $`\Phi(x)`$.
pub fn normal_cdf(x: f64) -> f64 {
    1.0 - 0.5 * erf::erfc(FRAC_1_SQRT_2 * x)
}

/// The inverse of [`normal_cdf`], $`\Phi^{-1}(p) = \sqrt{2}\,\text{erf}^{-1}(2p - 1)`$.
///
/// Returns $`\pm\infty`$ at $`p = 1`$ and $`p = 0`$.
pub fn normal_quantile(p: f64) -> f64 {
    SQRT_2 * erf::erf_inv(2.0 * p - 1.0)
}

/// The cumulative distribution of a nonrelativistic Breit-Wigner (Cauchy) distribution with
/// pole `mass` and full `width`:
///
/// ```math
/// F_{BW}(m) = \frac{1}{\pi}\tan^{-1}\left(\frac{2(m - m_0)}{\Gamma}\right) + \frac{1}{2}
/// ```
pub fn breit_wigner_cdf(m: f64, mass: f64, width: f64) -> f64 {
    f64::atan(2.0 * (m - mass) / width) / PI + 0.5
}

/// The probability density matching [`breit_wigner_cdf`].
pub fn breit_wigner_pdf(m: f64, mass: f64, width: f64) -> f64 {
    let half_width = 0.5 * width;
    half_width / (PI * ((m - mass).powi(2) + half_width.powi(2)))
}

/// The upper-tail probability of a $`\chi^2`$ distribution with `ndf` degrees of freedom.
///
/// Returns [`None`] when `ndf` is not positive, where no such distribution exists.
pub fn chi2_probability(chi2: f64, ndf: i64) -> Option<f64> {
    if ndf <= 0 {
        return None;
    }
    ChiSquared::new(ndf as f64)
        .ok()
        .map(|dist| dist.sf(chi2.max(0.0)))
}
