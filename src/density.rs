use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::PathBuf,
};

use accurate::{sum::Klein, traits::*};
use serde::{Deserialize, Serialize};

use crate::{
    utils::{functions::normal_quantile, get_bin_edges, get_bin_index},
    KinFitError, KinFitResult,
};

fn expand_path(file_path: &str) -> KinFitResult<PathBuf> {
    Ok(PathBuf::from(&*shellexpand::full(file_path)?))
}

/// The stored form of a [`DensityTable`]. Everything else is derived on load so a table read
/// from disk goes through the same validation as one built in memory.
#[derive(Clone, Serialize, Deserialize)]
struct DensityTableData {
    edges: Vec<f64>,
    weights: Vec<f64>,
}

/// A normalized, binned, one-dimensional probability density with finite support.
///
/// The cumulative distribution is the piecewise-linear interpolation of the bin integrals, so
/// it is continuous and its slope inside a bin is exactly that bin's density. The mode is
/// located at the center of the bin with the largest density (the first one on ties), and
///
/// ```math
/// \Delta = \sqrt{2}\,\text{erf}^{-1}\left(2F(\text{mode}) - 1\right)
/// ```
///
/// is precomputed so that $`\Phi(\Delta) = F(\text{mode})`$.
///
/// Tables are immutable once built and are meant to be shared between constraints through an
/// [`Arc`](std::sync::Arc).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DensityTableData", into = "DensityTableData")]
pub struct DensityTable {
    edges: Vec<f64>,
    weights: Vec<f64>,
    cumulative: Vec<f64>,
    mode: f64,
    delta: f64,
}

impl From<DensityTable> for DensityTableData {
    fn from(table: DensityTable) -> Self {
        Self {
            edges: table.edges,
            weights: table.weights,
        }
    }
}

impl TryFrom<DensityTableData> for DensityTable {
    type Error = KinFitError;

    fn try_from(data: DensityTableData) -> Result<Self, Self::Error> {
        Self::new(&data.edges, &data.weights)
    }
}

impl DensityTable {
    /// Build a table from strictly increasing bin `edges` and one non-negative `weight` per
    /// bin. The weights are normalized to unit integral.
    ///
    /// # Errors
    ///
    /// Returns a [`KinFitError::ConfigurationError`] if there are fewer than two edges, the
    /// edges are not finite and strictly increasing, the number of weights does not match the
    /// number of bins, any weight is negative or non-finite, or the weights do not sum to a
    /// finite positive value.
    pub fn new(edges: &[f64], weights: &[f64]) -> KinFitResult<Self> {
        if edges.len() < 2 {
            return Err(KinFitError::config(
                "a density table needs at least one bin",
            ));
        }
        if edges.iter().any(|e| !e.is_finite()) || edges.windows(2).any(|w| w[1] <= w[0]) {
            return Err(KinFitError::config(
                "density table edges must be finite and strictly increasing",
            ));
        }
        if weights.len() != edges.len() - 1 {
            return Err(KinFitError::config(format!(
                "density table has {} bins but {} weights",
                edges.len() - 1,
                weights.len()
            )));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(KinFitError::config(
                "density table weights must be finite and non-negative",
            ));
        }
        let total = weights.iter().copied().sum_with_accumulator::<Klein<f64>>();
        if !(total.is_finite() && total > 0.0) {
            return Err(KinFitError::config(format!(
                "density table weights cannot be normalized (sum is {})",
                total
            )));
        }
        let weights: Vec<f64> = weights.iter().map(|w| w / total).collect();
        let mut cumulative = Vec::with_capacity(edges.len());
        cumulative.push(0.0);
        let mut acc = Klein::from(0.0);
        for w in &weights {
            acc += *w;
            cumulative.push(acc.clone().sum());
        }
        let mut table = Self {
            edges: edges.to_vec(),
            weights,
            cumulative,
            mode: 0.0,
            delta: 0.0,
        };
        let mut mode_bin = 0;
        for bin in 1..table.n_bins() {
            if table.bin_density(bin) > table.bin_density(mode_bin) {
                mode_bin = bin;
            }
        }
        table.mode = 0.5 * (table.edges[mode_bin] + table.edges[mode_bin + 1]);
        table.delta = normal_quantile(table.cdf(table.mode));
        if table.weights.iter().any(|w| !w.is_finite()) || !table.delta.is_finite() {
            return Err(KinFitError::config(
                "density table normalization produced non-finite values",
            ));
        }
        Ok(table)
    }

    /// Build a table with `weights.len()` evenly spaced bins over `range`.
    pub fn from_range(range: (f64, f64), weights: &[f64]) -> KinFitResult<Self> {
        Self::new(&get_bin_edges(weights.len(), range), weights)
    }

    /// Read a table written by [`DensityTable::save`]. The path may contain `~` and
    /// environment variables.
    pub fn load(file_path: &str) -> KinFitResult<Self> {
        let path = expand_path(file_path)?;
        let mut reader = BufReader::new(File::open(path)?);
        Ok(bincode::serde::decode_from_std_read(
            &mut reader,
            bincode::config::standard(),
        )?)
    }

    /// Write the table to `file_path` in the `bincode` format.
    pub fn save(&self, file_path: &str) -> KinFitResult<()> {
        let path = expand_path(file_path)?;
        let mut writer = BufWriter::new(File::create(path)?);
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())?;
        Ok(())
    }

    pub fn n_bins(&self) -> usize {
        self.weights.len()
    }
    pub fn edges(&self) -> &[f64] {
        &self.edges
    }
    /// The normalized bin weights (they sum to one).
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }
    /// The lower and upper edge of the support.
    pub fn support(&self) -> (f64, f64) {
        (self.edges[0], self.edges[self.n_bins()])
    }
    /// The index of the (left-closed) bin containing `x`, clamped into the table.
    pub fn find_bin(&self, x: f64) -> usize {
        get_bin_index(x, &self.edges)
    }
    fn bin_density(&self, bin: usize) -> f64 {
        self.weights[bin] / (self.edges[bin + 1] - self.edges[bin])
    }
    /// The cumulative distribution at `x`, clamped to 0 below and 1 above the support.
    pub fn cdf(&self, x: f64) -> f64 {
        let (lo, hi) = self.support();
        if x <= lo {
            return 0.0;
        }
        if x >= hi {
            return 1.0;
        }
        let bin = self.find_bin(x);
        let frac = (x - self.edges[bin]) / (self.edges[bin + 1] - self.edges[bin]);
        self.cumulative[bin] + frac * self.weights[bin]
    }
    /// The probability density of the bin containing `x` (with clamping outside the support).
    pub fn density(&self, x: f64) -> f64 {
        self.bin_density(self.find_bin(x))
    }
    /// The center of the most probable bin.
    pub fn mode(&self) -> f64 {
        self.mode
    }
    /// The standard-normal quantile of the cumulative distribution at the mode.
    pub fn delta(&self) -> f64 {
        self.delta
    }
}
