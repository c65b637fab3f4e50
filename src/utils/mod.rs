/// Useful enumerations for constraints on four-momenta.
pub mod enums;
/// Special functions: normal and Breit-Wigner distributions and $`\chi^2`$ probabilities.
pub mod functions;
/// Three- and four-vectors with the kinematic quantities a fit needs.
pub mod vectors;

/// A helper method to get histogram edges from evenly-spaced `bins` over a given `range`
/// # See Also
/// [`get_bin_index`]
pub fn get_bin_edges(bins: usize, range: (f64, f64)) -> Vec<f64> {
    let bin_width = (range.1 - range.0) / (bins as f64);
    (0..=bins)
        .map(|i| range.0 + (i as f64 * bin_width))
        .collect()
}

/// A helper method to obtain the index of the bin containing `value` for arbitrary
/// (monotonically increasing) `edges`. Bins are left-closed, and values outside of the
/// edges are clamped into the first or last bin.
///
/// # See Also
/// [`get_bin_edges`]
pub fn get_bin_index(value: f64, edges: &[f64]) -> usize {
    let bins = edges.len().saturating_sub(1);
    if bins == 0 {
        return 0;
    }
    // number of edges <= value, so the containing bin is one less
    let upper = edges.partition_point(|&edge| edge <= value);
    upper.saturating_sub(1).min(bins - 1)
}
