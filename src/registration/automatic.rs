//! Iterative rigid registration from 2D cross correlations.
//!
//! Each iteration takes the three orthogonal slices through point0, cross
//! correlates reference against correlate slice by slice and reads an
//! integer shift off every correlation peak. Every axis is seen by two of the
//! three slices; an axis is only moved when both estimates agree. The two
//! volumes are then cropped against each other by the accepted shift and the
//! process repeats until nothing moves.
//!
//! All indices and shifts here are in array order `(z, y, x)`. A shift `s`
//! means `correlate[i] == reference[i - s]`.

use crate::error::{DvcError, Result};

use ndarray::{Array2, ArrayView2, ArrayView3, Axis, Slice, s};
use rustfft::{FftDirection, FftPlanner, num_complex::Complex};

/// Tuning for [`AutomaticRegistration`].
#[derive(Debug, Clone)]
pub struct AutomaticRegistrationConfig {
    /// Largest disagreement, in voxels, between the two estimates of one axis.
    pub err_thresh: i64,
    pub max_iterations: usize,
}

impl Default for AutomaticRegistrationConfig {
    fn default() -> Self {
        Self {
            err_thresh: 2,
            max_iterations: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// An iteration found nothing left to shift.
    Converged,
    /// Gave up; the accumulated shift is still the best estimate.
    MaxIterationsReached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomaticRegistrationResult {
    /// Accumulated shift, `(z, y, x)`.
    pub shift: [i64; 3],
    pub iterations: usize,
    pub outcome: RegistrationOutcome,
}

pub struct AutomaticRegistration {
    config: AutomaticRegistrationConfig,
}

impl AutomaticRegistration {
    pub fn new(config: AutomaticRegistrationConfig) -> Self {
        Self { config }
    }

    /// Register `correlate` onto `reference`.
    ///
    /// `point` is point0 as an array index and `window` the half-open
    /// `[start, end)` range per axis that the 2D slices are restricted to.
    ///
    /// # Errors
    ///
    /// Returns error if the two volumes differ in shape or are empty
    pub fn run<'a>(
        &self,
        reference: ArrayView3<'a, f64>,
        correlate: ArrayView3<'a, f64>,
        point: [usize; 3],
        window: [[usize; 2]; 3],
    ) -> Result<AutomaticRegistrationResult> {
        if reference.shape() != correlate.shape() {
            let dims = |a: &ArrayView3<'_, f64>| -> [usize; 3] {
                let (z, y, x) = a.dim();
                [x, y, z]
            };
            return Err(DvcError::DimensionMismatch {
                expected: dims(&reference),
                actual: dims(&correlate),
            });
        }
        if reference.is_empty() {
            return Err(DvcError::configuration("cannot register empty volumes"));
        }

        let mut planner = FftPlanner::new();
        let (mut im0, mut im1) = (reference, correlate);
        let mut point = point;
        let mut accumulated = [0i64; 3];

        for iteration in 1..=self.config.max_iterations {
            let shape = [im0.len_of(Axis(0)), im0.len_of(Axis(1)), im0.len_of(Axis(2))];
            for axis in 0..3 {
                point[axis] = point[axis].min(shape[axis] - 1);
            }

            let estimates: [[i64; 2]; 3] = std::array::from_fn(|axis| {
                let (sel0, sel1) = (
                    window_slice(&im0, axis, point[axis], &window),
                    window_slice(&im1, axis, point[axis], &window),
                );
                displacement_2d(sel0, sel1, &mut planner)
            });
            let mut shift = combine_estimates(&estimates, self.config.err_thresh);
            for axis in 0..3 {
                let limit = shape[axis] as i64 - 1;
                shift[axis] = shift[axis].clamp(-limit, limit);
            }
            log::debug!(
                "Registration iteration {iteration}: estimates {estimates:?}, shift {shift:?}"
            );

            if shift == [0; 3] {
                log::info!("Automatic registration converged after {iteration} iterations: {accumulated:?}");
                return Ok(AutomaticRegistrationResult {
                    shift: accumulated,
                    iterations: iteration,
                    outcome: RegistrationOutcome::Converged,
                });
            }

            for axis in 0..3 {
                accumulated[axis] += shift[axis];
            }
            (im0, im1) = shift_arrays(im0, im1, shift);
            point = shift_point(point, shift, &im0);
        }

        log::warn!(
            "Automatic registration stopped after {} iterations: {accumulated:?}",
            self.config.max_iterations
        );
        Ok(AutomaticRegistrationResult {
            shift: accumulated,
            iterations: self.config.max_iterations,
            outcome: RegistrationOutcome::MaxIterationsReached,
        })
    }
}

/// The slice at `index` along `axis`, cut to `window` on the two other axes.
fn window_slice<'a>(
    volume: &ArrayView3<'a, f64>,
    axis: usize,
    index: usize,
    window: &[[usize; 2]; 3],
) -> ArrayView2<'a, f64> {
    let mut cut = volume.clone();
    for other in (0..3).filter(|&a| a != axis) {
        let len = cut.len_of(Axis(other));
        let start = window[other][0].min(len);
        let end = window[other][1].clamp(start, len);
        cut.slice_axis_inplace(Axis(other), Slice::from(start..end));
    }
    cut.index_axis_move(Axis(axis), index)
}

/// Integer shift of `sel1` relative to `sel0`, read off the peak of their
/// zero-mean cross correlation.
fn displacement_2d(
    sel0: ArrayView2<'_, f64>,
    sel1: ArrayView2<'_, f64>,
    planner: &mut FftPlanner<f64>,
) -> [i64; 2] {
    let (rows, cols) = sel0.dim();
    if rows == 0 || cols == 0 {
        return [0, 0];
    }
    let Some(corr) = cross_correlation_same(sel0, sel1, planner) else {
        return [0, 0];
    };
    let peak = corr
        .indexed_iter()
        .fold(None, |best: Option<((usize, usize), f64)>, (index, &v)| match best {
            Some((_, best_v)) if best_v >= v => best,
            _ => Some((index, v)),
        });
    match peak {
        Some(((r, c), _)) => [(rows / 2) as i64 - r as i64, (cols / 2) as i64 - c as i64],
        None => [0, 0],
    }
}

/// Zero-mean cross correlation of two equally sized images as a convolution
/// of `a` with `b` flipped on both axes, cropped to the input size around the
/// centre of the full result. `None` when either image is featureless.
fn cross_correlation_same(
    a: ArrayView2<'_, f64>,
    b: ArrayView2<'_, f64>,
    planner: &mut FftPlanner<f64>,
) -> Option<Array2<f64>> {
    let (rows, cols) = a.dim();
    let centred = |img: ArrayView2<'_, f64>| {
        let mean = img.mean().unwrap_or(0.0);
        img.mapv(|v| v - mean)
    };
    let (a, b) = (centred(a), centred(b));
    let energy = |img: &Array2<f64>| img.iter().map(|v| v * v).sum::<f64>();
    if energy(&a) < 1e-12 || energy(&b) < 1e-12 {
        return None;
    }

    let (full_rows, full_cols) = (2 * rows - 1, 2 * cols - 1);
    let mut fa = Array2::<Complex<f64>>::zeros((full_rows, full_cols));
    let mut fb = Array2::<Complex<f64>>::zeros((full_rows, full_cols));
    fa.slice_mut(s![..rows, ..cols])
        .zip_mut_with(&a, |dst, &v| *dst = Complex::new(v, 0.0));
    fb.slice_mut(s![..rows, ..cols])
        .zip_mut_with(&b.slice(s![..;-1, ..;-1]), |dst, &v| *dst = Complex::new(v, 0.0));

    fft_2d(&mut fa, planner, FftDirection::Forward);
    fft_2d(&mut fb, planner, FftDirection::Forward);
    fa.zip_mut_with(&fb, |x, &y| *x *= y);
    fft_2d(&mut fa, planner, FftDirection::Inverse);

    let scale = (full_rows * full_cols) as f64;
    let (r0, c0) = ((rows - 1) / 2, (cols - 1) / 2);
    Some(fa.slice(s![r0..r0 + rows, c0..c0 + cols]).mapv(|v| v.re / scale))
}

fn fft_2d(data: &mut Array2<Complex<f64>>, planner: &mut FftPlanner<f64>, direction: FftDirection) {
    let (rows, cols) = data.dim();
    let row_fft = planner.plan_fft(cols, direction);
    let col_fft = planner.plan_fft(rows, direction);
    let mut buffer = vec![Complex::new(0.0, 0.0); rows.max(cols)];

    for mut row in data.rows_mut() {
        let line = &mut buffer[..cols];
        line.iter_mut().zip(row.iter()).for_each(|(b, v)| *b = *v);
        row_fft.process(line);
        row.iter_mut().zip(line.iter()).for_each(|(v, b)| *v = *b);
    }
    for mut column in data.columns_mut() {
        let line = &mut buffer[..rows];
        line.iter_mut().zip(column.iter()).for_each(|(b, v)| *b = *v);
        col_fft.process(line);
        column.iter_mut().zip(line.iter()).for_each(|(v, b)| *v = *b);
    }
}

/// Slice 0 sees `(y, x)`, slice 1 `(z, x)` and slice 2 `(z, y)`. An axis
/// moves only when its two estimates agree within `err_thresh`. When no axis
/// qualifies, a single axis is moved by the smaller of two same-signed
/// estimates, the one with the smallest such magnitude.
fn combine_estimates(estimates: &[[i64; 2]; 3], err_thresh: i64) -> [i64; 3] {
    let pairs = [
        (estimates[2][0], estimates[1][0]),
        (estimates[0][0], estimates[2][1]),
        (estimates[1][1], estimates[0][1]),
    ];
    let mut shift = [0i64; 3];
    for (axis, &(accepted, other)) in pairs.iter().enumerate() {
        if (accepted - other).abs() <= err_thresh {
            shift[axis] = accepted;
        }
    }
    if shift.iter().map(|d| d.abs()).sum::<i64>() != 0 {
        return shift;
    }

    let candidates = pairs.map(|(a, b)| choose_shift(a, b));
    let smallest = candidates
        .iter()
        .enumerate()
        .filter(|(_, d)| **d != 0)
        .min_by_key(|(_, d)| d.abs());
    if let Some((axis, &d)) = smallest {
        shift[axis] = d;
    }
    shift
}

/// The smaller magnitude of two same-signed estimates, otherwise 0.
fn choose_shift(a: i64, b: i64) -> i64 {
    if a.signum() == b.signum() {
        a.signum() * a.abs().min(b.abs())
    } else {
        0
    }
}

/// Crop both volumes so that `reference[i]` and `correlate[i]` line up
/// after moving by `shift`.
fn shift_arrays<'a>(
    mut im0: ArrayView3<'a, f64>,
    mut im1: ArrayView3<'a, f64>,
    shift: [i64; 3],
) -> (ArrayView3<'a, f64>, ArrayView3<'a, f64>) {
    for (axis, &d) in shift.iter().enumerate() {
        let n = im0.len_of(Axis(axis));
        let k = d.unsigned_abs() as usize;
        if d > 0 {
            im0.slice_axis_inplace(Axis(axis), Slice::from(..n - k));
            im1.slice_axis_inplace(Axis(axis), Slice::from(k..));
        } else if d < 0 {
            im0.slice_axis_inplace(Axis(axis), Slice::from(k..));
            im1.slice_axis_inplace(Axis(axis), Slice::from(..n - k));
        }
    }
    (im0, im1)
}

fn shift_point(mut point: [usize; 3], shift: [i64; 3], im0: &ArrayView3<'_, f64>) -> [usize; 3] {
    for axis in 0..3 {
        let len = im0.len_of(Axis(axis));
        if shift[axis] < 0 {
            point[axis] = point[axis].saturating_sub(shift[axis].unsigned_abs() as usize);
        } else if shift[axis] > 0 && point[axis] >= len {
            point[axis] = len - 1;
        }
    }
    point
}
