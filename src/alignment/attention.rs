use crate::config::HeadSelection;
use crate::error::AlignmentError;
use crate::types::StepAttention;

/// Dense `tokens x frames` matrix used both for reduced attention and DTW cost.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl AttentionMatrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, AlignmentError> {
        let cols = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|row| row.len() != cols) {
            return Err(AlignmentError::invalid_input(
                "attention matrix rows have different lengths",
            ));
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data: rows.concat(),
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.data[row * self.cols + col] = value;
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub(crate) fn row_mut(&mut self, row: usize) -> &mut [f64] {
        &mut self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn min_value(&self) -> f64 {
        self.data.iter().copied().fold(f64::INFINITY, f64::min)
    }
}

pub(crate) struct AttentionParams<'a> {
    pub head_selection: &'a HeadSelection,
    pub medfilt_width: usize,
    pub qk_scale: f64,
}

pub(crate) fn select_heads(
    selection: &HeadSelection,
    layers: usize,
    heads: usize,
) -> Result<Vec<(usize, usize)>, AlignmentError> {
    let selected: Vec<(usize, usize)> = match selection {
        HeadSelection::All => (0..layers)
            .flat_map(|layer| (0..heads).map(move |head| (layer, head)))
            .collect(),
        HeadSelection::TopLayers(n) => (layers.saturating_sub(*n)..layers)
            .flat_map(|layer| (0..heads).map(move |head| (layer, head)))
            .collect(),
        HeadSelection::Mask(mask) => {
            if mask.num_layers != layers || mask.num_heads != heads {
                return Err(AlignmentError::inconsistency(
                    "alignment heads",
                    format!(
                        "mask is {}x{} but decoder reports {layers}x{heads}",
                        mask.num_layers, mask.num_heads
                    ),
                ));
            }
            mask.heads.clone()
        }
    };
    if selected.is_empty() {
        return Err(AlignmentError::inconsistency(
            "alignment heads",
            "no attention head selected",
        ));
    }
    Ok(selected)
}

/// Reduce per-step attention rows over `[start, end)` into a DTW cost matrix.
///
/// Each selected head is median-filtered along time, scaled, soft-maxed per
/// token, then averaged. Frame columns are L2-normalized across tokens and the
/// result is negated, so stronger attention means lower cost.
pub(crate) fn attention_cost_matrix(
    rows: &[&StepAttention],
    start: usize,
    end: usize,
    params: &AttentionParams<'_>,
) -> Result<AttentionMatrix, AlignmentError> {
    let Some(first) = rows.first() else {
        return Err(AlignmentError::inconsistency(
            "attention shape",
            "no attention rows for chunk",
        ));
    };
    let (layers, heads, frames) = (first.layers, first.heads, first.frames);
    if let Some(bad) = rows
        .iter()
        .find(|row| row.layers != layers || row.heads != heads || row.frames != frames)
    {
        return Err(AlignmentError::inconsistency(
            "attention shape",
            format!(
                "step reports {}x{}x{} after {layers}x{heads}x{frames}",
                bad.layers, bad.heads, bad.frames
            ),
        ));
    }
    for row in rows {
        row.check_shape()?;
    }
    if end > frames || start >= end {
        return Err(AlignmentError::inconsistency(
            "attention shape",
            format!("frame window [{start}, {end}) outside {frames} attention frames"),
        ));
    }

    let selected = select_heads(params.head_selection, layers, heads)?;
    let width = end - start;
    let mut reduced = AttentionMatrix::zeros(rows.len(), width);
    let mut buffer = vec![0.0f64; width];

    for &(layer, head) in &selected {
        for (t, row) in rows.iter().enumerate() {
            for (dst, &w) in buffer.iter_mut().zip(&row.head(layer, head)[start..end]) {
                *dst = f64::from(w);
            }
            let mut filtered = median_filter_reflect(&buffer, params.medfilt_width);
            for v in &mut filtered {
                *v *= params.qk_scale;
            }
            softmax_in_place(&mut filtered);
            for (acc, v) in reduced.row_mut(t).iter_mut().zip(&filtered) {
                *acc += v;
            }
        }
    }

    let count = selected.len() as f64;
    for t in 0..reduced.rows() {
        for v in reduced.row_mut(t) {
            *v /= count;
        }
    }

    for f in 0..width {
        let norm = (0..reduced.rows())
            .map(|t| reduced.get(t, f).powi(2))
            .sum::<f64>()
            .sqrt();
        for t in 0..reduced.rows() {
            let v = reduced.get(t, f);
            let normalized = if norm > 0.0 { v / norm } else { 0.0 };
            reduced.set(t, f, -normalized);
        }
    }

    tracing::debug!(
        tokens = rows.len(),
        frames = width,
        heads = selected.len(),
        "attention: reduced cost matrix"
    );
    Ok(reduced)
}

/// Median filter with mirror padding that repeats the edge sample
/// (`d c b a | a b c d | d c b a`).
pub(crate) fn median_filter_reflect(values: &[f64], width: usize) -> Vec<f64> {
    let n = values.len();
    if n == 0 || width <= 1 {
        return values.to_vec();
    }
    let half = (width / 2) as isize;
    let mut window = Vec::with_capacity(width);
    (0..n)
        .map(|i| {
            window.clear();
            for k in -half..=half {
                window.push(values[reflect_index(i as isize + k, n)]);
            }
            window.sort_by(f64::total_cmp);
            window[window.len() / 2]
        })
        .collect()
}

fn reflect_index(i: isize, n: usize) -> usize {
    let period = 2 * n as isize;
    let k = i.rem_euclid(period);
    if k >= n as isize {
        (period - 1 - k) as usize
    } else {
        k as usize
    }
}

pub(crate) fn softmax_in_place(values: &mut [f64]) {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return;
    }
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in values.iter_mut() {
            *v /= sum;
        }
    }
}
