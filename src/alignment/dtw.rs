use super::attention::AttentionMatrix;

/// Allowed predecessor cells when accumulating DTW cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPattern {
    /// Diagonal, horizontal and vertical steps. Two tokens may start on the same frame.
    Symmetric1,
    /// Diagonal and horizontal steps only. Every token owns at least one frame.
    NoSharedFrames,
}

/// Monotonic token/frame correspondence produced by DTW.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignmentPath {
    pub token_indices: Vec<usize>,
    pub frame_indices: Vec<usize>,
}

impl AlignmentPath {
    /// Frame where each token first appears on the path, followed by the
    /// frame just past the end of the path.
    pub fn token_boundaries(&self) -> Vec<usize> {
        let mut boundaries = Vec::new();
        let mut previous = None;
        for (&token, &frame) in self.token_indices.iter().zip(&self.frame_indices) {
            if previous != Some(token) {
                boundaries.push(frame);
                previous = Some(token);
            }
        }
        if let Some(&last) = self.frame_indices.last() {
            boundaries.push(last + 1);
        }
        boundaries
    }
}

const STEP_NONE: u8 = 0;
const STEP_DIAGONAL: u8 = 1;
const STEP_HORIZONTAL: u8 = 2;
const STEP_VERTICAL: u8 = 3;

/// Minimum-cost monotonic path from `(0, 0)` to the bottom-right cell.
///
/// Returns `None` when no path exists under `pattern`, for example more
/// tokens than frames with [`StepPattern::NoSharedFrames`].
pub fn dtw(cost: &AttentionMatrix, pattern: StepPattern) -> Option<AlignmentPath> {
    let n = cost.rows();
    let m = cost.cols();
    if n == 0 || m == 0 {
        return None;
    }

    let mut acc = vec![f64::INFINITY; n * m];
    let mut bp = vec![STEP_NONE; n * m];
    acc[0] = cost.get(0, 0);

    for i in 0..n {
        for j in 0..m {
            if i == 0 && j == 0 {
                continue;
            }
            let (best, step) = best_predecessor(&acc, i, j, m, pattern);
            if best.is_finite() {
                acc[i * m + j] = best + cost.get(i, j);
                bp[i * m + j] = step;
            }
        }
    }

    if !acc[n * m - 1].is_finite() {
        return None;
    }

    let (mut i, mut j) = (n - 1, m - 1);
    let mut token_indices = vec![i];
    let mut frame_indices = vec![j];
    while (i, j) != (0, 0) {
        match bp[i * m + j] {
            STEP_DIAGONAL => {
                i -= 1;
                j -= 1;
            }
            STEP_HORIZONTAL => j -= 1,
            STEP_VERTICAL => i -= 1,
            _ => return None,
        }
        token_indices.push(i);
        frame_indices.push(j);
    }
    token_indices.reverse();
    frame_indices.reverse();
    Some(AlignmentPath {
        token_indices,
        frame_indices,
    })
}

/// Ties resolve in candidate order: diagonal, horizontal, vertical.
#[inline(always)]
fn best_predecessor(acc: &[f64], i: usize, j: usize, m: usize, pattern: StepPattern) -> (f64, u8) {
    let mut best = f64::INFINITY;
    let mut step = STEP_NONE;

    if i >= 1 && j >= 1 {
        let cand = acc[(i - 1) * m + j - 1];
        if cand < best {
            best = cand;
            step = STEP_DIAGONAL;
        }
    }

    if j >= 1 {
        let cand = acc[i * m + j - 1];
        if cand < best {
            best = cand;
            step = STEP_HORIZONTAL;
        }
    }

    if pattern == StepPattern::Symmetric1 && i >= 1 {
        let cand = acc[(i - 1) * m + j];
        if cand < best {
            best = cand;
            step = STEP_VERTICAL;
        }
    }

    (best, step)
}
