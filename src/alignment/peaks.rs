//! Local-maximum detection on a 1-D curve with prominence and width filters.

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Peak {
    pub index: usize,
    pub prominence: f64,
    pub left_base: usize,
    pub right_base: usize,
    pub width: f64,
    /// Interpolated position where the curve crosses half prominence on the left.
    pub left_ip: f64,
    pub right_ip: f64,
}

/// Peaks whose prominence is at least `min_prominence` and whose width at
/// half prominence is at least `min_width`, in index order.
pub(crate) fn find_peaks(x: &[f64], min_width: f64, min_prominence: f64) -> Vec<Peak> {
    local_maxima(x)
        .into_iter()
        .filter_map(|index| {
            let (prominence, left_base, right_base) = prominence(x, index);
            if prominence < min_prominence {
                return None;
            }
            let (width, left_ip, right_ip) =
                width_at_half_prominence(x, index, prominence, left_base, right_base);
            (width >= min_width).then_some(Peak {
                index,
                prominence,
                left_base,
                right_base,
                width,
                left_ip,
                right_ip,
            })
        })
        .collect()
}

/// Strict local maxima. Flat tops report their middle sample, rounded down.
fn local_maxima(x: &[f64]) -> Vec<usize> {
    let mut peaks = Vec::new();
    if x.len() < 3 {
        return peaks;
    }
    let last = x.len() - 1;
    let mut i = 1;
    while i < last {
        if x[i - 1] < x[i] {
            let mut ahead = i + 1;
            while ahead < last && x[ahead] == x[i] {
                ahead += 1;
            }
            if x[ahead] < x[i] {
                peaks.push((i + ahead - 1) / 2);
                i = ahead;
            }
        }
        i += 1;
    }
    peaks
}

fn prominence(x: &[f64], peak: usize) -> (f64, usize, usize) {
    let height = x[peak];

    let mut left_base = peak;
    let mut left_min = height;
    let mut i = peak;
    loop {
        if x[i] > height {
            break;
        }
        if x[i] < left_min {
            left_min = x[i];
            left_base = i;
        }
        if i == 0 {
            break;
        }
        i -= 1;
    }

    let mut right_base = peak;
    let mut right_min = height;
    for (j, &v) in x.iter().enumerate().skip(peak) {
        if v > height {
            break;
        }
        if v < right_min {
            right_min = v;
            right_base = j;
        }
    }

    (height - left_min.max(right_min), left_base, right_base)
}

fn width_at_half_prominence(
    x: &[f64],
    peak: usize,
    prominence: f64,
    left_base: usize,
    right_base: usize,
) -> (f64, f64, f64) {
    let height = x[peak] - prominence * 0.5;

    let mut i = peak;
    while left_base < i && height < x[i] {
        i -= 1;
    }
    let mut left_ip = i as f64;
    if x[i] < height {
        left_ip += (height - x[i]) / (x[i + 1] - x[i]);
    }

    let mut i = peak;
    while i < right_base && height < x[i] {
        i += 1;
    }
    let mut right_ip = i as f64;
    if x[i] < height {
        right_ip -= (height - x[i]) / (x[i - 1] - x[i]);
    }

    (right_ip - left_ip, left_ip, right_ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_two_separated_bumps() {
        let x = [0.0, 0.1, 0.5, 0.5, 0.5, 0.1, 0.0, 0.0, 0.2, 0.6, 0.6, 0.6, 0.2, 0.0];
        let peaks = find_peaks(&x, 3.0, 0.02);
        assert_eq!(peaks.len(), 2);
        assert_eq!(peaks[0].index, 3);
        assert_eq!(peaks[1].index, 10);
        assert!((peaks[1].prominence - 0.6).abs() < 1e-12);
        // Half height 0.3 is crossed halfway between 0.2 (index 8) and 0.6 (index 9) on the left.
        assert!((peaks[1].left_ip - 8.25).abs() < 1e-12);
        assert!((peaks[1].right_ip - 11.75).abs() < 1e-12);
        assert!((peaks[1].width - 3.5).abs() < 1e-12);
    }

    #[test]
    fn narrow_spikes_are_rejected() {
        let x = [0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0];
        assert!(find_peaks(&x, 3.0, 0.02).is_empty());
        assert_eq!(find_peaks(&x, 0.5, 0.02).len(), 2);
    }

    #[test]
    fn shallow_bumps_are_rejected() {
        let x = [0.50, 0.51, 0.51, 0.51, 0.51, 0.50];
        assert!(find_peaks(&x, 1.0, 0.02).is_empty());
    }

    #[test]
    fn prominence_uses_higher_of_the_two_bases() {
        let x = [0.0, 1.0, 0.4, 0.8, 0.9];
        let (prom, left_base, right_base) = prominence(&x, 1);
        assert!((prom - 0.6).abs() < 1e-12);
        assert_eq!(left_base, 0);
        assert_eq!(right_base, 2);
    }

    #[test]
    fn edges_are_never_peaks() {
        assert!(local_maxima(&[1.0, 0.0, 1.0]).is_empty());
        assert!(local_maxima(&[0.0, 1.0]).is_empty());
    }
}
