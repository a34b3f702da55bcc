use crate::types::FeatureWindow;

/// First mel frame of the trailing zero padding, or `None` when the window
/// does not end in padding.
///
/// Padding is detected as a run of feature columns identical to an all-zero
/// last column. A window made entirely of padding starts padding at frame 0.
pub(crate) fn find_start_padding(features: &FeatureWindow) -> Option<usize> {
    if !features.is_well_formed() || features.frames == 0 {
        return None;
    }
    let last = features.frames - 1;
    let last_is_zero = (0..features.n_mels).all(|mel| features.value(mel, last) == 0.0);
    if !last_is_zero {
        return None;
    }
    let mut candidate = last;
    while candidate > 0 {
        candidate -= 1;
        if candidate == 0 {
            break;
        }
        let same = (0..features.n_mels).all(|mel| features.value(mel, candidate) == 0.0);
        if !same {
            return Some(candidate + 1);
        }
    }
    Some(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(columns: &[[f32; 2]]) -> FeatureWindow {
        let frames = columns.len();
        let mut values = vec![0.0; 2 * frames];
        for (f, column) in columns.iter().enumerate() {
            values[f] = column[0];
            values[frames + f] = column[1];
        }
        FeatureWindow {
            n_mels: 2,
            frames,
            values,
        }
    }

    #[test]
    fn no_padding_when_last_column_has_signal() {
        let features = window(&[[0.3, 0.1], [0.0, 0.0], [0.2, 0.0]]);
        assert_eq!(find_start_padding(&features), None);
    }

    #[test]
    fn padding_starts_after_last_non_zero_column() {
        let features = window(&[[0.3, 0.1], [0.5, 0.2], [0.0, 0.0], [0.0, 0.0], [0.0, 0.0]]);
        assert_eq!(find_start_padding(&features), Some(2));
    }

    #[test]
    fn all_padding_starts_at_zero() {
        let features = window(&[[0.0, 0.0], [0.0, 0.0], [0.0, 0.0]]);
        assert_eq!(find_start_padding(&features), Some(0));
    }

    #[test]
    fn malformed_features_are_ignored() {
        let features = FeatureWindow {
            n_mels: 2,
            frames: 3,
            values: vec![0.0; 5],
        };
        assert_eq!(find_start_padding(&features), None);
    }
}
