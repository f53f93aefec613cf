use std::f32::consts::FRAC_PI_2;

/// Upper bound on the fade length at each edge of a unit.
pub const MAX_FADE_SAMPLES: usize = 200;

/// Fade length for a unit of `total` samples: 200 or 1/8 of the unit, whichever is smaller.
pub fn fade_len(total: usize) -> usize {
    MAX_FADE_SAMPLES.min(total / 8)
}

/// Apply a half-sine fade-in and fade-out to the edges of `samples`.
///
/// Consecutive units are not phase aligned; ramping both edges keeps the
/// seam from clicking.
pub fn apply_edge_fades(samples: &mut [f32]) {
    let total = samples.len();
    let fade = fade_len(total);
    if fade == 0 {
        return;
    }

    for i in 0..fade {
        let factor = ((i as f32 / fade as f32) * FRAC_PI_2).sin();
        samples[i] *= factor;
        samples[total - 1 - i] *= factor;
    }
}

/// Scale `samples` by `gain`, clipping at full scale.
pub fn apply_gain(samples: &mut [f32], gain: f32) {
    if gain == 1.0 {
        return;
    }
    for sample in samples.iter_mut() {
        *sample = (*sample * gain).clamp(-1.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fade_len_is_capped() {
        assert_eq!(fade_len(6000), 200);
        assert_eq!(fade_len(800), 100);
        assert_eq!(fade_len(7), 0);
    }

    #[test]
    fn edges_ramp_and_middle_is_untouched() {
        let mut samples = vec![1.0f32; 4000];
        apply_edge_fades(&mut samples);

        assert_eq!(samples[0], 0.0);
        assert_eq!(samples[3999], 0.0);
        assert!(samples[100] > samples[50]);
        assert!(samples[3899] > samples[3949]);
        assert!(samples[200..3800].iter().all(|&s| s == 1.0));
    }

    #[test]
    fn gain_scales_and_clips() {
        let mut samples = vec![0.2f32, -0.4, 0.9, -0.8];
        apply_gain(&mut samples, 1.5);
        assert!((samples[0] - 0.3).abs() < 1e-6);
        assert!((samples[1] + 0.6).abs() < 1e-6);
        assert_eq!(samples[2], 1.0);
        assert_eq!(samples[3], -1.0);
    }

    #[test]
    fn tiny_units_are_left_alone() {
        let mut samples = vec![0.5f32; 5];
        apply_edge_fades(&mut samples);
        assert!(samples.iter().all(|&s| s == 0.5));
    }
}
