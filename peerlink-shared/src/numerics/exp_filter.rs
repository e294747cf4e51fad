/// Exponential smoothing filter, used to smooth bandwidth or packet-loss
/// estimates.
#[derive(Debug, Clone)]
pub struct ExpFilter {
    filtered_value_cap: Option<f32>,
    alpha: f32,
    filtered_value: Option<f32>,
}

impl ExpFilter {
    pub fn new(alpha: f32) -> Self {
        ExpFilter {
            filtered_value_cap: None,
            alpha,
            filtered_value: None,
        }
    }

    pub fn with_cap(alpha: f32, filtered_value_cap: f32) -> Self {
        ExpFilter {
            filtered_value_cap: Some(filtered_value_cap),
            alpha,
            filtered_value: None,
        }
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    pub fn set_alpha(&mut self, alpha: f32) {
        self.alpha = alpha;
    }

    /// Current filtered value, `None` until the first sample is applied.
    pub fn filtered(&self) -> Option<f32> {
        self.filtered_value
    }

    /// Resets the filter to its initial state.
    pub fn reset(&mut self, alpha: f32) {
        self.alpha = alpha;
        self.filtered_value = None;
    }

    /// Applies the filter with the given exponent on the provided sample:
    /// `y(k) = min(alpha^exp * y(k-1) + (1 - alpha^exp) * sample, cap)`.
    pub fn apply(&mut self, exp: f32, sample: f32) -> f32 {
        let value = match self.filtered_value {
            None => sample,
            Some(prev) if exp == 1.0 => self.alpha * prev + (1.0 - self.alpha) * sample,
            Some(prev) => {
                let alpha = self.alpha.powf(exp);
                alpha * prev + (1.0 - alpha) * sample
            }
        };
        let value = match self.filtered_value_cap {
            Some(cap) if value > cap => cap,
            _ => value,
        };
        self.filtered_value = Some(value);
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_passes_through() {
        let mut filter = ExpFilter::new(0.9);
        assert_eq!(filter.filtered(), None);
        assert_eq!(filter.apply(1.0, 10.0), 10.0);
        assert_eq!(filter.filtered(), Some(10.0));
    }

    #[test]
    fn test_unit_exponent() {
        let mut filter = ExpFilter::new(0.9);
        filter.apply(1.0, 10.0);
        let value = filter.apply(1.0, 20.0);
        assert!((value - (0.9 * 10.0 + 0.1 * 20.0)).abs() < f32::EPSILON);
    }

    #[test]
    fn test_fractional_exponent() {
        let mut filter = ExpFilter::new(0.9);
        filter.apply(1.0, 10.0);
        let exp = 2.5f32;
        let value = filter.apply(exp, 30.0);
        let alpha = 0.9f32.powf(exp);
        let expected = alpha * 10.0 + (1.0 - alpha) * 30.0;
        assert!((value - expected).abs() < 1e-5);
    }

    #[test]
    fn test_cap_clamps() {
        let mut filter = ExpFilter::with_cap(0.5, 15.0);
        filter.apply(1.0, 10.0);
        let value = filter.apply(1.0, 100.0);
        assert_eq!(value, 15.0);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut filter = ExpFilter::new(0.9);
        filter.apply(1.0, 10.0);
        filter.reset(0.8);
        assert_eq!(filter.filtered(), None);
        assert_eq!(filter.alpha(), 0.8);
        assert_eq!(filter.apply(1.0, 42.0), 42.0);
    }
}
