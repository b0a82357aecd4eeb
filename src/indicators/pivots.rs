use std::collections::VecDeque;

/// Confirmed swing highs and lows.
///
/// A bar is a pivot high when its high is the maximum of the window
/// `[i - k, i + k]`. That needs `k` later bars, so a pivot at bar `i` is
/// only reported once bar `i + k` has been seen.
#[derive(Debug, Clone)]
pub struct PivotDetector {
    window: usize,
    bars: VecDeque<(f64, f64)>,
    last_high: Option<f64>,
    last_low: Option<f64>,
}

impl PivotDetector {
    /// `window == 0` disables detection.
    pub fn new(window: usize) -> Self {
        Self {
            window,
            bars: VecDeque::with_capacity(2 * window + 1),
            last_high: None,
            last_low: None,
        }
    }

    /// Feeds one bar and returns the most recent confirmed (pivot_high, pivot_low).
    pub fn next(&mut self, high: f64, low: f64) -> (Option<f64>, Option<f64>) {
        if self.window == 0 {
            return (None, None);
        }
        let span = 2 * self.window + 1;
        self.bars.push_back((high, low));
        if self.bars.len() > span {
            self.bars.pop_front();
        }
        if self.bars.len() == span {
            let (mid_high, mid_low) = self.bars[self.window];
            if self.bars.iter().all(|(h, _)| *h <= mid_high) {
                self.last_high = Some(mid_high);
            }
            if self.bars.iter().all(|(_, l)| *l >= mid_low) {
                self.last_low = Some(mid_low);
            }
        }
        (self.last_high, self.last_low)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pivot_is_confirmed_only_after_lag() {
        let mut p = PivotDetector::new(2);
        let highs = [10.0, 11.0, 15.0, 12.0, 11.0, 10.0];
        let mut seen = Vec::new();
        for h in highs {
            seen.push(p.next(h, h - 1.0).0);
        }
        // peak at index 2, window 2 -> visible from index 4
        assert_eq!(seen[2], None);
        assert_eq!(seen[3], None);
        assert_eq!(seen[4], Some(15.0));
        assert_eq!(seen[5], Some(15.0));
    }

    #[test]
    fn detects_lows() {
        let mut p = PivotDetector::new(1);
        p.next(10.0, 9.0);
        p.next(9.0, 7.0);
        let (_, low) = p.next(10.0, 8.0);
        assert_eq!(low, Some(7.0));
    }

    #[test]
    fn zero_window_disables() {
        let mut p = PivotDetector::new(0);
        assert_eq!(p.next(1.0, 0.5), (None, None));
    }
}
