//! Host-side stability detection for families whose packets carry no stable flag.

use heapless::Vec;

/// Identical consecutive readings required before a weight counts as stable.
pub const STABILITY_WINDOW: usize = 4;

#[derive(Debug, Default, Clone)]
pub struct StabilityEngine {
    weight_history: Vec<f32, STABILITY_WINDOW>,
}

impl StabilityEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one gram value and returns the stability verdict for it.
    ///
    /// Values are compared at 0.1 g resolution. A zero reading clears the history, so
    /// an empty platform never reports stable.
    pub fn update(&mut self, weight_grams: f32) -> bool {
        let rounded = (weight_grams * 10.0).round() / 10.0;

        if rounded == 0.0 {
            self.weight_history.clear();
            return false;
        }

        if self.weight_history.is_full() {
            self.weight_history.remove(0);
        }
        let _ = self.weight_history.push(rounded);

        self.weight_history.is_full()
            && self
                .weight_history
                .iter()
                .all(|w| *w == self.weight_history[0])
    }

    pub fn reset(&mut self) {
        self.weight_history.clear();
    }

    pub fn len(&self) -> usize {
        self.weight_history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weight_history.is_empty()
    }
}
