/// Converts the device's cumulative step counter into steps taken this session.
///
/// The counter usually runs since boot, so the first reading of a session is
/// kept as the baseline. A reading below the baseline (counter reset) reports
/// zero and leaves the baseline where it is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepBaseline {
    // Option, not a zero sentinel: a first reading of 0 is a real baseline
    raw: Option<u64>,
}

impl StepBaseline {
    pub fn unset() -> Self {
        Self { raw: None }
    }

    pub fn value(&self) -> Option<u64> {
        self.raw
    }

    pub fn is_set(&self) -> bool {
        self.raw.is_some()
    }

    /// Session-relative count for `raw_count`. Captures the baseline on first use.
    pub fn normalize(&mut self, raw_count: u64) -> u64 {
        match self.raw {
            None => {
                self.raw = Some(raw_count);
                0
            }
            Some(baseline) => raw_count.saturating_sub(baseline),
        }
    }
}
