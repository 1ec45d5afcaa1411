//! Progress reporting capability threaded through every stage

/// Receives progress checkpoints from the worker running a provisioning
/// stage. Callbacks fire from that worker, never concurrently.
pub(crate) trait ProgressSink {
    /// Reports overall run progress and a human-readable status line.
    fn report(&mut self, percent: u8, status: &str);
}

impl<F: FnMut(u8, &str)> ProgressSink for F {
    fn report(&mut self, percent: u8, status: &str) {
        self(percent, status);
    }
}

/// A sink that drops everything, for stages run standalone.
#[derive(Debug)]
pub(crate) struct Discard;

impl ProgressSink for Discard {
    fn report(&mut self, _percent: u8, _status: &str) {}
}

/// One stage's slice of the 0-100 run percentage
#[derive(Clone, Copy, Debug)]
pub(crate) struct Band {
    lo: u8,
    hi: u8,
}

impl Band {
    pub(crate) const VALIDATE: Band = Band { lo: 0, hi: 10 };
    pub(crate) const FORMAT: Band = Band { lo: 10, hi: 20 };
    pub(crate) const STAGING: Band = Band { lo: 20, hi: 25 };
    pub(crate) const EXTRACT: Band = Band { lo: 25, hi: 65 };
    pub(crate) const COPY: Band = Band { lo: 65, hi: 90 };
    pub(crate) const FINALIZE: Band = Band { lo: 90, hi: 95 };
    pub(crate) const CLEANUP: Band = Band { lo: 95, hi: 100 };

    /// Percentage at the start of the band.
    pub(crate) fn start(self) -> u8 {
        self.lo
    }

    /// Maps `num / den` linearly into the band. A zero denominator or an
    /// overshooting numerator clamps to the band's end.
    pub(crate) fn at(self, num: u64, den: u64) -> u8 {
        if den == 0 || num >= den {
            return self.hi;
        }

        let span = u64::from(self.hi - self.lo);
        let offset = u8::try_from(span * num / den).unwrap_or(0);

        self.lo + offset
    }
}
