//! Device-to-local timestamp mapping

/// Maps device seconds onto the local timeline.
///
/// The first sample anchors the offset (`arrival - device`). Later samples
/// pull it towards their observed offset by exponential smoothing, so
/// network jitter is averaged out while slow drift is followed. Output never
/// decreases.
#[derive(Debug, Clone)]
pub struct ClockReconciler {
    smoothing: f64,
    offset: Option<f64>,
    last_local: Option<f64>,
}

impl ClockReconciler {
    /// `smoothing` is the weight of each new observation, in (0, 1].
    pub fn new(smoothing: f64) -> Self {
        Self { smoothing: smoothing.clamp(f64::EPSILON, 1.0), offset: None, last_local: None }
    }

    /// Local time for a sample stamped `device` that arrived at `arrival`.
    pub fn reconcile(&mut self, device: f64, arrival: f64) -> f64 {
        let observed = arrival - device;
        let offset = match self.offset {
            None => observed,
            Some(offset) => offset + self.smoothing * (observed - offset),
        };
        self.offset = Some(offset);
        self.clamp(device + offset)
    }

    /// Discard the smoothed offset and anchor on this sample. Used when the
    /// device clock jumps; the output still never decreases.
    pub fn reanchor(&mut self, device: f64, arrival: f64) -> f64 {
        self.offset = Some(arrival - device);
        self.clamp(arrival)
    }

    pub fn set_smoothing(&mut self, smoothing: f64) {
        self.smoothing = smoothing.clamp(f64::EPSILON, 1.0);
    }

    pub fn offset(&self) -> Option<f64> {
        self.offset
    }

    pub fn last_local(&self) -> Option<f64> {
        self.last_local
    }

    fn clamp(&mut self, local: f64) -> f64 {
        let local = match self.last_local {
            Some(last) if local < last => last,
            _ => local,
        };
        self.last_local = Some(local);
        local
    }
}
