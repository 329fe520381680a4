//! Transmit-path audio enhancements
//!
//! A small DSP chain applied to captured frames before encoding: a noise
//! gate with hysteresis and a simple AGC with a hard limiter. Both are
//! optional; a disabled processor passes audio through untouched, and
//! running without either is never an error.
//!
//! Processing happens on normalized f32 copies of the i16 capture frames.

// =============================================================================
// Noise Gate
// =============================================================================

/// Noise gate tuning
#[derive(Debug, Clone)]
pub struct NoiseGateConfig {
    /// Opening threshold in dBFS
    pub threshold_open_db: f32,
    /// Closing threshold in dBFS (below the opening threshold: hysteresis
    /// avoids pumping on signals that hover near one threshold)
    pub threshold_close_db: f32,
    /// How fast the gate opens, in seconds
    pub attack_secs: f32,
    /// How fast the gate closes, in seconds
    pub release_secs: f32,
    /// Sample rate in Hz
    pub sample_rate: f32,
}

impl Default for NoiseGateConfig {
    fn default() -> Self {
        Self {
            threshold_open_db: -40.0,
            threshold_close_db: -45.0,
            attack_secs: 0.005,
            release_secs: 0.1,
            sample_rate: 48_000.0,
        }
    }
}

/// Suppresses signal below a threshold, with smoothed gain transitions
pub struct NoiseGate {
    open: bool,
    gain: f32,
    attack_coeff: f32,
    release_coeff: f32,
    threshold_open: f32,
    threshold_close: f32,
}

impl NoiseGate {
    /// Create a gate from tuning values
    pub fn new(config: NoiseGateConfig) -> Self {
        Self {
            open: false,
            gain: 0.0,
            attack_coeff: time_to_coeff(config.attack_secs, config.sample_rate),
            release_coeff: time_to_coeff(config.release_secs, config.sample_rate),
            threshold_open: db_to_linear(config.threshold_open_db),
            threshold_close: db_to_linear(config.threshold_close_db),
        }
    }

    /// Process one frame in place
    pub fn process(&mut self, samples: &mut [f32]) {
        for sample in samples.iter_mut() {
            let level = sample.abs();

            if self.open {
                if level < self.threshold_close {
                    self.open = false;
                }
            } else if level >= self.threshold_open {
                self.open = true;
            }

            let target = if self.open { 1.0 } else { 0.0 };
            let coeff = if target > self.gain {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.gain = coeff * self.gain + (1.0 - coeff) * target;

            *sample *= self.gain;
        }
    }
}

// =============================================================================
// Automatic Gain Control
// =============================================================================

/// AGC tuning
#[derive(Debug, Clone)]
pub struct AgcConfig {
    /// Target level (normalized; 0.1 ≈ -20 dBFS)
    pub target_level: f32,
    /// Upper gain bound
    pub max_gain: f32,
    /// Lower gain bound (keeps silence from being inflated)
    pub min_gain: f32,
    /// Per-sample smoothing when gain falls
    pub attack_coeff: f32,
    /// Per-sample smoothing when gain rises
    pub release_coeff: f32,
    /// Hard limit after amplification
    pub limiter_threshold: f32,
}

impl AgcConfig {
    /// Speech tuning at the given sample rate
    pub fn speech(sample_rate: f32) -> Self {
        Self {
            target_level: 0.1,
            max_gain: 20.0,
            min_gain: 0.1,
            attack_coeff: time_to_coeff(0.01, sample_rate),
            release_coeff: time_to_coeff(0.15, sample_rate),
            limiter_threshold: 0.95,
        }
    }
}

impl Default for AgcConfig {
    fn default() -> Self {
        Self::speech(48_000.0)
    }
}

/// Levels the capture signal toward a target, fast down and slow up
pub struct Agc {
    config: AgcConfig,
    gain: f32,
}

impl Agc {
    /// Create an AGC from tuning values
    pub fn new(config: AgcConfig) -> Self {
        Self { config, gain: 1.0 }
    }

    /// Process one frame in place
    pub fn process(&mut self, samples: &mut [f32]) {
        for sample in samples.iter_mut() {
            let level = sample.abs();

            let desired = if level > 1e-6 {
                (self.config.target_level / level)
                    .clamp(self.config.min_gain, self.config.max_gain)
            } else {
                self.config.max_gain
            };

            let coeff = if desired < self.gain {
                self.config.attack_coeff
            } else {
                self.config.release_coeff
            };
            self.gain = coeff * self.gain + (1.0 - coeff) * desired;

            *sample = (*sample * self.gain).clamp(
                -self.config.limiter_threshold,
                self.config.limiter_threshold,
            );
        }
    }
}

// =============================================================================
// Capture Chain
// =============================================================================

/// The enhancement chain applied to each captured frame before encoding
pub struct CaptureChain {
    gate: Option<NoiseGate>,
    agc: Option<Agc>,
    scratch: Vec<f32>,
}

impl CaptureChain {
    /// Build a chain; either stage may be absent
    pub fn new(noise_gate: bool, agc: bool) -> Self {
        Self {
            gate: noise_gate.then(|| NoiseGate::new(NoiseGateConfig::default())),
            agc: agc.then(|| Agc::new(AgcConfig::default())),
            scratch: Vec::new(),
        }
    }

    /// True if no enhancement is enabled
    pub fn is_passthrough(&self) -> bool {
        self.gate.is_none() && self.agc.is_none()
    }

    /// Process one capture frame in place
    pub fn process(&mut self, frame: &mut [i16]) {
        if self.is_passthrough() {
            return;
        }

        self.scratch.clear();
        self.scratch
            .extend(frame.iter().map(|&s| s as f32 / 32768.0));

        if let Some(gate) = self.gate.as_mut() {
            gate.process(&mut self.scratch);
        }
        if let Some(agc) = self.agc.as_mut() {
            agc.process(&mut self.scratch);
        }

        for (out, sample) in frame.iter_mut().zip(self.scratch.iter()) {
            *out = (sample * 32767.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn time_to_coeff(time_secs: f32, sample_rate: f32) -> f32 {
    if time_secs <= 0.0 {
        return 0.0;
    }
    (-1.0 / (time_secs * sample_rate)).exp()
}

fn db_to_linear(db: f32) -> f32 {
    10.0f32.powf(db / 20.0)
}

// =============================================================================
// Tests
// =============================================================================
