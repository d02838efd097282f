//! Logic and analog test patterns.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use acq_core::AcqError;

use crate::rng::DemoRng;

/// Samples in one analog period; the generated buffer holds exactly one.
pub const ANALOG_SAMPLES_PER_PERIOD: usize = 20;

/// Default peak amplitude of the analog patterns, in volts.
pub const DEFAULT_AMPLITUDE: f64 = 25.0;

/// Spells "sigrok" across 8 channels using zeros on a background of ones
/// when displayed bit by bit.
const PATTERN_SIGROK: [u8; 64] = [
    0x4c, 0x92, 0x92, 0x92, 0x64, 0x00, 0x00, 0x00, //
    0x82, 0xfe, 0xfe, 0x82, 0x00, 0x00, 0x00, 0x00, //
    0x7c, 0x82, 0x82, 0x92, 0x74, 0x00, 0x00, 0x00, //
    0xfe, 0x12, 0x12, 0x32, 0xcc, 0x00, 0x00, 0x00, //
    0x7c, 0x82, 0x82, 0x82, 0x7c, 0x00, 0x00, 0x00, //
    0xfe, 0x10, 0x28, 0x44, 0x82, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0xbe, 0xbe, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogicPattern {
    /// Repeats every 8 channels, shifted right in time by one bit.
    #[default]
    Sigrok,
    Random,
    /// Every byte of a sample holds the sample counter.
    Incremental,
    AllLow,
    AllHigh,
}

impl LogicPattern {
    pub const ALL: [LogicPattern; 5] = [
        LogicPattern::Sigrok,
        LogicPattern::Random,
        LogicPattern::Incremental,
        LogicPattern::AllLow,
        LogicPattern::AllHigh,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LogicPattern::Sigrok => "sigrok",
            LogicPattern::Random => "random",
            LogicPattern::Incremental => "incremental",
            LogicPattern::AllLow => "all-low",
            LogicPattern::AllHigh => "all-high",
        }
    }

    pub fn names() -> Vec<String> {
        Self::ALL.iter().map(|p| p.as_str().to_string()).collect()
    }
}

impl FromStr for LogicPattern {
    type Err = AcqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| AcqError::arg(format!("unknown logic pattern '{}'", s)))
    }
}

impl fmt::Display for LogicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalogPattern {
    Square,
    Sine,
    Triangle,
    Sawtooth,
}

impl AnalogPattern {
    pub const ALL: [AnalogPattern; 4] = [
        AnalogPattern::Square,
        AnalogPattern::Sine,
        AnalogPattern::Triangle,
        AnalogPattern::Sawtooth,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AnalogPattern::Square => "square",
            AnalogPattern::Sine => "sine",
            AnalogPattern::Triangle => "triangle",
            AnalogPattern::Sawtooth => "sawtooth",
        }
    }

    pub fn names() -> Vec<String> {
        Self::ALL.iter().map(|p| p.as_str().to_string()).collect()
    }

    /// Default pattern of the n-th analog channel: the list, cycled.
    pub fn nth_default(n: usize) -> Self {
        Self::ALL[n % Self::ALL.len()]
    }

    /// One period of the waveform at peak `amplitude`.
    pub fn period(self, amplitude: f64) -> Vec<f32> {
        let n = ANALOG_SAMPLES_PER_PERIOD;
        (0..n)
            .map(|i| {
                let x = i as f64 / n as f64;
                let v = match self {
                    // Flips every 5 samples, starting low.
                    AnalogPattern::Square => {
                        if (i / 5) % 2 == 0 {
                            -amplitude
                        } else {
                            amplitude
                        }
                    }
                    AnalogPattern::Sine => amplitude * (2.0 * PI * x).sin(),
                    AnalogPattern::Triangle => (2.0 * amplitude / PI) * (2.0 * PI * x).sin().asin(),
                    AnalogPattern::Sawtooth => 2.0 * amplitude * (x - (0.5 + x).floor()),
                };
                v as f32
            })
            .collect()
    }
}

impl FromStr for AnalogPattern {
    type Err = AcqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| AcqError::arg(format!("unknown analog pattern '{}'", s)))
    }
}

impl fmt::Display for AnalogPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stateful logic sample generator.
#[derive(Debug, Clone)]
pub struct LogicGenerator {
    pub pattern: LogicPattern,
    unit_size: usize,
    step: u64,
}

impl LogicGenerator {
    pub fn new(pattern: LogicPattern, unit_size: usize) -> Self {
        Self {
            pattern,
            unit_size: unit_size.max(1),
            step: 0,
        }
    }

    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Fill `buf` with whole samples. A trailing partial sample is left
    /// untouched.
    pub fn fill(&mut self, buf: &mut [u8], rng: &mut DemoRng) {
        let unit = self.unit_size;
        match self.pattern {
            LogicPattern::Sigrok => {
                for sample in buf.chunks_exact_mut(unit) {
                    for (j, byte) in sample.iter_mut().enumerate() {
                        let idx = (self.step as usize + j) % PATTERN_SIGROK.len();
                        *byte = !(PATTERN_SIGROK[idx] >> 1);
                    }
                    self.step = self.step.wrapping_add(1);
                }
            }
            LogicPattern::Random => rng.fill_bytes(buf),
            LogicPattern::Incremental => {
                for sample in buf.chunks_exact_mut(unit) {
                    sample.fill(self.step as u8);
                    self.step = self.step.wrapping_add(1);
                }
            }
            LogicPattern::AllLow => buf.fill(0x00),
            LogicPattern::AllHigh => buf.fill(0xff),
        }
    }
}
