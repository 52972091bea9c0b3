use rand::Rng;
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SineWave {
    pub amplitude: f64,
    pub frequency: f64,
    pub phase: f64,
}

impl SineWave {
    pub fn generate(&self, t: f64) -> f64 {
        self.amplitude * (2.0 * PI * self.frequency * t + self.phase).sin()
    }
}

/// Sum of `waves` at `t` seconds.
pub fn simulate_signal(waves: &[SineWave], t: f64) -> f64 {
    waves.iter().map(|wave| wave.generate(t)).sum()
}

/// Synthetic accelerometer reading: a few harmonics plus uniform noise.
#[derive(Debug, Clone)]
pub struct Signal {
    waves: Vec<SineWave>,
    noise: f64,
}

impl Signal {
    pub fn new(waves: Vec<SineWave>, noise: f64) -> Self {
        Self { waves, noise }
    }

    pub fn accelerometer() -> Self {
        Self::new(
            vec![
                SineWave { amplitude: 1.0, frequency: 5.0, phase: 0.0 },
                SineWave { amplitude: 0.6, frequency: 2.5, phase: 0.0 },
                SineWave { amplitude: 0.3, frequency: 60.0, phase: 0.3 },
                SineWave { amplitude: 0.16, frequency: 120.0, phase: 0.3 },
            ],
            0.02,
        )
    }

    pub fn sample(&self, t: f64) -> f64 {
        let clean = simulate_signal(&self.waves, t);
        if self.noise > 0.0 {
            clean + rand::thread_rng().gen_range(-self.noise..self.noise)
        } else {
            clean
        }
    }
}
