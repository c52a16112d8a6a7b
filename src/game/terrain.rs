//! Island height-field generation
//!
//! The island is a polyline of `segments + 1` samples spanning
//! `[-half_span, +half_span]`. Screen coordinates are used throughout: y grows
//! downward, so "above the waterline" means `y < waterline`.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// One sine component of the surface noise
#[derive(Debug, Clone, Copy)]
pub struct SineOctave {
    pub amplitude: f32,
    /// Angular frequency in radians per pixel
    pub frequency: f32,
    pub phase: f32,
}

/// Terrain generator parameters
#[derive(Debug, Clone)]
pub struct TerrainConfig {
    pub half_span: f32,
    pub waterline: f32,
    pub segments: usize,
    /// Surface height at the centre of the island before noise
    pub highland_y: f32,
    /// How far below the waterline the shore ends
    pub shore_depth: f32,
    /// Shape of the blend from highland to shore (higher = flatter plateau)
    pub falloff: f32,
    pub noise: Vec<SineOctave>,
    /// Randomize noise phases per match
    pub random_phase: bool,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            half_span: 1600.0,
            waterline: 600.0,
            segments: 96,
            highland_y: 250.0,
            shore_depth: 80.0,
            falloff: 2.5,
            noise: vec![
                SineOctave {
                    amplitude: 45.0,
                    frequency: 0.004,
                    phase: 0.0,
                },
                SineOctave {
                    amplitude: 20.0,
                    frequency: 0.011,
                    phase: 1.3,
                },
                SineOctave {
                    amplitude: 8.0,
                    frequency: 0.029,
                    phase: 2.1,
                },
            ],
            random_phase: false,
        }
    }
}

/// A single surface sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TerrainPoint {
    pub x: f32,
    pub y: f32,
}

/// Immutable island surface for one match
#[derive(Debug, Clone, Serialize)]
pub struct Terrain {
    points: Vec<TerrainPoint>,
    waterline: f32,
}

#[derive(Debug, thiserror::Error)]
pub enum TerrainError {
    #[error("terrain needs at least one segment")]
    NoSegments,

    #[error("terrain half span must be positive and finite, got {0}")]
    InvalidSpan(f32),

    #[error("highland y {highland_y} is not above the waterline {waterline}")]
    SubmergedHighland { highland_y: f32, waterline: f32 },
}

impl Terrain {
    /// Generate the island surface
    pub fn generate<R: Rng>(config: &TerrainConfig, rng: &mut R) -> Result<Self, TerrainError> {
        if config.segments == 0 {
            return Err(TerrainError::NoSegments);
        }
        if !config.half_span.is_finite() || config.half_span <= 0.0 {
            return Err(TerrainError::InvalidSpan(config.half_span));
        }
        if config.highland_y >= config.waterline {
            return Err(TerrainError::SubmergedHighland {
                highland_y: config.highland_y,
                waterline: config.waterline,
            });
        }

        let octaves: Vec<SineOctave> = config
            .noise
            .iter()
            .map(|octave| SineOctave {
                phase: if config.random_phase {
                    rng.gen_range(0.0..std::f32::consts::TAU)
                } else {
                    octave.phase
                },
                ..*octave
            })
            .collect();

        let shore_y = config.waterline + config.shore_depth;
        let step = 2.0 * config.half_span / config.segments as f32;

        let points = (0..=config.segments)
            .map(|i| {
                // Pin the last sample so rounding never overshoots the span
                let x = if i == config.segments {
                    config.half_span
                } else {
                    -config.half_span + step * i as f32
                };

                let t = (x.abs() / config.half_span).min(1.0);
                let weight = (1.0 - t.powf(config.falloff)).clamp(0.0, 1.0);
                let noise: f32 = octaves
                    .iter()
                    .map(|o| o.amplitude * (o.frequency * x + o.phase).sin())
                    .sum();

                let y = shore_y + (config.highland_y - shore_y) * weight + noise * weight;
                TerrainPoint { x, y }
            })
            .collect();

        Ok(Self {
            points,
            waterline: config.waterline,
        })
    }

    pub fn points(&self) -> &[TerrainPoint] {
        &self.points
    }

    pub fn waterline(&self) -> f32 {
        self.waterline
    }

    /// Consecutive sample pairs
    pub fn segments(&self) -> impl Iterator<Item = (TerrainPoint, TerrainPoint)> + '_ {
        self.points.windows(2).map(|w| (w[0], w[1]))
    }

    /// Samples strictly above the waterline by at least `margin`
    pub fn dry_land(&self, margin: f32) -> impl Iterator<Item = &TerrainPoint> + '_ {
        let limit = self.waterline - margin;
        self.points.iter().filter(move |p| p.y < limit)
    }

    /// Surface height at `x`, interpolated between samples and clamped to the span
    pub fn height_at(&self, x: f32) -> f32 {
        let first = self.points[0];
        let last = self.points[self.points.len() - 1];
        if x <= first.x {
            return first.y;
        }
        if x >= last.x {
            return last.y;
        }

        let idx = self.points.partition_point(|p| p.x <= x);
        let a = self.points[idx - 1];
        let b = self.points[idx];
        let t = (x - a.x) / (b.x - a.x);
        a.y + (b.y - a.y) * t
    }

    /// Interior samples at least `margin` above the waterline whose
    /// neighbouring segments are no steeper than `max_slope`
    pub fn spawn_points(&self, margin: f32, max_slope: f32) -> Vec<TerrainPoint> {
        let limit = self.waterline - margin;
        self.points
            .windows(3)
            .filter(|w| {
                let slope = |a: TerrainPoint, b: TerrainPoint| ((b.y - a.y) / (b.x - a.x)).abs();
                w[1].y < limit && slope(w[0], w[1]) <= max_slope && slope(w[1], w[2]) <= max_slope
            })
            .map(|w| w[1])
            .collect()
    }

    /// Pick a dry sample, or any sample when the island is fully flooded
    pub fn random_dry_point<R: Rng>(&self, margin: f32, rng: &mut R) -> TerrainPoint {
        let dry: Vec<&TerrainPoint> = self.dry_land(margin).collect();
        if dry.is_empty() {
            self.points[rng.gen_range(0..self.points.len())]
        } else {
            *dry[rng.gen_range(0..dry.len())]
        }
    }
}
