/// Rotator pointing as reported by the daemon, in degrees.
///
/// Values are kept exactly as received; use [`Position::normalized`] before
/// drawing a needle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub azimuth: f64,
    pub elevation: f64,
}

const COMPASS_POINTS: [&str; 16] = [
    "N", "NNE", "NE", "ENE", "E", "ESE", "SE", "SSE", "S", "SSW", "SW", "WSW", "W", "WNW", "NW",
    "NNW",
];

impl Position {
    pub fn new(azimuth: f64, elevation: f64) -> Self {
        Self { azimuth, elevation }
    }

    /// Azimuth wrapped into [0, 360) and elevation clamped into [0, 180].
    pub fn normalized(&self) -> Self {
        let mut azimuth = self.azimuth.rem_euclid(360.0);
        // rem_euclid can round up to exactly 360 for tiny negative inputs.
        if azimuth >= 360.0 {
            azimuth = 0.0;
        }
        Self {
            azimuth,
            elevation: self.elevation.clamp(0.0, 180.0),
        }
    }

    /// 16-point compass label of the normalized azimuth.
    pub fn compass_point(&self) -> &'static str {
        let az = self.normalized().azimuth;
        let idx = ((az / 22.5).round() as usize) % COMPASS_POINTS.len();
        COMPASS_POINTS[idx]
    }

    pub fn approx_eq(&self, other: &Position, tolerance: f64) -> bool {
        (self.azimuth - other.azimuth).abs() <= tolerance
            && (self.elevation - other.elevation).abs() <= tolerance
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Az {:.1}° El {:.1}°", self.azimuth, self.elevation)
    }
}
