//! Raw integer volume ↔ decibel ↔ linear scalar conversions.
use tracing::warn;

/// Exponent applied between the normalized raw value and the scalar.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransferFunction {
    /// No shaping.
    Linear,
    /// `x^(1/3)`
    Pow1Over3,
    /// `x^(1/2)`
    Pow1Over2,
    /// `x^(3/4)`
    Pow3Over4,
    /// `x^(3/2)`
    Pow3Over2,
    /// `x^2`
    #[default]
    Pow2Over1,
    /// `x^3`
    Pow3Over1,
    /// `x^4`
    Pow4Over1,
    /// `x^5`
    Pow5Over1,
    /// `x^6`
    Pow6Over1,
    /// `x^7`
    Pow7Over1,
    /// `x^8`
    Pow8Over1,
    /// `x^9`
    Pow9Over1,
    /// `x^10`
    Pow10Over1,
    /// `x^11`
    Pow11Over1,
    /// `x^12`
    Pow12Over1,
}

impl TransferFunction {
    /// Raw-to-scalar exponent, `None` for linear.
    fn exponent(self) -> Option<f32> {
        use TransferFunction::*;
        let (numerator, denominator) = match self {
            Linear => return None,
            Pow1Over3 => (1.0, 3.0),
            Pow1Over2 => (1.0, 2.0),
            Pow3Over4 => (3.0, 4.0),
            Pow3Over2 => (3.0, 2.0),
            Pow2Over1 => (2.0, 1.0),
            Pow3Over1 => (3.0, 1.0),
            Pow4Over1 => (4.0, 1.0),
            Pow5Over1 => (5.0, 1.0),
            Pow6Over1 => (6.0, 1.0),
            Pow7Over1 => (7.0, 1.0),
            Pow8Over1 => (8.0, 1.0),
            Pow9Over1 => (9.0, 1.0),
            Pow10Over1 => (10.0, 1.0),
            Pow11Over1 => (11.0, 1.0),
            Pow12Over1 => (12.0, 1.0),
        };
        Some(numerator / denominator)
    }
}

/// Curves spanning fewer decibels than this are treated as linear.
const MIN_SHAPED_DB_RANGE: f32 = 30.0;

#[derive(Clone, Copy, Debug, PartialEq)]
struct Segment {
    min_raw: i32,
    max_raw: i32,
    min_db: f32,
    max_db: f32,
}

impl Segment {
    fn raw_span(&self) -> i32 {
        self.max_raw - self.min_raw
    }

    fn db_per_raw(&self) -> f32 {
        (self.max_db - self.min_db) / self.raw_span() as f32
    }
}

/// Piecewise linear raw-to-decibel mapping with a shaped raw-to-scalar conversion.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VolumeCurve {
    segments: Vec<Segment>,
    transfer: TransferFunction,
}

impl VolumeCurve {
    /// Empty curve using the default `x^2` transfer function.
    pub fn new() -> Self {
        Self::default()
    }

    /// Curve used for per-app relative volumes: raw `0..=100` over `-96..=0` dB.
    pub fn app_relative_volume() -> Self {
        let mut curve = Self::new();
        curve.add_range(
            crate::app_volumes::MIN_RAW_VOLUME,
            crate::app_volumes::MAX_RAW_VOLUME,
            -96.0,
            0.0,
        );
        curve
    }

    /// Active transfer function.
    pub fn transfer_function(&self) -> TransferFunction {
        self.transfer
    }

    /// Replace the transfer function.
    pub fn set_transfer_function(&mut self, transfer: TransferFunction) {
        self.transfer = transfer;
    }

    /// Add a segment. Segments overlapping an existing one are ignored; returns whether the
    /// segment was added.
    pub fn add_range(&mut self, min_raw: i32, max_raw: i32, min_db: f32, max_db: f32) -> bool {
        if max_raw <= min_raw {
            warn!(min_raw, max_raw, "ignoring empty volume curve range");
            return false;
        }
        let overlaps = self
            .segments
            .iter()
            .any(|s| min_raw < s.max_raw && s.min_raw < max_raw);
        if overlaps {
            warn!(min_raw, max_raw, "ignoring overlapping volume curve range");
            return false;
        }
        let at = self.segments.partition_point(|s| s.min_raw < min_raw);
        self.segments.insert(
            at,
            Segment {
                min_raw,
                max_raw,
                min_db,
                max_db,
            },
        );
        true
    }

    /// Remove every segment.
    pub fn reset_ranges(&mut self) {
        self.segments.clear();
    }

    /// Whether each segment starts where the previous one ended, in raw and dB.
    pub fn is_continuous(&self) -> bool {
        self.segments
            .windows(2)
            .all(|pair| pair[0].max_raw == pair[1].min_raw && pair[0].max_db == pair[1].min_db)
    }

    /// Smallest raw value, 0 for an empty curve.
    pub fn min_raw(&self) -> i32 {
        self.segments.first().map_or(0, |s| s.min_raw)
    }

    /// Largest raw value, 0 for an empty curve.
    pub fn max_raw(&self) -> i32 {
        self.segments.last().map_or(0, |s| s.max_raw)
    }

    /// Smallest decibel value, 0 for an empty curve.
    pub fn min_db(&self) -> f32 {
        self.segments.first().map_or(0.0, |s| s.min_db)
    }

    /// Largest decibel value, 0 for an empty curve.
    pub fn max_db(&self) -> f32 {
        self.segments.last().map_or(0.0, |s| s.max_db)
    }

    fn shaping_exponent(&self) -> Option<f32> {
        if self.max_db() - self.min_db() > MIN_SHAPED_DB_RANGE {
            self.transfer.exponent()
        } else {
            None
        }
    }

    /// Decibels for a raw value, clamping it into the curve first.
    pub fn raw_to_db(&self, raw: i32) -> f32 {
        let raw = raw.clamp(self.min_raw(), self.max_raw());
        let mut steps = raw - self.min_raw();
        let mut db = self.min_db();
        for segment in &self.segments {
            if steps <= 0 {
                break;
            }
            let take = segment.raw_span().min(steps);
            db += take as f32 * segment.db_per_raw();
            steps -= take;
        }
        db
    }

    /// Raw value for a decibel value, clamping it into the curve first.
    pub fn db_to_raw(&self, db: f32) -> i32 {
        let db = db.clamp(self.min_db(), self.max_db());
        let mut raw = self.min_raw();
        for segment in &self.segments {
            if db > segment.max_db {
                raw += segment.raw_span();
            } else {
                raw += ((db - segment.min_db) / segment.db_per_raw()).round() as i32;
                break;
            }
        }
        raw
    }

    /// Linear scalar in `0.0..=1.0` for a raw value.
    pub fn raw_to_scalar(&self, raw: i32) -> f32 {
        let span = self.max_raw() - self.min_raw();
        if span <= 0 {
            return 0.0;
        }
        let raw = raw.clamp(self.min_raw(), self.max_raw());
        let scalar = (raw - self.min_raw()) as f32 / span as f32;
        match self.shaping_exponent() {
            Some(exponent) => scalar.powf(exponent),
            None => scalar,
        }
    }

    /// Raw value for a linear scalar, clamping it into `0.0..=1.0` first.
    pub fn scalar_to_raw(&self, scalar: f32) -> i32 {
        let mut scalar = scalar.clamp(0.0, 1.0);
        if let Some(exponent) = self.shaping_exponent() {
            scalar = scalar.powf(1.0 / exponent);
        }
        let span = self.max_raw() - self.min_raw();
        self.min_raw() + (scalar * span as f32).round() as i32
    }

    /// Scalar for a decibel value, going through the nearest raw value.
    pub fn db_to_scalar(&self, db: f32) -> f32 {
        self.raw_to_scalar(self.db_to_raw(db))
    }

    /// Decibels for a scalar, going through the nearest raw value.
    pub fn scalar_to_db(&self, scalar: f32) -> f32 {
        self.raw_to_db(self.scalar_to_raw(scalar))
    }
}
