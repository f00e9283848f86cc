use crate::properties::{Properties, BYTES_ACCESSED, FLOPS, TRANSCENDENTALS};
use crate::shape::{Shape, ShapeSizeFn};

/// Hardware-related inputs to the analysis: how large a value's top-level buffer is, and how much
/// of each property the target can process per second.
#[derive(Clone, Default)]
pub struct Options {
    shape_size: Option<ShapeSizeFn>,
    per_second_rates: Properties,
    strict_layouts: bool,
}

impl Options {
    pub fn new(shape_size: ShapeSizeFn) -> Self {
        Options::default().with_shape_size(shape_size)
    }

    pub fn with_shape_size(self, shape_size: ShapeSizeFn) -> Self {
        Options {
            shape_size: Some(shape_size),
            ..self
        }
    }

    /// Fail the visit of any instruction that needs the byte size of a shape with no layout,
    /// rather than counting that shape as zero bytes.
    pub fn with_strict_layouts(self, strict_layouts: bool) -> Self {
        Options {
            strict_layouts,
            ..self
        }
    }

    pub fn with_per_second_rate(mut self, key: &str, value: f64) -> Self {
        self.set_per_second_rate(key, value);
        self
    }

    pub fn set_per_second_rate(&mut self, key: &str, value: f64) {
        self.per_second_rates.set(key, value);
    }

    pub fn set_flops_per_second(&mut self, value: f64) {
        self.set_per_second_rate(FLOPS, value);
    }

    pub fn set_transcendentals_per_second(&mut self, value: f64) {
        self.set_per_second_rate(TRANSCENDENTALS, value);
    }

    pub fn set_bytes_per_second(&mut self, value: f64) {
        self.set_per_second_rate(BYTES_ACCESSED, value);
    }

    /// The configured rate for `key`, or 0 if there is none.
    pub fn per_second_rate(&self, key: &str) -> f64 {
        self.per_second_rates.get(key)
    }

    /// The configured rate for `key`, if it is usable as a divisor.
    pub fn rate(&self, key: &str) -> Option<f64> {
        Some(self.per_second_rates.get(key)).filter(|&rate| rate > 0.0)
    }

    pub fn per_second_rates(&self) -> &Properties {
        &self.per_second_rates
    }

    pub fn has_shape_size(&self) -> bool {
        self.shape_size.is_some()
    }

    pub fn strict_layouts(&self) -> bool {
        self.strict_layouts
    }

    /// Applies the configured shape-size function, if any.
    pub fn shape_size(&self, shape: &Shape) -> Option<i64> {
        self.shape_size.as_ref().map(|f| f(shape))
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("shape_size", &self.shape_size.as_ref().map(|_| "<fn>"))
            .field("per_second_rates", &self.per_second_rates)
            .field("strict_layouts", &self.strict_layouts)
            .finish()
    }
}
