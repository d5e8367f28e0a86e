//! Completed-word view and floating-point reconstruction
//!
//! A [`Word`] is the momentary 13-bit view latched from the shift register
//! when the load strobe falls: a 10-bit mantissa field followed by a 3-bit
//! exponent field, in the order the bits were shifted in. `decode()` applies
//! the device's reconstruction formula to produce a [`DecodedSample`].

use super::shift_register::{EXPONENT_BITS, MANTISSA_BITS, WORD_BITS};
use super::types::{Annotation, AnnotationKind, Bit, DecodedSample, Span};

/// Fixed reference voltage of the DAC
pub const VIN: f64 = 5.0;

/// A complete 13-bit capture, split into mantissa and exponent fields
///
/// Position 0 is the chronologically first bit of the window. Never
/// persisted: it is built from the register, decoded, and discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Word {
    bits: [Bit; WORD_BITS],
}

impl Word {
    pub fn new(bits: [Bit; WORD_BITS]) -> Self {
        Self { bits }
    }

    /// All 13 bits in capture order
    pub fn bits(&self) -> &[Bit] {
        &self.bits
    }

    /// The 10-bit mantissa field (window positions 0..10)
    pub fn mantissa_bits(&self) -> &[Bit] {
        &self.bits[..MANTISSA_BITS]
    }

    /// The 3-bit exponent field (window positions 10..13)
    pub fn exponent_bits(&self) -> &[Bit] {
        &self.bits[MANTISSA_BITS..]
    }

    /// Sample-index range of the full word
    pub fn span(&self) -> Span {
        Span::cover(self.bits[0].span, self.bits[WORD_BITS - 1].span)
    }

    /// Sample-index range of the mantissa field
    pub fn mantissa_span(&self) -> Span {
        let field = self.mantissa_bits();
        Span::cover(field[0].span, field[MANTISSA_BITS - 1].span)
    }

    /// Sample-index range of the exponent field
    pub fn exponent_span(&self) -> Span {
        let field = self.exponent_bits();
        Span::cover(field[0].span, field[EXPONENT_BITS - 1].span)
    }

    /// Reconstruct the analog output value this word drives.
    ///
    /// The device's floating format: the mantissa field sums to
    /// `-1 + Σ b_i·2^-i` with the first-shifted bit carrying the largest
    /// weight, plus an unconditional `2^-10` bias term; the exponent field is
    /// a plain 3-bit integer, first-shifted bit least significant. The
    /// normalized value truncates toward zero — it must not round, for
    /// bit-for-bit compatibility with the device's reference output.
    pub fn decode(&self) -> DecodedSample {
        let mut mantissa = -1.0;
        for (i, bit) in self.mantissa_bits().iter().enumerate() {
            mantissa += f64::from(bit.value) * 2.0_f64.powi(-(i as i32));
        }
        mantissa += 2.0_f64.powi(-10);

        let mut exponent = 0.0;
        for (j, bit) in self.exponent_bits().iter().enumerate() {
            exponent += f64::from(bit.value) * 2.0_f64.powi(j as i32);
        }

        let vout = VIN / 2.0 + (VIN / 4.0) * (mantissa * 2.0_f64.powi(-10)) * 2.0_f64.powf(-exponent);
        let normalized = (((vout - VIN / 4.0) / (VIN / 2.0)) * 65535.0) as u16;

        DecodedSample {
            mantissa,
            exponent,
            vout,
            normalized,
            span: self.span(),
        }
    }

    /// The field and output-summary annotations for this word.
    pub fn annotations(&self, decoded: &DecodedSample) -> [Annotation; 3] {
        [
            Annotation::new(AnnotationKind::Mantissa, self.mantissa_span(), "Mantissa"),
            Annotation::new(AnnotationKind::Exponent, self.exponent_span(), "Exponent"),
            Annotation::new(
                AnnotationKind::Output,
                self.span(),
                format!(
                    "Vin: {:.6}, Vout: {:.6}, 16-bit: {}",
                    VIN, decoded.vout, decoded.normalized
                ),
            ),
        ]
    }
}
