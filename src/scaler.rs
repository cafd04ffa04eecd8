//! Frame normalization by accumulation length.
//!
//! A frame's raw values are sums over `accumulation_length` samples;
//! dividing by that length yields per-sample averages for consumers that
//! want physical units. The transform is pure: payload in, payload out,
//! no I/O and no shared state.
//!
//! Identity law: with normalization disabled, or a divisor of exactly 1,
//! `apply` returns the input buffer untouched — no floating-point work,
//! and `scale(frame, 1) == frame` holds bit-for-bit.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{CaptureError, Result};

/// Normalizes frame payloads of big-endian `f32` samples.
#[derive(Debug, Clone, Copy)]
pub struct Scaler {
    divisor: f32,
}

impl Scaler {
    /// Create a scaler dividing samples by `divisor`.
    ///
    /// A non-positive or non-finite divisor is a configuration error.
    /// `enabled == false` yields the identity scaler regardless of divisor.
    pub fn new(divisor: f64, enabled: bool) -> Result<Self> {
        if !(divisor > 0.0) || !divisor.is_finite() {
            return Err(CaptureError::Config(format!(
                "scale divisor must be positive and finite, got {divisor}"
            )));
        }
        if !enabled {
            return Ok(Self::identity());
        }
        Ok(Self {
            divisor: divisor as f32,
        })
    }

    /// The identity scaler.
    pub fn identity() -> Self {
        Self { divisor: 1.0 }
    }

    /// Whether applying this scaler is a no-op.
    #[inline]
    pub fn is_identity(&self) -> bool {
        self.divisor == 1.0
    }

    /// The factor applied to each sample (`1 / divisor`).
    #[inline]
    pub fn factor(&self) -> f64 {
        1.0 / f64::from(self.divisor)
    }

    /// Rescale a payload of big-endian `f32` samples.
    ///
    /// Whole 4-byte words are divided; any trailing bytes pass through
    /// unchanged. The identity scaler returns the input buffer itself.
    pub fn apply(&self, payload: Bytes) -> Bytes {
        if self.is_identity() {
            return payload;
        }

        let mut out = BytesMut::with_capacity(payload.len());
        let mut chunks = payload.chunks_exact(4);
        for word in &mut chunks {
            let value = f32::from_be_bytes([word[0], word[1], word[2], word[3]]);
            out.put_slice(&(value / self.divisor).to_be_bytes());
        }
        out.put_slice(chunks.remainder());
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_of(values: &[f32]) -> Bytes {
        let mut buf = BytesMut::new();
        for v in values {
            buf.put_slice(&v.to_be_bytes());
        }
        buf.freeze()
    }

    fn values_of(payload: &Bytes) -> Vec<f32> {
        payload
            .chunks_exact(4)
            .map(|w| f32::from_be_bytes([w[0], w[1], w[2], w[3]]))
            .collect()
    }

    #[test]
    fn test_divisor_one_is_identity() {
        let scaler = Scaler::new(1.0, true).unwrap();
        assert!(scaler.is_identity());

        let payload = payload_of(&[1.5, -2.0, 4096.0]);
        let scaled = scaler.apply(payload.clone());
        assert_eq!(scaled, payload);
        // Identity returns the very same buffer, not a copy.
        assert_eq!(scaled.as_ptr(), payload.as_ptr());
    }

    #[test]
    fn test_disabled_is_identity() {
        let scaler = Scaler::new(8192.0, false).unwrap();
        assert!(scaler.is_identity());

        let payload = payload_of(&[3.0]);
        assert_eq!(scaler.apply(payload.clone()), payload);
    }

    #[test]
    fn test_scales_by_accumulation_length() {
        let scaler = Scaler::new(8192.0, true).unwrap();
        let scaled = scaler.apply(payload_of(&[8192.0, 16384.0, 0.0, -8192.0]));

        let values = values_of(&scaled);
        let expected = [1.0f32, 2.0, 0.0, -1.0];
        for (got, want) in values.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-6, "got {got}, want {want}");
        }
    }

    #[test]
    fn test_zero_divisor_rejected() {
        let err = Scaler::new(0.0, true).unwrap_err();
        assert!(matches!(err, CaptureError::Config(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_negative_divisor_rejected() {
        assert!(Scaler::new(-4.0, true).is_err());
    }

    #[test]
    fn test_nan_divisor_rejected() {
        assert!(Scaler::new(f64::NAN, true).is_err());
        assert!(Scaler::new(f64::INFINITY, true).is_err());
    }

    #[test]
    fn test_divisor_validated_even_when_disabled() {
        // Eager validation: a broken snapshot fails startup whether or not
        // normalization is switched on.
        assert!(Scaler::new(0.0, false).is_err());
    }

    #[test]
    fn test_trailing_bytes_pass_through() {
        let scaler = Scaler::new(2.0, true).unwrap();

        let mut buf = BytesMut::new();
        buf.put_slice(&4.0f32.to_be_bytes());
        buf.put_slice(&[0xAA, 0xBB]); // not a whole word
        let scaled = scaler.apply(buf.freeze());

        assert_eq!(values_of(&scaled.slice(..4)), vec![2.0]);
        assert_eq!(&scaled[4..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_empty_payload() {
        let scaler = Scaler::new(2.0, true).unwrap();
        assert!(scaler.apply(Bytes::new()).is_empty());
    }
}
