//! Limites clínicos aplicados antes de persistir uma leitura.
//!
//! Pulso e SpO₂ são limitados (clamp, nunca rejeição). Capacidade pulmonar
//! não tem faixa clínica estabelecida e passa sem alteração.

use crate::types::{Reading, SanitizedReading};
use std::ops::RangeInclusive;

/// Faixa aceita para pulso (bpm).
pub const PULSE_RANGE: RangeInclusive<f64> = 20.0..=240.0;

/// Faixa aceita para saturação de oxigênio (%).
pub const SPO2_RANGE: RangeInclusive<f64> = 50.0..=100.0;

/// Limita pulso e SpO₂ às faixas clínicas.
pub fn sanitize(reading: &Reading) -> SanitizedReading {
    let pulse = clamp(reading.pulse, &PULSE_RANGE);
    let oxygen_saturation = clamp(reading.oxygen_saturation, &SPO2_RANGE);

    SanitizedReading {
        timestamp: reading.timestamp,
        pulse,
        oxygen_saturation,
        lung_capacity: reading.lung_capacity,
        clamped: pulse != reading.pulse || oxygen_saturation != reading.oxygen_saturation,
    }
}

fn clamp(value: f64, range: &RangeInclusive<f64>) -> f64 {
    value.clamp(*range.start(), *range.end())
}
