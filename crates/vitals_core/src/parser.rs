//! Decodificação de uma linha do dispositivo em [`Reading`].
//!
//! Dois formatos aceitos, tentados nesta ordem:
//!
//! 1. **Estruturado**: objeto JSON com chaves `pulse|bpm`,
//!    `spo2|oxygenSaturation`, `lung|lungCapacity`.
//! 2. **Delimitado**: três tokens numéricos separados por vírgula, espaço
//!    ou ponto-e-vírgula, na ordem fixa pulso, SpO₂, pulmão.
//!
//! Qualquer outra forma retorna `None`. Banners de boot e escritas parciais
//! são ruído esperado do protocolo, não erro.

use crate::types::Reading;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Aliases aceitos no formato estruturado, na ordem de precedência.
const PULSE_KEYS: [&str; 2] = ["pulse", "bpm"];
const SPO2_KEYS: [&str; 2] = ["spo2", "oxygenSaturation"];
const LUNG_KEYS: [&str; 2] = ["lung", "lungCapacity"];

/// Decodifica uma linha com `timestamp = agora`.
pub fn parse_line(line: &str) -> Option<Reading> {
    parse_line_at(line, Utc::now())
}

/// Decodifica uma linha usando o timestamp informado.
pub fn parse_line_at(line: &str, timestamp: DateTime<Utc>) -> Option<Reading> {
    let s = line.trim();
    if s.is_empty() {
        return None;
    }

    let [pulse, oxygen_saturation, lung_capacity] = if s.starts_with('{') && s.ends_with('}') {
        parse_structured(s)?
    } else {
        parse_delimited(s)?
    };

    Some(Reading {
        timestamp,
        pulse,
        oxygen_saturation,
        lung_capacity,
    })
}

fn parse_structured(s: &str) -> Option<[f64; 3]> {
    let Value::Object(obj) = serde_json::from_str::<Value>(s).ok()? else {
        return None;
    };
    Some([
        resolve(&obj, &PULSE_KEYS)?,
        resolve(&obj, &SPO2_KEYS)?,
        resolve(&obj, &LUNG_KEYS)?,
    ])
}

/// Primeiro alias presente e não-nulo; o valor precisa ser numérico e finito.
fn resolve(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    let value = keys
        .iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())?;

    let n = match value {
        Value::Number(n) => n.as_f64()?,
        // Firmwares antigos mandam números como string
        Value::String(s) => parse_number(s)?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn parse_delimited(s: &str) -> Option<[f64; 3]> {
    let mut tokens = s
        .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|t| !t.is_empty());

    let pulse = parse_number(tokens.next()?)?;
    let spo2 = parse_number(tokens.next()?)?;
    let lung = parse_number(tokens.next()?)?;
    Some([pulse, spo2, lung])
}

/// Número finito; rejeita `inf`/`NaN`, que `f64::from_str` aceitaria.
fn parse_number(token: &str) -> Option<f64> {
    token
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
