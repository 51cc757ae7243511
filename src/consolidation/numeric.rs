//! Numeric parsing, integer-preserving sums and sample-based numeric field
//! detection.

use serde_json::{Number, Value};
use std::collections::HashSet;

use crate::classify::{classify_field, FieldType};
use crate::shard::Row;

/// Field names that are never summed even when their values look numeric.
const NON_NUMERIC_FIELDS: &[&str] = &[
    "id", "_shard", "anio", "mes", "dia", "semana", "codigo", "codigo_postal", "cp", "serie_equipo",
    "patente", "dominio", "dni", "cuit", "documento", "telefono", "nro_acta", "latitud", "longitud",
];

/// A parsed numeric cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    Int(i64),
    Float(f64),
}

/// Parse a JSON value as a number. Numeric-looking text counts; booleans and
/// null do not.
pub fn parse_numeric(value: &Value) -> Option<Numeric> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(Numeric::Int)
            .or_else(|| n.as_f64().map(Numeric::Float)),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                Some(Numeric::Int(i))
            } else {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(Numeric::Float)
            }
        }
        _ => None,
    }
}

/// Running sum that stays integral until a fractional value or an overflow
/// forces it to floating point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sum {
    Int(i64),
    Float(f64),
}

impl Default for Sum {
    fn default() -> Self {
        Sum::Int(0)
    }
}

impl Sum {
    pub fn add(&mut self, value: Numeric) {
        *self = match (*self, value) {
            (Sum::Int(acc), Numeric::Int(v)) => match acc.checked_add(v) {
                Some(total) => Sum::Int(total),
                None => Sum::Float(acc as f64 + v as f64),
            },
            (Sum::Int(acc), Numeric::Float(v)) => Sum::Float(acc as f64 + v),
            (Sum::Float(acc), Numeric::Int(v)) => Sum::Float(acc + v as f64),
            (Sum::Float(acc), Numeric::Float(v)) => Sum::Float(acc + v),
        };
    }

    pub fn to_value(self) -> Value {
        match self {
            Sum::Int(i) => Value::from(i),
            Sum::Float(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        }
    }
}

/// Sampling thresholds for [`detect_numeric_fields`].
#[derive(Debug, Clone, Copy)]
pub struct NumericSampling {
    pub sample_size: usize,
    pub min_samples: usize,
    /// Numeric share must be strictly above this.
    pub ratio: f64,
}

impl Default for NumericSampling {
    fn default() -> Self {
        Self {
            sample_size: 50,
            min_samples: 3,
            ratio: 0.8,
        }
    }
}

/// Field names in order of first appearance across `rows`.
pub fn field_names(rows: &[Row]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut names = Vec::new();
    for row in rows {
        for key in row.keys() {
            if seen.insert(key.as_str()) {
                names.push(key.clone());
            }
        }
    }
    names
}

/// Fields that look numeric in the first `sample_size` rows. `exclude` holds
/// fields already claimed elsewhere (grouping fields). Mostly-null columns
/// are not detected.
pub fn detect_numeric_fields(rows: &[Row], exclude: &[String], sampling: &NumericSampling) -> Vec<String> {
    let sample = &rows[..rows.len().min(sampling.sample_size)];

    field_names(sample)
        .into_iter()
        .filter(|name| {
            let lower = name.to_lowercase();
            !NON_NUMERIC_FIELDS.contains(&lower.as_str())
                && !exclude.iter().any(|e| e == name)
                && classify_field(&lower) != FieldType::Identifier
        })
        .filter(|name| {
            let present: Vec<&Value> = sample
                .iter()
                .filter_map(|row| row.get(name))
                .filter(|v| !v.is_null())
                .collect();
            if present.len() < sampling.min_samples {
                return false;
            }
            let numeric = present.iter().filter(|v| parse_numeric(v).is_some()).count();
            numeric as f64 / present.len() as f64 > sampling.ratio
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(values: &[Value]) -> Vec<Row> {
        values
            .iter()
            .map(|v| v.as_object().cloned().unwrap_or_default())
            .collect()
    }

    #[test]
    fn parses_numbers_and_numeric_text() {
        assert_eq!(parse_numeric(&json!(5)), Some(Numeric::Int(5)));
        assert_eq!(parse_numeric(&json!(" 12 ")), Some(Numeric::Int(12)));
        assert_eq!(parse_numeric(&json!("2.5")), Some(Numeric::Float(2.5)));
        assert_eq!(parse_numeric(&json!("abc")), None);
        assert_eq!(parse_numeric(&json!(true)), None);
        assert_eq!(parse_numeric(&json!("NaN")), None);
    }

    #[test]
    fn sums_stay_integral() {
        let mut sum = Sum::default();
        sum.add(Numeric::Int(5));
        sum.add(Numeric::Int(7));
        assert_eq!(sum.to_value(), json!(12));

        sum.add(Numeric::Float(0.5));
        assert_eq!(sum.to_value(), json!(12.5));
    }

    #[test]
    fn overflow_degrades_to_float() {
        let mut sum = Sum::Int(i64::MAX);
        sum.add(Numeric::Int(1));
        assert!(matches!(sum, Sum::Float(_)));
    }

    #[test]
    fn detects_numeric_columns() {
        let data = rows(&[
            json!({"municipio": "A", "monto": 10, "velocidad": "81.5", "nota": "x", "id": 1}),
            json!({"municipio": "B", "monto": 20, "velocidad": "90", "nota": "y", "id": 2}),
            json!({"municipio": "C", "monto": "30", "velocidad": 70, "nota": "3", "id": 3}),
        ]);
        let found = detect_numeric_fields(&data, &["municipio".to_string()], &NumericSampling::default());
        assert_eq!(found, vec!["monto", "velocidad"]);
    }

    #[test]
    fn sparse_columns_are_not_detected() {
        let data = rows(&[
            json!({"monto": 10}),
            json!({"monto": null}),
            json!({"monto": 5}),
            json!({}),
        ]);
        assert!(detect_numeric_fields(&data, &[], &NumericSampling::default()).is_empty());
    }

    #[test]
    fn ratio_is_a_strict_bound() {
        // 4 of 5 numeric is exactly 0.8
        let data = rows(&[
            json!({"valor": 1}),
            json!({"valor": 2}),
            json!({"valor": 3}),
            json!({"valor": 4}),
            json!({"valor": "n/a"}),
        ]);
        assert!(detect_numeric_fields(&data, &[], &NumericSampling::default()).is_empty());
    }
}
