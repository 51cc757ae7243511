//! Name-pattern field classification.
//!
//! Checks run in a fixed order and the first match wins:
//!
//! | Order | Category          | Signals                                              |
//! |-------|-------------------|------------------------------------------------------|
//! | 1     | `NumericSummable` | `count(` / `sum(` / `avg(`, `_total`, `total_`, ...  |
//! | 2     | `Time`            | fecha, anio, mes, dia, hora, periodo, date, ...      |
//! | 3     | `Location`        | provincia, municipio, localidad, lugar, ...          |
//! | 4     | `Categorization`  | estado, status, tipo, categoria, ...                 |
//! | 5     | `Identifier`      | `id`, `id_`, `_id`, codigo, serie, ...               |
//! | 6     | `Detail`          | anything else                                        |

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Identifier,
    Time,
    Location,
    Categorization,
    NumericSummable,
    Detail,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Identifier => "identifier",
            FieldType::Time => "time",
            FieldType::Location => "location",
            FieldType::Categorization => "categorization",
            FieldType::NumericSummable => "numeric_summable",
            FieldType::Detail => "detail",
        }
    }

    /// Whether a raw (non-aggregated) query should group on this category.
    pub fn is_grouping(&self) -> bool {
        matches!(
            self,
            FieldType::Time | FieldType::Location | FieldType::Categorization
        )
    }
}

const AGGREGATE_CALLS: &[&str] = &["count(", "sum(", "avg("];

const NUMERIC_NAMES: &[&str] = &["total", "cantidad", "count", "monto", "importe", "suma"];
const NUMERIC_SUFFIXES: &[&str] = &[
    "_total", "_count", "_sum", "_cantidad", "_monto", "_importe", "_suma",
];
const NUMERIC_PREFIXES: &[&str] = &[
    "total_", "count_", "sum_", "cantidad_", "monto_", "importe_", "suma_", "num_",
];

const TIME_MARKERS: &[&str] = &[
    "fecha", "anio", "año", "mes", "dia", "hora", "periodo", "semana", "date", "time", "year",
    "month", "day", "hour", "week", "period",
];

const LOCATION_MARKERS: &[&str] = &[
    "provincia", "municipio", "localidad", "departamento", "partido", "region", "zona",
    "ciudad", "lugar", "ubicacion", "direccion", "calle", "ruta", "latitud", "longitud",
    "location", "place", "city", "state_name",
];

const CATEGORIZATION_MARKERS: &[&str] = &[
    "estado", "status", "tipo", "type", "categoria", "category", "clase", "class", "grupo",
    "group", "nivel", "level", "motivo",
];

const IDENTIFIER_MARKERS: &[&str] = &["codigo", "code", "serie", "uuid", "patente", "nro_"];

/// Classify a normalised field name or expression.
pub fn classify_field(name: &str) -> FieldType {
    let name = name.trim().to_lowercase();

    if is_numeric_name(&name) {
        FieldType::NumericSummable
    } else if contains_any(&name, TIME_MARKERS) {
        FieldType::Time
    } else if contains_any(&name, LOCATION_MARKERS) {
        FieldType::Location
    } else if contains_any(&name, CATEGORIZATION_MARKERS) {
        FieldType::Categorization
    } else if is_identifier_name(&name) {
        FieldType::Identifier
    } else {
        FieldType::Detail
    }
}

fn is_numeric_name(name: &str) -> bool {
    let compact: String = name.chars().filter(|c| !c.is_whitespace()).collect();
    AGGREGATE_CALLS.iter().any(|call| compact.contains(call))
        || NUMERIC_NAMES.contains(&name)
        || NUMERIC_SUFFIXES.iter().any(|s| name.ends_with(s))
        || NUMERIC_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn is_identifier_name(name: &str) -> bool {
    name == "id"
        || name.starts_with("id_")
        || name.ends_with("_id")
        || contains_any(name, IDENTIFIER_MARKERS)
}

fn contains_any(name: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| name.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_are_numeric() {
        assert_eq!(classify_field("count(*)"), FieldType::NumericSummable);
        assert_eq!(classify_field("SUM( monto )"), FieldType::NumericSummable);
        assert_eq!(classify_field("avg(velocidad)"), FieldType::NumericSummable);
    }

    #[test]
    fn numeric_names_win_over_later_checks() {
        assert_eq!(classify_field("total"), FieldType::NumericSummable);
        assert_eq!(classify_field("cantidad_registros"), FieldType::NumericSummable);
        assert_eq!(classify_field("infracciones_total"), FieldType::NumericSummable);
        assert_eq!(classify_field("total_por_mes"), FieldType::NumericSummable);
    }

    #[test]
    fn time_fields() {
        assert_eq!(classify_field("fecha_infraccion"), FieldType::Time);
        assert_eq!(classify_field("mes"), FieldType::Time);
        assert_eq!(classify_field("anio"), FieldType::Time);
    }

    #[test]
    fn location_fields() {
        assert_eq!(classify_field("provincia"), FieldType::Location);
        assert_eq!(classify_field("municipio"), FieldType::Location);
    }

    #[test]
    fn categorization_before_identifier() {
        assert_eq!(classify_field("id_estado"), FieldType::Categorization);
        assert_eq!(classify_field("id_tipo_infraccion"), FieldType::Categorization);
    }

    #[test]
    fn identifiers() {
        assert_eq!(classify_field("id"), FieldType::Identifier);
        assert_eq!(classify_field("serie_equipo"), FieldType::Identifier);
        assert_eq!(classify_field("id_punto_control"), FieldType::Identifier);
        assert_eq!(classify_field("equipo_id"), FieldType::Identifier);
    }

    #[test]
    fn everything_else_is_detail() {
        assert_eq!(classify_field("observaciones"), FieldType::Detail);
        assert_eq!(classify_field("*"), FieldType::Detail);
    }

    #[test]
    fn grouping_categories() {
        assert!(FieldType::Location.is_grouping());
        assert!(FieldType::Time.is_grouping());
        assert!(!FieldType::Identifier.is_grouping());
        assert!(!FieldType::NumericSummable.is_grouping());
    }
}
