use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::Date;

use crate::{SourceCode, StateCode, UtcDateTime, ValidationError};

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

/// Government sphere the issuing agency belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Sphere {
    Federal,
    State,
    Municipal,
    #[default]
    Unknown,
}

impl Sphere {
    /// Map the single-letter sphere ids used by PNCP (`F`, `E`, `M`, `D`).
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_uppercase().as_str() {
            "F" | "FEDERAL" => Self::Federal,
            "E" | "D" | "ESTADUAL" | "DISTRITAL" => Self::State,
            "M" | "MUNICIPAL" => Self::Municipal,
            _ => Self::Unknown,
        }
    }
}

/// Public body that published the tender.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IssuingAgency {
    pub name: String,
    /// CNPJ as published by the source, possibly formatted (`00.394.460/0058-87`).
    pub tax_id: String,
}

impl IssuingAgency {
    pub fn new(name: impl Into<String>, tax_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tax_id: tax_id.into(),
        }
    }

    /// Tax id reduced to its digits, so formatted and bare CNPJs compare equal.
    pub fn normalized_tax_id(&self) -> String {
        self.tax_id.chars().filter(char::is_ascii_digit).collect()
    }
}

/// Normalized procurement record produced by every source adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcurementRecord {
    pub source_id: String,
    pub source_code: SourceCode,
    pub source_name: String,
    pub object_description: String,
    pub estimated_value: Option<Decimal>,
    pub issuing_agency: IssuingAgency,
    pub state_code: Option<StateCode>,
    pub municipality: Option<String>,
    #[serde(with = "iso_date::option", default)]
    pub publication_date: Option<Date>,
    #[serde(with = "iso_date::option", default)]
    pub opening_date: Option<Date>,
    #[serde(with = "iso_date::option", default)]
    pub closing_date: Option<Date>,
    pub edital_number: Option<String>,
    pub year: Option<i32>,
    pub modality: Option<String>,
    pub status_text: Option<String>,
    pub sphere: Sphere,
    pub links: Vec<String>,
    pub raw_payload: Value,
    pub fetched_at: UtcDateTime,
}

impl ProcurementRecord {
    /// Creates a record owned by `source_code` with every optional field empty.
    pub fn new(
        source_code: SourceCode,
        source_name: impl Into<String>,
        source_id: impl Into<String>,
        object_description: impl Into<String>,
        raw_payload: Value,
    ) -> Result<Self, ValidationError> {
        let source_id = source_id.into();
        if source_id.trim().is_empty() {
            return Err(ValidationError::EmptySourceId);
        }

        Ok(Self {
            source_id,
            source_code,
            source_name: source_name.into(),
            object_description: object_description.into(),
            estimated_value: None,
            issuing_agency: IssuingAgency::default(),
            state_code: None,
            municipality: None,
            publication_date: None,
            opening_date: None,
            closing_date: None,
            edital_number: None,
            year: None,
            modality: None,
            status_text: None,
            sphere: Sphere::Unknown,
            links: Vec::new(),
            raw_payload,
            fetched_at: UtcDateTime::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn code() -> SourceCode {
        SourceCode::parse("pncp").expect("valid code")
    }

    #[test]
    fn rejects_blank_source_id() {
        let error = ProcurementRecord::new(code(), "PNCP", "  ", "obj", Value::Null)
            .expect_err("blank id must fail");
        assert_eq!(error, ValidationError::EmptySourceId);
    }

    #[test]
    fn tax_id_normalization_strips_formatting() {
        let agency = IssuingAgency::new("Prefeitura", "00.394.460/0058-87");
        assert_eq!(agency.normalized_tax_id(), "00394460005887");
    }

    #[test]
    fn dates_serialize_as_iso_strings() {
        let mut record =
            ProcurementRecord::new(code(), "PNCP", "123", "obj", json!({"id": 123}))
                .expect("valid record");
        record.publication_date =
            Some(Date::from_calendar_date(2024, time::Month::May, 2).expect("valid date"));

        let value = serde_json::to_value(&record).expect("serializable");
        assert_eq!(value["publication_date"], "2024-05-02");
        assert_eq!(value["opening_date"], Value::Null);
        assert_eq!(value["source_code"], "pncp");
    }

    #[test]
    fn sphere_codes_map_to_variants() {
        assert_eq!(Sphere::from_code("F"), Sphere::Federal);
        assert_eq!(Sphere::from_code("m"), Sphere::Municipal);
        assert_eq!(Sphere::from_code("E"), Sphere::State);
        assert_eq!(Sphere::from_code("?"), Sphere::Unknown);
    }
}
