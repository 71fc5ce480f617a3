//! # Domain Models
//!
//! Canonical procurement types shared by every source adapter.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ProcurementRecord`] | Normalized tender record |
//! | [`IssuingAgency`] | Publishing agency name and CNPJ |
//! | [`Sphere`] | Federal / state / municipal |
//! | [`StateCode`] | Validated UF |
//! | [`UtcDateTime`] | UTC timestamp |
//!
//! Records are validated at construction: a record without a `source_id` can
//! not exist, and every record is owned by exactly one [`SourceCode`](crate::SourceCode).

mod calendar;
mod record;
mod state;

pub use calendar::{
    format_brazilian, format_compact, parse_iso_date, parse_source_date, UtcDateTime,
};
pub use record::{IssuingAgency, ProcurementRecord, Sphere};
pub use state::StateCode;
