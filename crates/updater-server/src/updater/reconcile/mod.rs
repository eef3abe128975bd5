//! Per-entity reconciliation
//!
//! Pure mapping from typed upstream records to local rows, plus the
//! matching and tie-break rules. Only [`course_units`] and [`cleanup`]
//! read the store.

pub mod cleanup;
pub mod course_units;
pub mod enrolments;
pub mod interim;
pub mod organisations;
pub mod persons;
pub mod realisations;
pub mod similarity;
pub mod teachers;
