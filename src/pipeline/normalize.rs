//! Table normalisation: flatten records into six relational tables.
//!
//! ```text
//! personal.csv    one row per subject
//! degrees.csv     ┐
//! employment.csv  │ zero or more rows per subject,
//! visits.csv      │ in the record's list order
//! honors.csv      │
//! parents.csv     ┘
//! ```
//!
//! Every row carries `subject_key`; child rows also repeat `full_name` so a
//! table is readable on its own. [`normalize_records`] is pure; writing the
//! files is [`TableSet::write_csv`].

use crate::cache::{output_ref, write_atomic};
use crate::error::PipelineError;
use crate::output::OutputRef;
use crate::record::{BiographyRecord, DegreeType};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// A row type with a fixed CSV header.
pub trait TableRow: Serialize {
    const TABLE: &'static str;
    const HEADERS: &'static [&'static str];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersonRow {
    pub subject_key: String,
    pub full_name: String,
    pub birthdate: Option<String>,
    pub deathdate: Option<String>,
    pub birthplace: Option<String>,
    pub birthyear: Option<u16>,
    pub deathyear: Option<u16>,
}

impl TableRow for PersonRow {
    const TABLE: &'static str = "personal";
    const HEADERS: &'static [&'static str] = &[
        "subject_key",
        "full_name",
        "birthdate",
        "deathdate",
        "birthplace",
        "birthyear",
        "deathyear",
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DegreeRow {
    pub subject_key: String,
    pub full_name: String,
    pub degree_institution_name: Option<String>,
    pub degree_type: DegreeType,
    pub degree_year: Option<u16>,
    pub degree_advisor: Option<String>,
}

impl TableRow for DegreeRow {
    const TABLE: &'static str = "degrees";
    const HEADERS: &'static [&'static str] = &[
        "subject_key",
        "full_name",
        "degree_institution_name",
        "degree_type",
        "degree_year",
        "degree_advisor",
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmploymentRow {
    pub subject_key: String,
    pub full_name: String,
    pub employer: Option<String>,
    pub job_title: Option<String>,
    pub job_year_begin: Option<u16>,
    pub job_year_end: Option<u16>,
    pub reason_end: Option<String>,
}

impl TableRow for EmploymentRow {
    const TABLE: &'static str = "employment";
    const HEADERS: &'static [&'static str] = &[
        "subject_key",
        "full_name",
        "employer",
        "job_title",
        "job_year_begin",
        "job_year_end",
        "reason_end",
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VisitRow {
    pub subject_key: String,
    pub full_name: String,
    pub visit_location: Option<String>,
    pub visit_reason: Option<String>,
    pub visit_year: Option<u16>,
}

impl TableRow for VisitRow {
    const TABLE: &'static str = "visits";
    const HEADERS: &'static [&'static str] = &[
        "subject_key",
        "full_name",
        "visit_location",
        "visit_reason",
        "visit_year",
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HonorRow {
    pub subject_key: String,
    pub full_name: String,
    pub honor_name: Option<String>,
    pub honor_year: Option<u16>,
}

impl TableRow for HonorRow {
    const TABLE: &'static str = "honors";
    const HEADERS: &'static [&'static str] =
        &["subject_key", "full_name", "honor_name", "honor_year"];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParentRow {
    pub subject_key: String,
    pub full_name: String,
    pub parent_name: Option<String>,
    pub parent_birthdate: Option<String>,
    pub parent_deathdate: Option<String>,
    pub parent_profession: Option<String>,
    pub parent_birthyear: Option<u16>,
    pub parent_deathyear: Option<u16>,
}

impl TableRow for ParentRow {
    const TABLE: &'static str = "parents";
    const HEADERS: &'static [&'static str] = &[
        "subject_key",
        "full_name",
        "parent_name",
        "parent_birthdate",
        "parent_deathdate",
        "parent_profession",
        "parent_birthyear",
        "parent_deathyear",
    ];
}

/// The six row sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSet {
    pub personal: Vec<PersonRow>,
    pub degrees: Vec<DegreeRow>,
    pub employment: Vec<EmploymentRow>,
    pub visits: Vec<VisitRow>,
    pub honors: Vec<HonorRow>,
    pub parents: Vec<ParentRow>,
}

static RE_YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{4})\b").unwrap());

/// First four-digit year in a free-text date (`"March 23, 1882"` → 1882).
pub fn year_of(text: Option<&str>) -> Option<u16> {
    let caps = RE_YEAR.captures(text?)?;
    caps[1].parse::<u16>().ok().filter(|y| *y > 0)
}

/// Flatten records into tables, ordered by subject key.
pub fn normalize_records(records: &[(String, BiographyRecord)]) -> TableSet {
    let mut ordered: Vec<&(String, BiographyRecord)> = records.iter().collect();
    ordered.sort_by(|a, b| a.0.cmp(&b.0));

    let mut t = TableSet::default();
    for (key, r) in ordered {
        t.personal.push(PersonRow {
            subject_key: key.clone(),
            full_name: r.full_name.clone(),
            birthdate: r.birthdate.clone(),
            deathdate: r.deathdate.clone(),
            birthplace: r.birthplace.clone(),
            birthyear: year_of(r.birthdate.as_deref()),
            deathyear: year_of(r.deathdate.as_deref()),
        });

        t.degrees.extend(r.degrees.iter().map(|d| DegreeRow {
            subject_key: key.clone(),
            full_name: r.full_name.clone(),
            degree_institution_name: d.degree_institution_name.clone(),
            degree_type: d.degree_type,
            degree_year: d.degree_year,
            degree_advisor: d.degree_advisor.clone(),
        }));

        t.employment.extend(r.employment.iter().map(|e| EmploymentRow {
            subject_key: key.clone(),
            full_name: r.full_name.clone(),
            employer: e.employer.clone(),
            job_title: e.job_title.clone(),
            job_year_begin: e.job_year_begin,
            job_year_end: e.job_year_end,
            reason_end: e.reason_end.clone(),
        }));

        t.visits.extend(r.visits.iter().map(|v| VisitRow {
            subject_key: key.clone(),
            full_name: r.full_name.clone(),
            visit_location: v.visit_location.clone(),
            visit_reason: v.visit_reason.clone(),
            visit_year: v.visit_year,
        }));

        t.honors.extend(r.honors.iter().map(|h| HonorRow {
            subject_key: key.clone(),
            full_name: r.full_name.clone(),
            honor_name: h.honor_name.clone(),
            honor_year: h.honor_year,
        }));

        t.parents.extend(r.parents.iter().map(|p| ParentRow {
            subject_key: key.clone(),
            full_name: r.full_name.clone(),
            parent_name: p.name.clone(),
            parent_birthdate: p.birthdate.clone(),
            parent_deathdate: p.deathdate.clone(),
            parent_profession: p.profession.clone(),
            parent_birthyear: year_of(p.birthdate.as_deref()),
            parent_deathyear: year_of(p.deathdate.as_deref()),
        }));
    }
    t
}

impl TableSet {
    /// Row count per table name.
    pub fn counts(&self) -> BTreeMap<String, usize> {
        BTreeMap::from([
            (PersonRow::TABLE.to_string(), self.personal.len()),
            (DegreeRow::TABLE.to_string(), self.degrees.len()),
            (EmploymentRow::TABLE.to_string(), self.employment.len()),
            (VisitRow::TABLE.to_string(), self.visits.len()),
            (HonorRow::TABLE.to_string(), self.honors.len()),
            (ParentRow::TABLE.to_string(), self.parents.len()),
        ])
    }

    /// Write `<table>.csv` for every table into `dir`, atomically per file.
    pub async fn write_csv(&self, dir: &Path) -> Result<Vec<OutputRef>, PipelineError> {
        Ok(vec![
            write_table(dir, &self.personal).await?,
            write_table(dir, &self.degrees).await?,
            write_table(dir, &self.employment).await?,
            write_table(dir, &self.visits).await?,
            write_table(dir, &self.honors).await?,
            write_table(dir, &self.parents).await?,
        ])
    }
}

/// Serialise rows to CSV bytes. The header is written even for an empty table.
pub fn to_csv_bytes<R: TableRow>(rows: &[R]) -> Result<Vec<u8>, csv::Error> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    wtr.write_record(R::HEADERS)?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    wtr.into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}

async fn write_table<R: TableRow>(dir: &Path, rows: &[R]) -> Result<OutputRef, PipelineError> {
    let path = dir.join(format!("{}.csv", R::TABLE));
    let bytes = to_csv_bytes(rows).map_err(|source| PipelineError::TableWriteFailed {
        path: path.clone(),
        source,
    })?;
    write_atomic(&path, &bytes).await?;
    Ok(output_ref(R::TABLE, &path, &bytes))
}
