//! The structured biography record and its validation rules.
//!
//! Deserializing into [`BiographyRecord`] *is* schema validation: required
//! fields are plain (non-`Option`) fields with no serde default, so a model
//! response that omits one fails with serde's `missing field` error and the
//! extractor retries. Only `full_name` and the five lists are required; every
//! field of a list item is optional, so an item with a null name still becomes
//! a table row. Optional fields go through lenient deserializers that
//! accept the shapes models commonly emit (numbers as strings, `"unknown"` for
//! absent years) but reject values that cannot be coerced without guessing.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One subject's validated biography.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BiographyRecord {
    #[serde(deserialize_with = "required_text")]
    pub full_name: String,
    #[serde(default, deserialize_with = "optional_text")]
    pub birthdate: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub deathdate: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub birthplace: Option<String>,
    pub parents: Vec<Parent>,
    pub employment: Vec<Employment>,
    pub degrees: Vec<Degree>,
    pub visits: Vec<Visit>,
    pub honors: Vec<Honor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parent {
    #[serde(default, deserialize_with = "optional_text")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub birthdate: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub deathdate: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub profession: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employment {
    #[serde(default, deserialize_with = "optional_text")]
    pub employer: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub job_title: Option<String>,
    #[serde(default, deserialize_with = "optional_year")]
    pub job_year_begin: Option<u16>,
    #[serde(default, deserialize_with = "optional_year")]
    pub job_year_end: Option<u16>,
    #[serde(default, deserialize_with = "optional_text")]
    pub reason_end: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Degree {
    #[serde(default, deserialize_with = "optional_text")]
    pub degree_institution_name: Option<String>,
    #[serde(default)]
    pub degree_type: DegreeType,
    #[serde(default, deserialize_with = "optional_year")]
    pub degree_year: Option<u16>,
    #[serde(default, deserialize_with = "optional_text")]
    pub degree_advisor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visit {
    #[serde(default, deserialize_with = "optional_text")]
    pub visit_location: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub visit_reason: Option<String>,
    #[serde(default, deserialize_with = "optional_year")]
    pub visit_year: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Honor {
    #[serde(default, deserialize_with = "optional_text")]
    pub honor_name: Option<String>,
    #[serde(default, deserialize_with = "optional_year")]
    pub honor_year: Option<u16>,
}

/// Degree level, normalised from whatever label the model produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DegreeType {
    BA,
    MA,
    PhD,
    #[default]
    Other,
}

impl DegreeType {
    /// Map a free-text label (`"Ph.D."`, `"A.B."`, `"Master of Arts"`...) to a level.
    pub fn from_label(label: &str) -> Self {
        let compact: String = label
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_uppercase();
        match compact.as_str() {
            "BA" | "AB" | "BACHELOROFARTS" | "BACHELORS" | "BACHELOR" => DegreeType::BA,
            "MA" | "AM" | "MASTEROFARTS" | "MASTERS" | "MASTER" => DegreeType::MA,
            "PHD" | "DPHIL" | "DOCTORATE" | "DOCTOROFPHILOSOPHY" | "DOCTORAL" => DegreeType::PhD,
            _ => DegreeType::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DegreeType::BA => "BA",
            DegreeType::MA => "MA",
            DegreeType::PhD => "PhD",
            DegreeType::Other => "other",
        }
    }
}

impl Serialize for DegreeType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DegreeType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label: Option<String> = Option::deserialize(deserializer)?;
        Ok(label.as_deref().map(DegreeType::from_label).unwrap_or_default())
    }
}

impl BiographyRecord {
    /// Validate a parsed JSON value against the record schema.
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Number of one-to-many rows this record flattens into.
    pub fn child_row_count(&self) -> usize {
        self.parents.len()
            + self.employment.len()
            + self.degrees.len()
            + self.visits.len()
            + self.honors.len()
    }
}

// ── Lenient field deserializers ──────────────────────────────────────────────

/// Scalar shapes a model may emit where we expect text or a year.
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

fn scalar_to_text(s: Scalar) -> Option<String> {
    let text = match s {
        Scalar::Int(i) => i.to_string(),
        Scalar::Float(f) => f.to_string(),
        Scalar::Bool(_) => return None,
        Scalar::Text(t) => t,
    };
    let trimmed = text.trim();
    if trimmed.is_empty() || is_unknown_marker(trimmed) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn is_unknown_marker(s: &str) -> bool {
    matches!(
        s.to_ascii_lowercase().as_str(),
        "null" | "none" | "n/a" | "na" | "unknown" | "-"
    )
}

fn optional_text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let raw: Option<Scalar> = Option::deserialize(d)?;
    Ok(raw.and_then(scalar_to_text))
}

fn required_text<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let raw: Option<Scalar> = Option::deserialize(d)?;
    raw.and_then(scalar_to_text)
        .ok_or_else(|| serde::de::Error::custom("required text field is null or empty"))
}

static RE_DIGIT_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

/// Coerce a year value.
///
/// Integers in 1..=9999 pass; strings with no digits mean "unknown"; strings
/// with exactly one run of one to four digits yield that number (`"c. 1920"`).
/// Anything else, e.g. a range like `"1920-1925"`, is rejected.
pub fn coerce_year(text: &str) -> Result<Option<u16>, String> {
    let runs: Vec<&str> = RE_DIGIT_RUN.find_iter(text).map(|m| m.as_str()).collect();
    match runs.as_slice() {
        [] => Ok(None),
        [run] if run.len() <= 4 => match run.parse::<u16>() {
            Ok(0) => Err(format!("year '{text}' is zero")),
            Ok(y) => Ok(Some(y)),
            Err(e) => Err(format!("year '{text}': {e}")),
        },
        _ => Err(format!("ambiguous year '{text}'")),
    }
}

fn optional_year<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u16>, D::Error> {
    use serde::de::Error;

    let raw: Option<Scalar> = Option::deserialize(d)?;
    match raw {
        None | Some(Scalar::Bool(_)) => Ok(None),
        Some(Scalar::Int(i)) if (1..=9999).contains(&i) => Ok(Some(i as u16)),
        Some(Scalar::Int(i)) => Err(D::Error::custom(format!("year {i} out of range"))),
        Some(Scalar::Float(f)) if f.fract() == 0.0 && (1.0..=9999.0).contains(&f) => {
            Ok(Some(f as u16))
        }
        Some(Scalar::Float(f)) => Err(D::Error::custom(format!("year {f} is not a whole year"))),
        Some(Scalar::Text(t)) => coerce_year(&t).map_err(D::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal() -> serde_json::Value {
        json!({
            "full_name": "Emmy Noether",
            "birthdate": "March 23, 1882",
            "deathdate": null,
            "birthplace": "Erlangen",
            "parents": [],
            "employment": [],
            "degrees": [],
            "visits": [],
            "honors": []
        })
    }

    #[test]
    fn minimal_record_validates() {
        let r = BiographyRecord::from_value(minimal()).unwrap();
        assert_eq!(r.full_name, "Emmy Noether");
        assert_eq!(r.deathdate, None);
        assert_eq!(r.child_row_count(), 0);
    }

    #[test]
    fn missing_list_is_rejected() {
        let mut v = minimal();
        v.as_object_mut().unwrap().remove("honors");
        let err = BiographyRecord::from_value(v).unwrap_err();
        assert!(err.to_string().contains("honors"), "got: {err}");
    }

    #[test]
    fn empty_name_is_rejected() {
        let mut v = minimal();
        v["full_name"] = json!("  ");
        assert!(BiographyRecord::from_value(v).is_err());
    }

    #[test]
    fn nested_items_without_a_name_are_kept() {
        let mut v = minimal();
        v["parents"] = json!([{ "name": null, "profession": "farmer" }]);
        v["honors"] = json!([{ "honor_year": 1932 }]);
        let r = BiographyRecord::from_value(v).unwrap();
        assert_eq!(r.parents[0].name, None);
        assert_eq!(r.parents[0].profession.as_deref(), Some("farmer"));
        assert_eq!(r.honors[0].honor_name, None);
        assert_eq!(r.honors[0].honor_year, Some(1932));
        assert_eq!(r.child_row_count(), 2);
    }

    #[test]
    fn years_are_coerced() {
        let mut v = minimal();
        v["degrees"] = json!([
            { "degree_institution_name": "Erlangen", "degree_type": "Ph.D.", "degree_year": "1907", "degree_advisor": "Paul Gordan" },
            { "degree_institution_name": "Göttingen", "degree_type": "Habilitation", "degree_year": "c. 1919" }
        ]);
        v["honors"] = json!([{ "honor_name": "Ackermann–Teubner Memorial Award", "honor_year": 1932.0 }]);
        v["visits"] = json!([{ "visit_location": "Moscow", "visit_reason": "teaching", "visit_year": "unknown" }]);
        let r = BiographyRecord::from_value(v).unwrap();
        assert_eq!(r.degrees[0].degree_year, Some(1907));
        assert_eq!(r.degrees[0].degree_type, DegreeType::PhD);
        assert_eq!(r.degrees[1].degree_year, Some(1919));
        assert_eq!(r.degrees[1].degree_type, DegreeType::Other);
        assert_eq!(r.honors[0].honor_year, Some(1932));
        assert_eq!(r.visits[0].visit_year, None);
    }

    #[test]
    fn year_ranges_are_rejected() {
        let mut v = minimal();
        v["employment"] = json!([{ "employer": "Bryn Mawr", "job_year_begin": "1933-1935" }]);
        assert!(BiographyRecord::from_value(v).is_err());
        assert!(coerce_year("12345").is_err());
        assert_eq!(coerce_year("").unwrap(), None);
    }

    #[test]
    fn numeric_text_fields_become_strings() {
        let mut v = minimal();
        v["birthdate"] = json!(1882);
        let r = BiographyRecord::from_value(v).unwrap();
        assert_eq!(r.birthdate.as_deref(), Some("1882"));
    }

    #[test]
    fn degree_labels_normalise() {
        assert_eq!(DegreeType::from_label("A.B."), DegreeType::BA);
        assert_eq!(DegreeType::from_label("Master of Arts"), DegreeType::MA);
        assert_eq!(DegreeType::from_label("PhD"), DegreeType::PhD);
        assert_eq!(DegreeType::from_label("M.S."), DegreeType::Other);
    }

    #[test]
    fn serialised_record_reloads_identically() {
        let mut v = minimal();
        v["degrees"] = json!([{ "degree_institution_name": "Erlangen", "degree_type": "PhD", "degree_year": 1907 }]);
        let r = BiographyRecord::from_value(v).unwrap();
        let back: BiographyRecord = serde_json::from_str(&serde_json::to_string(&r).unwrap()).unwrap();
        assert_eq!(back, r);
    }
}
