//! Prompts for structured biography extraction.
//!
//! Every prompt lives here so a wording change is a single edit, and so the
//! tests can check the schema description against [`crate::record`] without a
//! model. A change to either constant changes what the model returns, so bump
//! the `extract_structure` code version alongside it.
//!
//! Callers can override the system prompt via
//! [`crate::config::PipelineConfig::system_prompt`].

/// Default system prompt. Used when `PipelineConfig::system_prompt` is `None`.
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are an AI that extracts structured data from text, returning a JSON object and no other text.";

/// Field list the model is asked to fill.
///
/// Key names must match the serde names in [`crate::record::BiographyRecord`].
pub const SCHEMA_DESCRIPTION: &str = r#"Given the following biographical summary, return the following data in JSON format:
- full_name
- birthdate
- deathdate
- birthplace
- parents: [List of Parents]
- employment: [List of Employment]
- degrees: [List of Degrees]
- visits: [List of Visits]
- honors: [List of Honors]

where each Parent is a JSON object with keys
- name
- birthdate
- deathdate
- profession

Employment is a JSON object with keys
- employer
- job_title
- job_year_begin
- job_year_end
- reason_end

Degree is a JSON object with keys
- degree_institution_name
- degree_type (eg: BA, MA, PhD)
- degree_year
- degree_advisor

Visit is a JSON object with keys:
- visit_location
- visit_reason
- visit_year

Honors is a JSON object with keys:
- honor_name
- honor_year

Use null for any value the text does not state. Use an empty list when the
text mentions none of a list's items. Years are four-digit integers."#;

/// Build the user prompt for one subject's transcript.
pub fn build_prompt(transcript: &str) -> String {
    format!("{SCHEMA_DESCRIPTION}\n\n---\n{transcript}")
}
