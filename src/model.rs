//! Administrative record types shared by the store, coordinator and HTTP layer.
//!
//! Field names follow the column names of the existing tables so the JSON
//! payloads stay compatible with current clients.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::tags::TagSet;

/// Entity kinds that own derived embedding records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Funding source (`funds`).
    Fund,
    /// Procedural guide step (`manual`).
    Manual,
    /// Support scenario (`scenario`).
    Scenario,
    /// Glossary term (`term`).
    Term,
}

impl SourceKind {
    /// All kinds, in declaration order.
    pub const ALL: [SourceKind; 4] = [
        SourceKind::Fund,
        SourceKind::Manual,
        SourceKind::Scenario,
        SourceKind::Term,
    ];

    /// Table name written to `metadata.source_table`.
    pub fn table(self) -> &'static str {
        match self {
            SourceKind::Fund => "funds",
            SourceKind::Manual => "manual",
            SourceKind::Scenario => "scenario",
            SourceKind::Term => "term",
        }
    }

    /// Key used by the nested `metadata.Metadata.<key>` addressing shape.
    pub fn legacy_key(self) -> &'static str {
        match self {
            SourceKind::Fund => "source_id",
            SourceKind::Manual => "chunk_id",
            SourceKind::Scenario => "parent_id",
            SourceKind::Term => "word_id",
        }
    }

    /// Document type tag understood by the regeneration pipeline.
    pub fn document_type(self) -> &'static str {
        match self {
            SourceKind::Fund => "fund_source",
            SourceKind::Manual => "manual_guide",
            SourceKind::Scenario => "support_story",
            SourceKind::Term => "glossary",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "fund" | "funds" => Ok(SourceKind::Fund),
            "manual" | "manuals" | "step" => Ok(SourceKind::Manual),
            "scenario" | "scenarios" => Ok(SourceKind::Scenario),
            "term" | "terms" => Ok(SourceKind::Term),
            other => Err(format!("unknown source kind `{other}`")),
        }
    }
}

/// Address of one source entity: `(source_table, source_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceRef {
    kind: SourceKind,
    id: String,
}

impl SourceRef {
    /// Builds an address from any id that renders as text.
    pub fn new(kind: SourceKind, id: impl ToString) -> Self {
        Self {
            kind,
            id: id.to_string(),
        }
    }

    /// Entity kind.
    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Id rendered as text, the form stored in embedding metadata.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.table(), self.id)
    }
}

/// Fund availability flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FundStatus {
    /// Fund is open.
    #[default]
    Enable,
    /// Fund is closed.
    Disable,
}

impl FundStatus {
    /// Column value.
    pub fn as_str(self) -> &'static str {
        match self {
            FundStatus::Enable => "enable",
            FundStatus::Disable => "disable",
        }
    }

    /// Strict parse used for filters.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "enable" => Some(FundStatus::Enable),
            "disable" => Some(FundStatus::Disable),
            _ => None,
        }
    }

    /// Lenient read of a stored column; anything but `disable` is enabled.
    pub fn from_column(value: Option<&str>) -> Self {
        match value {
            Some("disable") => FundStatus::Disable,
            _ => FundStatus::Enable,
        }
    }
}

/// Funding source row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fund {
    /// Generated key, `F-NNN`.
    pub fund_id: String,
    /// Short token referenced by manual steps.
    pub fund_abbr: String,
    /// Thai display name.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub fund_name_th: Option<String>,
    /// English display name.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub fund_name_en: Option<String>,
    /// Fiscal year (Buddhist or Gregorian, as entered).
    #[serde(default, deserialize_with = "de::opt_int")]
    pub fiscal_year: Option<i32>,
    /// Granting agency.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub source_agency: Option<String>,
    /// Validity start.
    #[serde(default, deserialize_with = "de::opt_date")]
    pub start_period: Option<NaiveDate>,
    /// Validity end.
    #[serde(default, deserialize_with = "de::opt_date")]
    pub end_period: Option<NaiveDate>,
    /// Availability.
    #[serde(default)]
    pub status: FundStatus,
}

/// Fund payload without an id, used on create.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FundDraft {
    /// Short token referenced by manual steps.
    #[serde(default)]
    pub fund_abbr: String,
    /// Thai display name.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub fund_name_th: Option<String>,
    /// English display name.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub fund_name_en: Option<String>,
    /// Fiscal year.
    #[serde(default, deserialize_with = "de::opt_int")]
    pub fiscal_year: Option<i32>,
    /// Granting agency.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub source_agency: Option<String>,
    /// Validity start.
    #[serde(default, deserialize_with = "de::opt_date")]
    pub start_period: Option<NaiveDate>,
    /// Validity end.
    #[serde(default, deserialize_with = "de::opt_date")]
    pub end_period: Option<NaiveDate>,
    /// Availability.
    #[serde(default)]
    pub status: FundStatus,
}

impl FundDraft {
    /// Attaches a generated id.
    pub fn into_fund(self, fund_id: String) -> Fund {
        Fund {
            fund_id,
            fund_abbr: self.fund_abbr,
            fund_name_th: self.fund_name_th,
            fund_name_en: self.fund_name_en,
            fiscal_year: self.fiscal_year,
            source_agency: self.source_agency,
            start_period: self.start_period,
            end_period: self.end_period,
            status: self.status,
        }
    }
}

/// One step of a procedural guide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualStep {
    /// Surrogate key.
    pub chunk_id: i32,
    /// Guide title.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub document_title: Option<String>,
    /// Main category.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub category_main: Option<String>,
    /// Sub category.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub category_sub: Option<String>,
    /// Position inside the guide.
    #[serde(default, deserialize_with = "de::opt_int")]
    pub step_number: Option<i32>,
    /// Step heading.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub topic: Option<String>,
    /// Step body.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub chunk_content: Option<String>,
    /// Raw fund reference list; see [`TagSet`].
    #[serde(default, deserialize_with = "de::opt_text")]
    pub fund_abbr: Option<String>,
    /// Department or regulation section.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub section: Option<String>,
    /// Data type label.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub data_type: Option<String>,
}

impl ManualStep {
    /// Parsed fund references.
    pub fn fund_tags(&self) -> TagSet {
        TagSet::parse(self.fund_abbr.as_deref())
    }

    pub(crate) fn required_fields(&self) -> [(&'static str, &Option<String>); 5] {
        [
            ("document_title", &self.document_title),
            ("category_main", &self.category_main),
            ("category_sub", &self.category_sub),
            ("topic", &self.topic),
            ("chunk_content", &self.chunk_content),
        ]
    }
}

/// Manual step payload without an id, used on create.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepDraft {
    /// Guide title.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub document_title: Option<String>,
    /// Main category.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub category_main: Option<String>,
    /// Sub category.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub category_sub: Option<String>,
    /// Position inside the guide.
    #[serde(default, deserialize_with = "de::opt_int")]
    pub step_number: Option<i32>,
    /// Step heading.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub topic: Option<String>,
    /// Step body.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub chunk_content: Option<String>,
    /// Raw fund reference list.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub fund_abbr: Option<String>,
    /// Department or regulation section.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub section: Option<String>,
    /// Data type label.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub data_type: Option<String>,
}

impl StepDraft {
    pub(crate) fn required_fields(&self) -> [(&'static str, &Option<String>); 5] {
        [
            ("document_title", &self.document_title),
            ("category_main", &self.category_main),
            ("category_sub", &self.category_sub),
            ("topic", &self.topic),
            ("chunk_content", &self.chunk_content),
        ]
    }

    /// Attaches a store-assigned id.
    pub fn into_step(self, chunk_id: i32) -> ManualStep {
        ManualStep {
            chunk_id,
            document_title: self.document_title,
            category_main: self.category_main,
            category_sub: self.category_sub,
            step_number: self.step_number,
            topic: self.topic,
            chunk_content: self.chunk_content,
            fund_abbr: self.fund_abbr,
            section: self.section,
            data_type: self.data_type,
        }
    }
}

/// Support scenario with its recommended solution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    /// Surrogate key.
    pub id: i32,
    /// Short name.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub scenario_name: Option<String>,
    /// Free-form grouping tag.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub tag: Option<String>,
    /// Problem description.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub scenario: Option<String>,
    /// Recommended answer.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub solution: Option<String>,
}

/// Scenario payload without an id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioDraft {
    /// Short name.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub scenario_name: Option<String>,
    /// Free-form grouping tag.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub tag: Option<String>,
    /// Problem description.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub scenario: Option<String>,
    /// Recommended answer.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub solution: Option<String>,
}

impl ScenarioDraft {
    /// Attaches a store-assigned id.
    pub fn into_scenario(self, id: i32) -> Scenario {
        Scenario {
            id,
            scenario_name: self.scenario_name,
            tag: self.tag,
            scenario: self.scenario,
            solution: self.solution,
        }
    }
}

/// Glossary entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Term {
    /// Generated key, `W-NNN`.
    pub word_id: String,
    /// Headword.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub word: Option<String>,
    /// Definition.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub meaning: Option<String>,
    /// Word category.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub word_type: Option<String>,
}

/// Glossary payload without an id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TermDraft {
    /// Headword.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub word: Option<String>,
    /// Definition.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub meaning: Option<String>,
    /// Word category.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub word_type: Option<String>,
}

impl TermDraft {
    /// Attaches a generated id.
    pub fn into_term(self, word_id: String) -> Term {
        Term {
            word_id,
            word: self.word,
            meaning: self.meaning,
            word_type: self.word_type,
        }
    }
}

/// Glossary listing plus the distinct word types in use.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TermListing {
    /// Matching terms ordered by id.
    pub terms: Vec<Term>,
    /// Distinct non-empty word types, sorted.
    pub types: Vec<String>,
}

/// Frequently asked question. Not embedded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Faq {
    /// Surrogate key.
    pub id: i32,
    /// Question text.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub question: Option<String>,
    /// Answer text.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub answer: Option<String>,
}

/// FAQ payload without an id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaqDraft {
    /// Question text.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub question: Option<String>,
    /// Answer text.
    #[serde(default, deserialize_with = "de::opt_text")]
    pub answer: Option<String>,
}

/// Fund list filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FundQuery {
    /// Case-insensitive text over abbreviation, Thai name and agency.
    pub search: Option<String>,
    /// Status conditions, all of which must hold. Conflicting entries match nothing.
    pub statuses: Vec<FundStatus>,
}

impl FundQuery {
    /// Builds a query from the `search` and `filter` request parameters.
    ///
    /// The leftmost `status:enable` / `status:disable` token inside `search` is
    /// lifted out as a status condition. An explicit `filter=enable|disable`
    /// adds a second condition; `filter=all` adds none.
    pub fn from_params(search: Option<&str>, filter: Option<&str>) -> Self {
        let mut text = search.unwrap_or_default().to_string();
        let mut statuses = Vec::new();
        let inline = [FundStatus::Enable, FundStatus::Disable]
            .into_iter()
            .filter_map(|candidate| {
                let marker = format!("status:{}", candidate.as_str());
                text.find(&marker).map(|pos| (pos, marker.len(), candidate))
            })
            .min_by_key(|(pos, _, _)| *pos);
        if let Some((pos, len, candidate)) = inline {
            text.replace_range(pos..pos + len, "");
            statuses.push(candidate);
        }
        if let Some(explicit) = filter.and_then(FundStatus::parse) {
            statuses.push(explicit);
        }
        let text = text.trim();
        Self {
            search: (!text.is_empty()).then(|| text.to_string()),
            statuses,
        }
    }

    /// Whether `status` satisfies every status condition.
    pub fn admits(&self, status: FundStatus) -> bool {
        self.statuses.iter().all(|wanted| *wanted == status)
    }
}

/// Manual step list filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepQuery {
    /// Case-insensitive text over every text column.
    pub search: Option<String>,
    /// Exact guide title.
    pub document_title: Option<String>,
}

/// Scenario list filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScenarioQuery {
    /// Case-insensitive text over name and description.
    pub search: Option<String>,
    /// Exact tag.
    pub tag: Option<String>,
}

/// Returns the trimmed value when it holds any non-blank text.
pub(crate) fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Lenient deserializers for form-style payloads where `""` means absent.
mod de {
    use chrono::NaiveDate;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Loose {
        Int(i64),
        Float(f64),
        Text(String),
    }

    pub fn opt_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: Option<Loose> = Option::deserialize(deserializer)?;
        Ok(match value {
            None => None,
            Some(Loose::Text(text)) if text.trim().is_empty() => None,
            Some(Loose::Text(text)) => Some(text),
            Some(Loose::Int(num)) => Some(num.to_string()),
            Some(Loose::Float(num)) => Some(num.to_string()),
        })
    }

    pub fn opt_int<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: Option<Loose> = Option::deserialize(deserializer)?;
        match value {
            None => Ok(None),
            Some(Loose::Int(num)) => i32::try_from(num)
                .map(Some)
                .map_err(|_| D::Error::custom(format!("{num} is out of range"))),
            Some(Loose::Float(num))
                if num.fract() == 0.0
                    && num >= f64::from(i32::MIN)
                    && num <= f64::from(i32::MAX) =>
            {
                Ok(Some(num as i32))
            }
            Some(Loose::Float(num)) if num.fract() == 0.0 => {
                Err(D::Error::custom(format!("{num} is out of range")))
            }
            Some(Loose::Float(num)) => Err(D::Error::custom(format!("{num} is not an integer"))),
            Some(Loose::Text(text)) if text.trim().is_empty() => Ok(None),
            Some(Loose::Text(text)) => text
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| D::Error::custom(format!("`{text}` is not an integer"))),
        }
    }

    pub fn opt_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: Option<String> = Option::deserialize(deserializer)?;
        let Some(text) = value else {
            return Ok(None);
        };
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        // accept full timestamps such as `2025-01-31T00:00:00.000Z`
        let day = text.get(..10).unwrap_or(text);
        NaiveDate::parse_from_str(day, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| D::Error::custom(format!("`{text}` is not a YYYY-MM-DD date")))
    }
}
