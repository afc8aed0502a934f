//! Canonical text templates, one per source kind.
//!
//! Labels match the ones the embedding pipeline has always received. Absent or
//! blank values render as `-` (a missing fund agency renders as `N/A`).

use std::fmt::Display;

use serde_json::{json, Map, Value};

use super::RegenerationRequest;
use crate::model::{Fund, ManualStep, Scenario, SourceKind, SourceRef, Term};

const MISSING: &str = "-";

/// Request regenerating a fund.
pub fn for_fund(fund: &Fund) -> RegenerationRequest {
    let source = SourceRef::new(SourceKind::Fund, &fund.fund_id);
    let agency = value_or(fund.source_agency.as_ref(), "N/A");
    let text = [
        format!("รหัสทุน: {}", value(Some(&fund.fund_id))),
        format!("ชื่อย่อ: {}", value(Some(&fund.fund_abbr))),
        format!("ชื่อทุน (ไทย): {}", value(fund.fund_name_th.as_ref())),
        format!("ชื่อทุน (อังกฤษ): {}", value(fund.fund_name_en.as_ref())),
        format!("แหล่งทุน: {agency}"),
        format!("ปีงบประมาณ: {}", value(fund.fiscal_year.as_ref())),
        format!(
            "ระยะเวลา: {} ถึง {}",
            value(fund.start_period.as_ref()),
            value(fund.end_period.as_ref())
        ),
        format!("สถานะ: {}", fund.status.as_str()),
    ]
    .join("\n");

    let mut metadata = base_metadata(&source);
    metadata.insert("abbr".into(), opt_json(Some(&fund.fund_abbr)));
    metadata.insert("agency".into(), Value::String(agency));
    metadata.insert("year".into(), json!(fund.fiscal_year));
    RegenerationRequest::new(source, text.trim().to_string(), metadata)
}

/// Request regenerating a manual step.
pub fn for_step(step: &ManualStep) -> RegenerationRequest {
    let source = SourceRef::new(SourceKind::Manual, step.chunk_id);
    let text = [
        format!("หัวข้อ: {}", value(step.topic.as_ref())),
        format!("เนื้อหา: {}", value(step.chunk_content.as_ref())),
        format!("หมวดหมู่หลัก: {}", value(step.category_main.as_ref())),
        format!("หมวดหมู่ย่อย: {}", value(step.category_sub.as_ref())),
        format!("ส่วนงาน/ระเบียบ: {}", value(step.section.as_ref())),
        format!("ชื่อเอกสาร: {}", value(step.document_title.as_ref())),
        format!("ประเภทข้อมูล: {}", value(step.data_type.as_ref())),
        format!("Fund: {}", value(step.fund_abbr.as_ref())),
        format!("Step: {}", value(step.step_number.as_ref())),
    ]
    .join("\n");

    let mut metadata = base_metadata(&source);
    metadata.insert("chunk_id".into(), json!(step.chunk_id));
    metadata.insert("document_title".into(), opt_json(step.document_title.as_ref()));
    metadata.insert("category_main".into(), opt_json(step.category_main.as_ref()));
    RegenerationRequest::new(source, text.trim().to_string(), metadata)
}

/// Request regenerating a support scenario.
pub fn for_scenario(scenario: &Scenario) -> RegenerationRequest {
    let source = SourceRef::new(SourceKind::Scenario, scenario.id);
    let text = [
        format!("Scenario: {}", value(scenario.scenario.as_ref())),
        format!("Solution: {}", value(scenario.solution.as_ref())),
        format!("Tag: {}", value(scenario.tag.as_ref())),
    ]
    .join("\n");

    let mut metadata = base_metadata(&source);
    metadata.insert("parent_id".into(), json!(scenario.id));
    RegenerationRequest::new(source, text.trim().to_string(), metadata)
}

/// Request regenerating a glossary term.
pub fn for_term(term: &Term) -> RegenerationRequest {
    let source = SourceRef::new(SourceKind::Term, &term.word_id);
    let word_type = value_or(term.word_type.as_ref(), "general");
    let text = [
        format!("คำศัพท์: {}", value(term.word.as_ref())),
        format!("ความหมาย: {}", value(term.meaning.as_ref())),
        format!("ประเภท: {word_type}"),
        format!("รหัสคำศัพท์: {}", term.word_id),
    ]
    .join("\n");

    let mut metadata = base_metadata(&source);
    metadata.insert("word_id".into(), Value::String(term.word_id.clone()));
    metadata.insert("word".into(), opt_json(term.word.as_ref()));
    metadata.insert("word_type".into(), Value::String(word_type));
    RegenerationRequest::new(source, text.trim().to_string(), metadata)
}

fn base_metadata(source: &SourceRef) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert(
        "source_table".into(),
        Value::String(source.kind().table().to_string()),
    );
    metadata.insert("source_id".into(), Value::String(source.id().to_string()));
    metadata.insert(
        "type".into(),
        Value::String(source.kind().document_type().to_string()),
    );
    metadata
}

fn value<T: Display>(field: Option<&T>) -> String {
    value_or(field, MISSING)
}

fn value_or<T: Display>(field: Option<&T>, fallback: &str) -> String {
    field
        .map(ToString::to_string)
        .filter(|text| !text.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn opt_json(field: Option<&String>) -> Value {
    match field {
        Some(text) if !text.trim().is_empty() => Value::String(text.clone()),
        _ => Value::Null,
    }
}
