//! Lenient reading of the model's structured thread analysis.

use serde_json::{Map, Value};
use subdigest_core::{ConceptNote, PostAnalysis};

/// Stand-in for a field the model left out or mistyped.
pub const MISSING_FIELD: &str = "N/A";

const MAX_CATEGORIES: usize = 3;

/// Finds the outermost `{...}` in `raw`, so fenced or chatty replies still parse.
fn json_object(raw: &str) -> Option<Map<String, Value>> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    match serde_json::from_str(&raw[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn text_field(map: &Map<String, Value>, key: &str) -> String {
    map.get(key)
        .and_then(scalar_text)
        .unwrap_or_else(|| MISSING_FIELD.to_string())
}

fn concept(value: &Value) -> Option<ConceptNote> {
    let map = value.as_object()?;
    Some(ConceptNote {
        name: text_field(map, "name"),
        definition: text_field(map, "definition"),
        use_case: text_field(map, "use_case"),
        how_it_functions: text_field(map, "how_it_functions"),
    })
}

/// Parses the analysis object. Returns `None` when the reply holds no JSON
/// object at all; otherwise missing or mistyped fields fall back to
/// [`MISSING_FIELD`] and non-scalar categories are dropped.
pub fn parse_analysis(raw: &str) -> Option<PostAnalysis> {
    let map = json_object(raw)?;

    let (problem_explanation, primary_concepts) = match map.get("problem_explanation") {
        Some(Value::Object(pe)) => (
            text_field(pe, "explanation"),
            pe.get("primary_concepts")
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(concept).collect())
                .unwrap_or_default(),
        ),
        Some(other) => (
            scalar_text(other).unwrap_or_else(|| MISSING_FIELD.to_string()),
            Vec::new(),
        ),
        None => (MISSING_FIELD.to_string(), Vec::new()),
    };

    // Some models nest this one despite being asked for a string.
    let solution_explanation = match map.get("solution_explanation") {
        Some(Value::Object(nested)) => Value::Object(nested.clone()).to_string(),
        _ => text_field(&map, "solution_explanation"),
    };

    let suggested_categories = map
        .get("suggested_categories")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(scalar_text)
                .filter(|c| !c.is_empty())
                .take(MAX_CATEGORIES)
                .collect()
        })
        .unwrap_or_default();

    Some(PostAnalysis {
        problem_summary: text_field(&map, "problem_summary"),
        problem_explanation,
        primary_concepts,
        solution_summary: text_field(&map, "solution_summary"),
        solution_explanation,
        suggested_categories,
    })
}

/// Plain-text summary stored next to the structured columns.
pub fn summary_text(analysis: &PostAnalysis) -> String {
    format!(
        "Problem: {}\nSolution: {}",
        analysis.problem_summary, analysis.solution_summary
    )
}
