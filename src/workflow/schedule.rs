//! Extraction of cron schedules from workflow definitions.

use serde_yaml::Value;

/// Parses the raw content of a workflow definition into a generic document.
///
/// # Errors
///
/// Returns a [`serde_yaml::Error`] if the content is not valid YAML.
pub fn parse_workflow(content: &str) -> Result<Value, serde_yaml::Error> {
    serde_yaml::from_str(content)
}

/// Extracts the cron expressions under `on.schedule` of a parsed workflow definition, in document
/// order.
///
/// Entries without a string `cron` field are skipped. Any other shape of the document, including
/// one without a trigger section, yields an empty list.
pub fn extract_schedules(document: &Value) -> Vec<String> {
    let Some(entries) = trigger_section(document)
        .and_then(|on| on.get("schedule"))
        .and_then(Value::as_sequence)
    else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| entry.get("cron"))
        .filter_map(Value::as_str)
        .map(str::to_owned)
        .collect()
}

fn trigger_section(document: &Value) -> Option<&Value> {
    // YAML 1.1 emitters may have turned a bare `on` key into `true`
    document
        .get("on")
        .or_else(|| document.as_mapping()?.get(Value::Bool(true)))
}
