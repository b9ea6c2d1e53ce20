//! LSF job history document
//!
//! When a job id is no longer known to the live lookup, LSF still reports it
//! in `ws/jobhistory`. The history entry only carries free text, so the state
//! is inferred from markers in that text. Only native LSF state names leave
//! this module.

use serde::Deserialize;

use super::HistoryEntry;

#[derive(Debug, Deserialize)]
struct JobHistory {
    #[serde(default)]
    history: Vec<History>,
}

#[derive(Debug, Deserialize)]
struct History {
    #[serde(default)]
    content: String,
    #[serde(rename = "timeSummary", default)]
    time_summary: Option<TimeSummary>,
}

#[derive(Debug, Deserialize)]
struct TimeSummary {
    #[serde(rename = "timeOfCalculation", default)]
    time_of_calculation: Option<String>,
}

/// Native state implied by a history entry's free text
pub(crate) fn state_from_content(content: &str) -> &'static str {
    let last = content.split(' ').next_back().unwrap_or_default();
    if last.contains("CSM_ALLOCATION_ID=") {
        return "RUN";
    }
    if content.contains("Done successfully.") {
        return "DONE";
    }
    if content.contains("Completed <exit>") {
        if content.contains("<KILL>") {
            return "KILL";
        }
        return "EXIT";
    }
    "UNKNOWN"
}

/// Parse the first entry of a `jobHistory` document
pub(crate) fn parse(xml: &str) -> Result<Option<HistoryEntry>, quick_xml::DeError> {
    let doc: JobHistory = quick_xml::de::from_str(xml)?;
    Ok(doc.history.into_iter().next().map(|entry| HistoryEntry {
        native_state: state_from_content(&entry.content).to_string(),
        time: entry
            .time_summary
            .and_then(|t| t.time_of_calculation)
            .filter(|t| !t.is_empty()),
    }))
}
