mod csv;
mod json;
mod table;
mod yaml;

pub use csv::CsvFormatter;
pub use json::JsonFormatter;
pub use table::TableFormatter;
pub use yaml::YamlFormatter;

use serde_json::{Map, Value};

use crate::cli::OutputFormat;
use crate::policy::MatchResult;

/// Column names of a match listing
pub const MATCH_COLUMNS: &[&str] = &["KIND", "NAMESPACE", "NAME", "MESSAGE"];

/// Rows of matched resources, ready to be rendered
#[derive(Debug, Clone)]
pub struct MatchTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl MatchTable {
    /// Build a listing sorted by kind, namespace and name
    pub fn from_matches(matches: &[MatchResult]) -> Self {
        let mut sorted: Vec<&MatchResult> = matches.iter().collect();
        sorted.sort_by(|a, b| a.candidate.key().cmp(&b.candidate.key()));

        let rows = sorted
            .into_iter()
            .map(|m| {
                vec![
                    m.candidate.kind.clone(),
                    m.candidate.namespace.clone().unwrap_or_default(),
                    m.candidate.name.clone(),
                    m.message.clone(),
                ]
            })
            .collect();

        Self {
            columns: MATCH_COLUMNS.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    pub fn format(&self, format: OutputFormat, no_headers: bool) -> String {
        match format {
            OutputFormat::Table => TableFormatter::format(self, no_headers),
            OutputFormat::Json => JsonFormatter::format(self),
            OutputFormat::Csv => CsvFormatter::format(self, no_headers),
            OutputFormat::Yaml => YamlFormatter::format(self),
        }
    }

    /// One object per row keyed by lowercased column name
    fn to_json_rows(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row)
                    .map(|(col, val)| (col.to_lowercase(), Value::String(val.clone())))
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Candidate;
    use serde_json::json;

    pub(super) fn sample() -> MatchTable {
        let configmap = |ns: &str, name: &str, message: &str| MatchResult {
            candidate: Candidate::from_object(
                "v1",
                "ConfigMap",
                json!({ "metadata": { "name": name, "namespace": ns } }),
            ),
            matched: true,
            message: message.to_string(),
        };
        MatchTable::from_matches(&[
            configmap("ns-b", "tmp-2", ""),
            configmap("ns-a", "tmp-1", "stale, unused"),
        ])
    }

    #[test]
    fn test_rows_are_sorted() {
        let table = sample();
        assert_eq!(table.columns, MATCH_COLUMNS);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0], vec!["ConfigMap", "ns-a", "tmp-1", "stale, unused"]);
        assert_eq!(table.rows[1][1], "ns-b");
    }

    #[test]
    fn test_json_rows() {
        let rows = sample().to_json_rows();
        assert_eq!(rows[0]["name"], "tmp-1");
        assert_eq!(rows[1]["message"], "");
    }

    #[test]
    fn test_cluster_scoped_namespace_is_blank() {
        let table = MatchTable::from_matches(&[MatchResult {
            candidate: Candidate::from_object(
                "v1",
                "Namespace",
                json!({ "metadata": { "name": "scratch" } }),
            ),
            matched: true,
            message: String::new(),
        }]);
        assert_eq!(table.rows[0], vec!["Namespace", "", "scratch", ""]);
    }
}
