use super::MatchTable;

pub struct JsonFormatter;

impl JsonFormatter {
    pub fn format(result: &MatchTable) -> String {
        let rows = result.to_json_rows();
        serde_json::to_string_pretty(&rows).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::tests::sample;

    #[test]
    fn test_json_output() {
        let output = JsonFormatter::format(&sample());
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed[0]["kind"], "ConfigMap");
        assert_eq!(parsed[0]["namespace"], "ns-a");
        assert_eq!(parsed.as_array().unwrap().len(), 2);
    }
}
