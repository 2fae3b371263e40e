use super::MatchTable;

pub struct CsvFormatter;

impl CsvFormatter {
    pub fn format(result: &MatchTable, no_headers: bool) -> String {
        let mut lines = Vec::new();

        if !no_headers {
            lines.push(result.columns.join(","));
        }

        for row in &result.rows {
            let escaped: Vec<String> = row.iter().map(|val| escape(val)).collect();
            lines.push(escaped.join(","));
        }

        lines.join("\n")
    }
}

fn escape(val: &str) -> String {
    if val.contains(',') || val.contains('"') || val.contains('\n') {
        format!("\"{}\"", val.replace('"', "\"\""))
    } else {
        val.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::tests::sample;

    #[test]
    fn test_escape() {
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape("a,b"), "\"a,b\"");
        assert_eq!(escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_csv_output() {
        let output = CsvFormatter::format(&sample(), false);
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines[0], "KIND,NAMESPACE,NAME,MESSAGE");
        assert_eq!(lines[1], "ConfigMap,ns-a,tmp-1,\"stale, unused\"");
        assert_eq!(lines[2], "ConfigMap,ns-b,tmp-2,");
    }

    #[test]
    fn test_csv_no_headers() {
        let output = CsvFormatter::format(&sample(), true);
        assert_eq!(output.lines().count(), 2);
        assert!(output.starts_with("ConfigMap"));
    }
}
