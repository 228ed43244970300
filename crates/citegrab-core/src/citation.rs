use serde::Serialize;

/// What a delivered citation body contains, for notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CitationSummary {
    /// Citation keys in document order. Empty when the body did not parse.
    pub keys: Vec<String>,
    pub bytes: usize,
}

impl CitationSummary {
    /// Short human-readable label: the keys, or the byte count.
    pub fn label(&self) -> String {
        if self.keys.is_empty() {
            format!("{} bytes", self.bytes)
        } else {
            self.keys.join(", ")
        }
    }
}

/// Summarize a BibTeX body. Unparsable bodies still get a byte count.
pub fn summarize(body: &str) -> CitationSummary {
    let keys = match biblatex::Bibliography::parse(body) {
        Ok(bibliography) => bibliography.iter().map(|entry| entry.key.clone()).collect(),
        Err(e) => {
            tracing::debug!(error = %e, "citation body is not valid BibTeX");
            Vec::new()
        }
    };
    CitationSummary {
        keys,
        bytes: body.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_keys() {
        let body = "@article{vaswani2017attention,\n  title={Attention is all you need},\n  author={Vaswani, Ashish},\n  year={2017}\n}\n";
        let summary = summarize(body);
        assert_eq!(summary.keys, vec!["vaswani2017attention".to_string()]);
        assert_eq!(summary.bytes, body.len());
        assert_eq!(summary.label(), "vaswani2017attention");
    }

    #[test]
    fn garbage_is_counted_not_rejected() {
        let summary = summarize("@article{");
        assert!(summary.keys.is_empty());
        assert_eq!(summary.label(), "9 bytes");
    }
}
