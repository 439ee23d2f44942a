//! Exploit-prediction score sync.
//!
//! When findings reference CVE ids, the coordinator opportunistically
//! refreshes their EPSS probability/percentile from the public API so the
//! dashboard can rank by real-world exploitability. Entirely best-effort: a
//! failed sync logs a warning and the scan continues.

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};
use vigil_core::EpssRecord;

use crate::storage::Storage;

pub const DEFAULT_EPSS_API: &str = "https://api.first.org/data/v1/epss";

#[derive(Deserialize)]
struct EpssResponse {
    #[serde(default)]
    data: Vec<EpssEntry>,
}

/// The API returns numeric fields as strings.
#[derive(Deserialize)]
struct EpssEntry {
    cve: String,
    epss: String,
    percentile: String,
}

/// Fetch and upsert scores for the given CVE ids. Returns how many records
/// were refreshed.
pub async fn sync_exploit_scores(
    storage: &Storage,
    client: &reqwest::Client,
    api_base: &str,
    cve_ids: &[String],
) -> usize {
    if cve_ids.is_empty() {
        return 0;
    }

    let url = format!("{}?cve={}", api_base, cve_ids.join(","));
    let response = match client.get(&url).send().await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "exploit score fetch failed");
            return 0;
        }
    };

    let parsed: EpssResponse = match response.json().await {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "exploit score response unparseable");
            return 0;
        }
    };

    let mut refreshed = 0;
    for entry in parsed.data {
        let record = EpssRecord {
            cve_id: entry.cve,
            probability: entry.epss.parse().unwrap_or(0.0),
            percentile: entry.percentile.parse().unwrap_or(0.0),
            last_updated: Utc::now(),
        };
        match storage.upsert_epss(&record).await {
            Ok(()) => refreshed += 1,
            Err(e) => warn!(cve = %record.cve_id, error = %e, "exploit score upsert failed"),
        }
    }

    info!(requested = cve_ids.len(), refreshed, "exploit score sync complete");
    refreshed
}

/// CVE ids referenced by a batch of findings (rule ids of the form
/// `CVE-…`).
pub fn collect_cve_ids(findings: &[vigil_core::NormalizedFinding]) -> Vec<String> {
    findings
        .iter()
        .filter_map(|f| f.rule_id.as_deref())
        .filter(|rule| rule.starts_with("CVE-"))
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::NormalizedFinding;

    fn finding(rule_id: Option<&str>) -> NormalizedFinding {
        NormalizedFinding {
            tool: "Trivy".to_string(),
            rule_id: rule_id.map(String::from),
            message: String::new(),
            file: "Cargo.lock".to_string(),
            line: 0,
            dast_endpoint: None,
            snippet: String::new(),
        }
    }

    #[test]
    fn collects_only_cve_rule_ids() {
        let findings = vec![
            finding(Some("CVE-2024-1234")),
            finding(Some("sql-injection")),
            finding(None),
            finding(Some("CVE-2023-9999")),
        ];
        assert_eq!(
            collect_cve_ids(&findings),
            vec!["CVE-2024-1234".to_string(), "CVE-2023-9999".to_string()]
        );
    }

    #[test]
    fn epss_response_parses_string_numbers() {
        let json = r#"{"data": [{"cve": "CVE-2024-1234", "epss": "0.42", "percentile": "0.97", "date": "2026-08-01"}]}"#;
        let parsed: EpssResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.data.len(), 1);
        assert_eq!(parsed.data[0].cve, "CVE-2024-1234");
        assert_eq!(parsed.data[0].epss, "0.42");
    }

    #[test]
    fn empty_response_yields_no_entries() {
        let parsed: EpssResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.data.is_empty());
    }
}
