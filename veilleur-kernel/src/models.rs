use serde::Deserialize;
use std::collections::BTreeMap;

/// Un résultat de check passif, tel que décodé du payload XMLDATA (NRDP).
#[derive(Debug, Clone, Deserialize)]
pub struct CheckResult {
    #[serde(default)]
    pub hostname: String,
    /// Vide pour un check d'hôte
    #[serde(default)]
    pub servicename: String,
    #[serde(default)]
    pub state: i32,
    #[serde(default)]
    pub output: String,
    /// Timestamp Unix (résolution seconde, c'est tout ce que NRDP transporte)
    #[serde(default)]
    pub time: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct CheckResults {
    #[serde(rename = "checkresult", default)]
    pub results: Vec<CheckResult>,
}

/// Décode le document `<checkresults>` d'une soumission NRDP.
pub fn parse_xmldata(xml: &str) -> Result<CheckResults, quick_xml::DeError> {
    quick_xml::de::from_str(xml)
}

pub fn state_label(state: i32) -> String {
    match state {
        0 => "OK".to_string(),
        1 => "WARNING".to_string(),
        2 => "CRITICAL".to_string(),
        3 => "UNKNOWN".to_string(),
        other => format!("STATE_{other}"),
    }
}

/// Résumé compact d'un batch pour les logs, ex: "OK=4,CRITICAL=1"
pub fn summarize(results: &CheckResults) -> String {
    let mut counts: BTreeMap<i32, usize> = BTreeMap::new();
    for r in &results.results {
        *counts.entry(r.state).or_default() += 1;
    }
    counts
        .iter()
        .map(|(state, count)| format!("{}={}", state_label(*state), count))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version='1.0'?>
<checkresults>
  <checkresult type="service" checktype="1">
    <hostname>web1</hostname>
    <servicename>HTTP</servicename>
    <state>0</state>
    <output>HTTP OK - 200 in 0.042s</output>
    <time>1690000000</time>
  </checkresult>
  <checkresult type="host" checktype="1">
    <hostname>web1</hostname>
    <state>0</state>
    <output>PING OK</output>
    <time>1690000000</time>
  </checkresult>
</checkresults>"#;

    #[test]
    fn test_parse_xmldata() {
        let parsed = parse_xmldata(SAMPLE).unwrap();
        assert_eq!(parsed.results.len(), 2);
        assert_eq!(parsed.results[0].hostname, "web1");
        assert_eq!(parsed.results[0].servicename, "HTTP");
        assert_eq!(parsed.results[0].state, 0);
        assert_eq!(parsed.results[0].time, 1690000000);
        // check d'hôte : pas d'élément servicename
        assert!(parsed.results[1].servicename.is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_xmldata("pas du xml").is_err());
    }

    #[test]
    fn test_state_label() {
        assert_eq!(state_label(0), "OK");
        assert_eq!(state_label(2), "CRITICAL");
        assert_eq!(state_label(7), "STATE_7");
    }

    #[test]
    fn test_summarize_counts_states() {
        let parsed = parse_xmldata(SAMPLE).unwrap();
        assert_eq!(summarize(&parsed), "OK=2");
    }
}
