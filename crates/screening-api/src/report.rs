use serde::{Deserialize, Serialize};

use crate::gateway::hit_rate;
use crate::health::now_rfc3339;

/// Screened input echoed back in a report; accepts both API and bulk CSV field names.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReportInput {
    #[serde(alias = "nombre")]
    pub name: Option<String>,
    #[serde(alias = "document_number", alias = "cedula")]
    pub document: Option<String>,
    #[serde(alias = "pais")]
    pub country: Option<String>,
    #[serde(alias = "nacionalidad")]
    pub nationality: Option<String>,
    #[serde(alias = "fecha_nacimiento")]
    pub date_of_birth: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReportConfidence {
    pub overall: f64,
    pub name: f64,
    pub document: f64,
    pub dob: f64,
    pub nationality: f64,
    pub address: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReportEntity {
    pub id: Option<String>,
    pub source: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "type", alias = "entity_type")]
    pub entity_type: Option<String>,
    pub program: Option<String>,
    pub countries: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReportMatch {
    pub matched_name: Option<String>,
    pub recommendation: Option<String>,
    pub match_layer: Option<u8>,
    pub flags: Vec<String>,
    pub entity: ReportEntity,
    pub confidence: Option<ReportConfidence>,
}

/// Outcome-shaped payload as sent back by clients; every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReportScreening {
    pub screening_id: Option<String>,
    pub screening_date: Option<String>,
    pub is_hit: bool,
    pub hit_count: usize,
    pub processing_time_ms: Option<u64>,
    pub algorithm_version: Option<String>,
    pub input: ReportInput,
    pub matches: Vec<ReportMatch>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportRequest {
    pub screening_data: ReportScreening,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkReportRequest {
    #[serde(default)]
    pub results: Vec<ReportScreening>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReportType {
    Individual,
    Bulk,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportResponse {
    pub success: bool,
    pub html_content: String,
    pub report_type: ReportType,
    pub generated_at: String,
}

impl ReportResponse {
    fn new(report_type: ReportType, html_content: String, generated_at: String) -> Self {
        Self { success: true, html_content, report_type, generated_at }
    }
}

const STYLE: &str = "body{font-family:Helvetica,Arial,sans-serif;margin:2em;color:#222}\
table{border-collapse:collapse;width:100%;margin-top:1em}\
th,td{border:1px solid #ccc;padding:4px 8px;text-align:left}\
th{background:#f0f0f0}.hit{color:#b00020;font-weight:bold}.clear{color:#1b5e20;font-weight:bold}";

#[must_use]
pub fn html_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn text(value: Option<&str>) -> String {
    value.map_or_else(|| "-".to_string(), html_escape)
}

fn percent(value: f64) -> String {
    format!("{:.1}%", value.clamp(0.0, 100.0))
}

fn document(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <title>{title}</title>\n<style>{STYLE}</style>\n</head>\n<body>\n{body}</body>\n</html>\n"
    )
}

/// Render one screening outcome as a self-contained HTML page.
#[must_use]
pub fn render_individual(screening: &ReportScreening) -> ReportResponse {
    let generated_at = now_rfc3339();
    let input = &screening.input;
    let mut body = String::new();

    body.push_str("<h1>Sanctions Screening Report</h1>\n");
    body.push_str(&format!(
        "<p>Screening ID: <code>{}</code><br>Generated: {}<br>Screened: {}</p>\n",
        text(screening.screening_id.as_deref()),
        html_escape(&generated_at),
        text(screening.screening_date.as_deref()),
    ));

    body.push_str("<h2>Subject</h2>\n<table>\n<tbody>\n");
    for (label, value) in [
        ("Name", &input.name),
        ("Document", &input.document),
        ("Country", &input.country),
        ("Nationality", &input.nationality),
        ("Date of birth", &input.date_of_birth),
    ] {
        body.push_str(&format!("<tr><th>{label}</th><td>{}</td></tr>\n", text(value.as_deref())));
    }
    body.push_str("</tbody>\n</table>\n");

    if screening.is_hit {
        body.push_str(&format!(
            "<h2 class=\"hit\">POTENTIAL MATCH: {} hit(s)</h2>\n",
            screening.hit_count
        ));
    } else {
        body.push_str("<h2 class=\"clear\">NO MATCHES FOUND</h2>\n");
    }

    if !screening.matches.is_empty() {
        body.push_str(
            "<table>\n<thead>\n<tr><th>Matched name</th><th>Source</th><th>ID</th>\
             <th>Program</th><th>Recommendation</th><th>Layer</th><th>Overall</th>\
             <th>Name</th><th>Document</th><th>DOB</th><th>Nationality</th><th>Flags</th></tr>\n\
             </thead>\n<tbody>\n",
        );
        for record in &screening.matches {
            let confidence = record.confidence.clone().unwrap_or_default();
            let matched_name = record.matched_name.as_deref().or(record.entity.name.as_deref());
            body.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td>\
                 <td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                text(matched_name),
                text(record.entity.source.as_deref()),
                text(record.entity.id.as_deref()),
                text(record.entity.program.as_deref()),
                text(record.recommendation.as_deref()),
                record.match_layer.map_or_else(|| "-".to_string(), |layer| layer.to_string()),
                percent(confidence.overall),
                percent(confidence.name),
                percent(confidence.document),
                percent(confidence.dob),
                percent(confidence.nationality),
                html_escape(&record.flags.join(", ")),
            ));
        }
        body.push_str("</tbody>\n</table>\n");
    }

    if let Some(version) = screening.algorithm_version.as_deref() {
        body.push_str(&format!("<p>Algorithm version {}</p>\n", html_escape(version)));
    }

    ReportResponse::new(
        ReportType::Individual,
        document("Sanctions Screening Report", &body),
        generated_at,
    )
}

/// Render a summary table over many outcomes.
#[must_use]
pub fn render_bulk(results: &[ReportScreening]) -> ReportResponse {
    let generated_at = now_rfc3339();
    let total = results.len();
    let hits = results.iter().filter(|result| result.is_hit).count();
    let mut body = String::new();

    body.push_str("<h1>Bulk Screening Report</h1>\n");
    body.push_str(&format!("<p>Generated: {}</p>\n", html_escape(&generated_at)));
    body.push_str(&format!(
        "<table>\n<tbody>\n<tr><th>Total screened</th><td>{total}</td></tr>\n\
         <tr><th>Hits</th><td>{hits}</td></tr>\n\
         <tr><th>Clears</th><td>{}</td></tr>\n\
         <tr><th>Hit rate</th><td>{}</td></tr>\n</tbody>\n</table>\n",
        total - hits,
        hit_rate(hits, total),
    ));

    body.push_str(
        "<table>\n<thead>\n<tr><th>#</th><th>Name</th><th>Document</th><th>Country</th>\
         <th>Result</th><th>Top recommendation</th><th>Source</th><th>Screening ID</th></tr>\n\
         </thead>\n<tbody>\n",
    );
    for (index, result) in results.iter().enumerate() {
        let top = result.matches.first();
        let status = if result.is_hit {
            format!("<span class=\"hit\">HIT ({})</span>", result.hit_count)
        } else {
            "<span class=\"clear\">CLEAR</span>".to_string()
        };
        body.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{status}</td><td>{}</td>\
             <td>{}</td><td>{}</td></tr>\n",
            index + 1,
            text(result.input.name.as_deref()),
            text(result.input.document.as_deref()),
            text(result.input.country.as_deref()),
            text(top.and_then(|record| record.recommendation.as_deref())),
            text(top.and_then(|record| record.entity.source.as_deref())),
            text(result.screening_id.as_deref()),
        ));
    }
    body.push_str("</tbody>\n</table>\n");

    ReportResponse::new(ReportType::Bulk, document("Bulk Screening Report", &body), generated_at)
}
