//! Report rendering seam. CSV renders in-process; PDF and XLSX are the
//! external renderer's job, reached over HTTP and returned as bytes.

use async_trait::async_trait;
use serde_json::Value;

use crate::models::report::ReportFormat;

#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(
        &self,
        template: &str,
        format: ReportFormat,
        data: &Value,
    ) -> anyhow::Result<Vec<u8>>;
}

/// Dispatches by format: CSV locally, everything else to the external
/// renderer when one is configured.
pub struct RendererStack {
    external: Option<HttpRenderer>,
}

impl RendererStack {
    pub fn new(renderer_url: Option<String>) -> Self {
        Self {
            external: renderer_url.map(HttpRenderer::new),
        }
    }
}

#[async_trait]
impl Renderer for RendererStack {
    async fn render(
        &self,
        template: &str,
        format: ReportFormat,
        data: &Value,
    ) -> anyhow::Result<Vec<u8>> {
        match format {
            ReportFormat::Csv => Ok(render_csv(data)),
            ReportFormat::Pdf | ReportFormat::Xlsx => match &self.external {
                Some(external) => external.render(template, format, data).await,
                None => anyhow::bail!(
                    "external renderer not configured (required for {})",
                    format.as_str()
                ),
            },
        }
    }
}

/// POSTs `{template, format, data}` and expects artifact bytes back.
pub struct HttpRenderer {
    url: String,
    client: reqwest::Client,
}

impl HttpRenderer {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Renderer for HttpRenderer {
    async fn render(
        &self,
        template: &str,
        format: ReportFormat,
        data: &Value,
    ) -> anyhow::Result<Vec<u8>> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "template": template,
                "format": format.as_str(),
                "data": data,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// Flatten the bundle's `tables` into one CSV document, one block per table
/// separated by a blank line.
pub fn render_csv(data: &Value) -> Vec<u8> {
    let mut out = String::new();
    let tables = data
        .get("tables")
        .and_then(|t| t.as_array())
        .cloned()
        .unwrap_or_default();
    for (i, table) in tables.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if let Some(name) = table.get("name").and_then(|n| n.as_str()) {
            out.push_str(&csv_field(name));
            out.push('\n');
        }
        if let Some(columns) = table.get("columns").and_then(|c| c.as_array()) {
            let header: Vec<String> = columns
                .iter()
                .map(|c| csv_field(c.as_str().unwrap_or_default()))
                .collect();
            out.push_str(&header.join(","));
            out.push('\n');
        }
        if let Some(rows) = table.get("rows").and_then(|r| r.as_array()) {
            for row in rows {
                if let Some(cells) = row.as_array() {
                    let line: Vec<String> = cells.iter().map(csv_value).collect();
                    out.push_str(&line.join(","));
                    out.push('\n');
                }
            }
        }
    }
    out.into_bytes()
}

fn csv_value(v: &Value) -> String {
    match v {
        Value::String(s) => csv_field(s),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn csv_field(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_renders_tables_with_escaping() {
        let data = serde_json::json!({
            "tables": [{
                "name": "Readings",
                "columns": ["device", "pH", "note"],
                "rows": [
                    ["D1", 7.2, "ok"],
                    ["D2", 5.1, "low, acidic \"spike\""],
                ],
            }],
        });
        let csv = String::from_utf8(render_csv(&data)).unwrap();
        assert!(csv.starts_with("Readings\ndevice,pH,note\n"));
        assert!(csv.contains("D1,7.2,ok\n"));
        assert!(csv.contains("\"low, acidic \"\"spike\"\"\""));
    }

    #[tokio::test]
    async fn pdf_without_external_renderer_fails() {
        let stack = RendererStack::new(None);
        let err = stack
            .render("water-quality", ReportFormat::Pdf, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("external renderer"));
    }

    #[tokio::test]
    async fn csv_needs_no_external_renderer() {
        let stack = RendererStack::new(None);
        let bytes = stack
            .render("alert-summary", ReportFormat::Csv, &serde_json::json!({"tables": []}))
            .await
            .unwrap();
        assert!(bytes.is_empty());
    }
}
