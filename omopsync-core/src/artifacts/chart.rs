//! Chart specifications built from query results and rendered to HTML.
//!
//! Line, bar, scatter, pie and histogram charts are emitted as Chart.js
//! configurations; heatmaps become a shaded HTML table.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ArtifactError;
use crate::query::QueryResult;

/// Upper bound on histogram bins.
const MAX_BINS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartType {
    Line,
    Bar,
    Scatter,
    Pie,
    Heatmap,
    Histogram,
}

impl ChartType {
    pub const ALL: [ChartType; 6] = [
        ChartType::Line,
        ChartType::Bar,
        ChartType::Scatter,
        ChartType::Pie,
        ChartType::Heatmap,
        ChartType::Histogram,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChartType::Line => "line",
            ChartType::Bar => "bar",
            ChartType::Scatter => "scatter",
            ChartType::Pie => "pie",
            ChartType::Heatmap => "heatmap",
            ChartType::Histogram => "histogram",
        }
    }

    /// Whether the chart needs a measure column besides `xField`.
    pub fn needs_y(&self) -> bool {
        !matches!(self, ChartType::Histogram)
    }

    pub fn parse(name: &str) -> Result<Self, ArtifactError> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.as_str().eq_ignore_ascii_case(name.trim()))
            .ok_or_else(|| ArtifactError::UnsupportedChartType {
                chart_type: name.to_string(),
                expected: Self::ALL.map(|ty| ty.as_str()).join(", "),
            })
    }
}

impl fmt::Display for ChartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated plot request. Building one checks everything that does not
/// need the query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartRequest {
    pub chart_type: ChartType,
    pub x_field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_field: Option<String>,
}

impl ChartRequest {
    pub fn new(
        chart_type: &str,
        x_field: Option<&str>,
        y_field: Option<&str>,
    ) -> Result<Self, ArtifactError> {
        let chart_type = ChartType::parse(chart_type)?;
        fn present(field: Option<&str>) -> Option<&str> {
            field.map(str::trim).filter(|f| !f.is_empty())
        }

        let x_field = present(x_field).ok_or_else(|| ArtifactError::MissingField {
            chart_type: chart_type.to_string(),
            field: "xField".into(),
        })?;
        let y_field = present(y_field);
        if chart_type.needs_y() && y_field.is_none() {
            return Err(ArtifactError::MissingField {
                chart_type: chart_type.to_string(),
                field: "yField".into(),
            });
        }

        Ok(Self {
            chart_type,
            x_field: x_field.to_string(),
            y_field: y_field.map(str::to_string),
        })
    }
}

/// Match a requested field to a result column.
///
/// Tries the exact name, then a case-insensitive match, then an aggregate
/// column such as `count(*)` for the field `count`.
pub fn resolve_field(columns: &[String], field: &str) -> Result<String, ArtifactError> {
    let lower = field.to_lowercase();
    let aggregate = format!("{lower}(");
    columns
        .iter()
        .find(|col| col.as_str() == field)
        .or_else(|| columns.iter().find(|col| col.to_lowercase() == lower))
        .or_else(|| {
            columns
                .iter()
                .find(|col| col.to_lowercase().starts_with(&aggregate))
        })
        .cloned()
        .ok_or_else(|| ArtifactError::UnknownColumn {
            field: field.to_string(),
            columns: columns.join(", "),
        })
}

/// Render a validated request over `result` to a complete HTML page.
pub fn render_chart_html(
    result: &QueryResult,
    request: &ChartRequest,
    title: &str,
) -> Result<String, ArtifactError> {
    let x = resolve_field(&result.columns, &request.x_field)?;
    let y = match &request.y_field {
        Some(field) => Some(resolve_field(&result.columns, field)?),
        None => None,
    };

    let body = match (request.chart_type, y.as_deref()) {
        (ChartType::Heatmap, Some(y)) => render_heatmap_table(result, &x, y)?,
        (ChartType::Histogram, _) => canvas(&histogram_config(result, &x, title)?),
        (ChartType::Scatter, Some(y)) => canvas(&scatter_config(result, &x, y, title)?),
        (chart_type, Some(y)) => canvas(&category_config(result, chart_type, &x, y, title)?),
        (chart_type, None) => {
            return Err(ArtifactError::MissingField {
                chart_type: chart_type.to_string(),
                field: "yField".into(),
            });
        }
    };

    Ok(page(title, &body))
}

fn category_config(
    result: &QueryResult,
    chart_type: ChartType,
    x: &str,
    y: &str,
    title: &str,
) -> Result<Value, ArtifactError> {
    let labels: Vec<String> = result.rows.iter().map(|row| label(row.get(x))).collect();
    let data = numeric_column(result, y)?;
    Ok(json!({
        "type": chart_type.as_str(),
        "data": {
            "labels": labels,
            "datasets": [{ "label": y, "data": data }],
        },
        "options": options(title, x, y),
    }))
}

fn scatter_config(
    result: &QueryResult,
    x: &str,
    y: &str,
    title: &str,
) -> Result<Value, ArtifactError> {
    let xs = numeric_column(result, x)?;
    let ys = numeric_column(result, y)?;
    let points: Vec<Value> = xs
        .into_iter()
        .zip(ys)
        .filter_map(|(x, y)| Some(json!({ "x": x?, "y": y? })))
        .collect();
    Ok(json!({
        "type": "scatter",
        "data": { "datasets": [{ "label": format!("{y} by {x}"), "data": points }] },
        "options": options(title, x, y),
    }))
}

fn histogram_config(result: &QueryResult, x: &str, title: &str) -> Result<Value, ArtifactError> {
    let values: Vec<f64> = numeric_column(result, x)?.into_iter().flatten().collect();
    let (labels, counts) = histogram_bins(&values);
    Ok(json!({
        "type": "bar",
        "data": {
            "labels": labels,
            "datasets": [{ "label": format!("{x} frequency"), "data": counts }],
        },
        "options": options(title, x, "count"),
    }))
}

/// Equal-width bins, roughly `sqrt(n)` of them.
pub fn histogram_bins(values: &[f64]) -> (Vec<String>, Vec<u64>) {
    if values.is_empty() {
        return (Vec::new(), Vec::new());
    }
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if min == max {
        return (vec![format!("{min}")], vec![values.len() as u64]);
    }

    let bins = ((values.len() as f64).sqrt().ceil() as usize).clamp(1, MAX_BINS);
    let width = (max - min) / bins as f64;
    let mut counts = vec![0u64; bins];
    for value in values {
        let idx = (((value - min) / width) as usize).min(bins - 1);
        counts[idx] += 1;
    }
    let labels = (0..bins)
        .map(|i| {
            let lo = min + width * i as f64;
            let hi = lo + width;
            format!("[{lo:.2}, {hi:.2})")
        })
        .collect();
    (labels, counts)
}

fn render_heatmap_table(result: &QueryResult, x: &str, y: &str) -> Result<String, ArtifactError> {
    // an explicit `value` column is summed per cell, otherwise rows are counted
    let value_col = resolve_field(&result.columns, "value")
        .ok()
        .filter(|col| col != x && col != y);
    let values = match &value_col {
        Some(col) => numeric_column(result, col)?,
        None => vec![Some(1.0); result.rows.len()],
    };

    let mut cells: BTreeMap<(String, String), f64> = BTreeMap::new();
    let mut columns: Vec<String> = Vec::new();
    let mut rows: Vec<String> = Vec::new();
    for (row, value) in result.rows.iter().zip(values) {
        let col_key = label(row.get(x));
        let row_key = label(row.get(y));
        if !columns.contains(&col_key) {
            columns.push(col_key.clone());
        }
        if !rows.contains(&row_key) {
            rows.push(row_key.clone());
        }
        *cells.entry((row_key, col_key)).or_default() += value.unwrap_or(0.0);
    }

    let max = cells.values().copied().fold(0.0_f64, f64::max);
    let mut html = String::from("<table class=\"heatmap\">\n<thead><tr>\n");
    html.push_str(&format!(
        "  <th>{} \\ {}</th>\n",
        escape_html(y),
        escape_html(x)
    ));
    for col in &columns {
        html.push_str(&format!("  <th>{}</th>\n", escape_html(col)));
    }
    html.push_str("</tr></thead>\n<tbody>\n");
    for row_key in &rows {
        html.push_str(&format!("<tr>\n  <th>{}</th>\n", escape_html(row_key)));
        for col in &columns {
            let cell = cells.get(&(row_key.clone(), col.clone())).copied();
            match cell {
                Some(value) => {
                    let alpha = if max > 0.0 { value / max } else { 0.0 };
                    html.push_str(&format!(
                        "  <td style=\"background: rgba(220, 60, 40, {alpha:.3})\">{value:.0}</td>\n"
                    ));
                }
                None => html.push_str("  <td></td>\n"),
            }
        }
        html.push_str("</tr>\n");
    }
    html.push_str("</tbody>\n</table>");
    Ok(html)
}

/// Numeric values of a column. Numeric strings are accepted, nulls stay `None`.
fn numeric_column(result: &QueryResult, column: &str) -> Result<Vec<Option<f64>>, ArtifactError> {
    result
        .rows
        .iter()
        .enumerate()
        .map(|(idx, row)| match row.get(column) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => Ok(n.as_f64()),
            Some(Value::String(s)) => {
                s.trim()
                    .parse::<f64>()
                    .map(Some)
                    .map_err(|_| ArtifactError::NonNumeric {
                        field: column.to_string(),
                        row: idx + 1,
                    })
            }
            Some(_) => Err(ArtifactError::NonNumeric {
                field: column.to_string(),
                row: idx + 1,
            }),
        })
        .collect()
}

fn label(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "NULL".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn options(title: &str, x: &str, y: &str) -> Value {
    json!({
        "responsive": true,
        "plugins": {
            "title": { "display": !title.is_empty(), "text": title }
        },
        "scales": {
            "x": { "title": { "display": true, "text": x } },
            "y": { "title": { "display": true, "text": y } }
        }
    })
}

fn canvas(config: &Value) -> String {
    let config = script_safe_json(config);
    format!(
        "<canvas id=\"chart\"></canvas>\n\
         <script src=\"https://cdn.jsdelivr.net/npm/chart.js\"></script>\n\
         <script>\nnew Chart(document.getElementById('chart'), {config});\n</script>"
    )
}

/// Serialize for inline `<script>` use: markup characters in string values
/// become JSON escapes so data cannot close the script element.
fn script_safe_json(value: &Value) -> String {
    serde_json::to_string_pretty(value)
        .unwrap_or_else(|_| "{}".into())
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
        .replace('&', "\\u0026")
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{title}</title>\n\
         <style>body {{ font-family: sans-serif; margin: 2em; }} \
         table.heatmap {{ border-collapse: collapse; }} \
         table.heatmap td, table.heatmap th {{ border: 1px solid #ccc; padding: 4px 8px; }}</style>\n\
         </head>\n<body>\n<h1>{title}</h1>\n{body}\n</body>\n</html>\n",
        title = escape_html(title),
    )
}

pub(crate) fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn result(columns: &[&str], rows: Vec<Vec<Value>>) -> QueryResult {
        QueryResult {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows
                .into_iter()
                .map(|values| {
                    columns
                        .iter()
                        .map(|c| c.to_string())
                        .zip(values)
                        .collect::<Map<String, Value>>()
                })
                .collect(),
        }
    }

    #[test]
    fn test_chart_type_parse() {
        assert_eq!(ChartType::parse("Bar").unwrap(), ChartType::Bar);
        match ChartType::parse("radar").unwrap_err() {
            ArtifactError::UnsupportedChartType { expected, .. } => {
                assert!(expected.contains("histogram"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_request_requires_fields() {
        let err = ChartRequest::new("bar", Some("gender"), None).unwrap_err();
        assert_eq!(err.to_string(), "chart type 'bar' requires 'yField'");

        let err = ChartRequest::new("line", Some("  "), Some("n")).unwrap_err();
        assert!(matches!(err, ArtifactError::MissingField { field, .. } if field == "xField"));

        let request = ChartRequest::new("histogram", Some("age"), None).unwrap();
        assert_eq!(request.y_field, None);
    }

    #[test]
    fn test_resolve_field_order() {
        let columns = vec!["Gender".to_string(), "count(*)".to_string(), "count".to_string()];
        assert_eq!(resolve_field(&columns, "count").unwrap(), "count");
        assert_eq!(resolve_field(&columns, "gender").unwrap(), "Gender");

        let columns = vec!["gender".to_string(), "COUNT(*)".to_string()];
        assert_eq!(resolve_field(&columns, "count").unwrap(), "COUNT(*)");
        assert!(matches!(
            resolve_field(&columns, "age"),
            Err(ArtifactError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn test_bar_chart_config() {
        let data = result(
            &["gender", "count(*)"],
            vec![vec![json!("F"), json!(2)], vec![json!("M"), json!("1")]],
        );
        let request = ChartRequest::new("bar", Some("gender"), Some("count")).unwrap();
        let html = render_chart_html(&data, &request, "Bar plot").unwrap();
        assert!(html.contains("\"type\": \"bar\""));
        assert!(html.contains("\"F\""));
        assert!(html.contains("<title>Bar plot</title>"));
    }

    #[test]
    fn test_labels_cannot_close_the_script() {
        let label = "</script><script>alert(1)</script>";
        let data = result(&["site", "n"], vec![vec![json!(label), json!(3)]]);
        let request = ChartRequest::new("pie", Some("site"), Some("n")).unwrap();
        let html = render_chart_html(&data, &request, "Pie plot").unwrap();
        assert!(!html.contains(label));
        assert!(html.contains(r"\u003c/script\u003e\u003cscript\u003ealert(1)"));
        assert_eq!(html.matches("</script>").count(), 2);
    }

    #[test]
    fn test_non_numeric_measure_rejected() {
        let data = result(&["gender", "n"], vec![vec![json!("F"), json!("lots")]]);
        let request = ChartRequest::new("line", Some("gender"), Some("n")).unwrap();
        let err = render_chart_html(&data, &request, "t").unwrap_err();
        assert!(matches!(err, ArtifactError::NonNumeric { row: 1, .. }));
    }

    #[test]
    fn test_heatmap_table() {
        let data = result(
            &["year", "gender", "value"],
            vec![
                vec![json!(2020), json!("F"), json!(4)],
                vec![json!(2021), json!("F"), json!(2)],
                vec![json!(2020), json!("M"), json!(1)],
            ],
        );
        let request = ChartRequest::new("heatmap", Some("year"), Some("gender")).unwrap();
        let html = render_chart_html(&data, &request, "Heatmap plot").unwrap();
        assert!(html.contains("<table class=\"heatmap\">"));
        assert!(html.contains("rgba(220, 60, 40, 1.000)\">4</td>"));
        assert!(html.contains("<td></td>"));
    }

    #[test]
    fn test_histogram_bins() {
        let (labels, counts) = histogram_bins(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(labels.len(), 2);
        assert_eq!(counts, vec![2, 2]);

        let (labels, counts) = histogram_bins(&[5.0, 5.0]);
        assert_eq!(labels, vec!["5"]);
        assert_eq!(counts, vec![2]);
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<b>&\"'"), "&lt;b&gt;&amp;&quot;&#39;");
    }
}
