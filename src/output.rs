//! Output types: the normalised receipt record and per-request diagnostics.
//!
//! Models answer in slightly different dialects (`"$12.50"` instead of
//! `12.5`, `description` instead of `desc`, nested `taxes` objects). The
//! located JSON object is normalised into a [`Receipt`] with one convention:
//! every schema field is always present and a missing value is `null`.

use crate::config::PipelineMode;
use crate::error::ExtractionError;
use crate::pipeline::geometry::{ExtractedImage, ExtractionMethod};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Tax keys every receipt carries, even when the model omits them.
pub const STANDARD_TAX_KEYS: [&str; 2] = ["tax_tps_amount", "tax_tvq_amount"];

/// Structured fields of one receipt.
///
/// Serialises to the flat schema
/// `{store_name, date, time, total_amount, subtotal, tax_*_amount…, items}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Receipt {
    pub store_name: Option<String>,
    /// `YYYY-MM-DD` as written by the model; not validated.
    pub date: Option<String>,
    /// `HH:MM` as written by the model; not validated.
    pub time: Option<String>,
    pub total_amount: Option<f64>,
    pub subtotal: Option<f64>,
    /// `tax_<label>_amount` → amount. Always contains [`STANDARD_TAX_KEYS`].
    #[serde(flatten)]
    pub taxes: BTreeMap<String, Option<f64>>,
    pub items: Vec<LineItem>,
}

/// One purchased line.
///
/// For fuel lines `qty` is the volume and `price` the unit price; for other
/// lines `price` is the line total.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineItem {
    pub desc: Option<String>,
    pub qty: Option<f64>,
    pub price: Option<f64>,
}

impl Receipt {
    /// Normalise a parsed model response. Returns `None` unless `value` is a
    /// JSON object.
    pub fn from_value(value: &Value) -> Option<Receipt> {
        let obj = value.as_object()?;

        let mut taxes: BTreeMap<String, Option<f64>> = STANDARD_TAX_KEYS
            .iter()
            .map(|k| (k.to_string(), None))
            .collect();

        for (key, v) in obj {
            let key = key.to_ascii_lowercase();
            if key.starts_with("tax_") && key.ends_with("_amount") && key.len() > "tax__amount".len() {
                taxes.insert(key, parse_amount(v));
            }
        }
        // Some models nest taxes as {"taxes": {"tps": 1.2, "tvq": 2.4}}.
        if let Some(nested) = obj.get("taxes").and_then(Value::as_object) {
            for (label, v) in nested {
                let key = format!("tax_{}_amount", label.trim().to_ascii_lowercase());
                let amount = parse_amount(v);
                let slot = taxes.entry(key).or_insert(None);
                if slot.is_none() {
                    *slot = amount;
                }
            }
        }

        let items = obj
            .get("items")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(LineItem::from_value).collect())
            .unwrap_or_default();

        Some(Receipt {
            store_name: parse_text(obj.get("store_name")),
            date: parse_text(obj.get("date")),
            time: parse_text(obj.get("time")),
            total_amount: first_amount(obj, &["total_amount", "total"]),
            subtotal: first_amount(obj, &["subtotal", "sub_total"]),
            taxes,
            items,
        })
    }
}

impl LineItem {
    /// Normalise one entry of `items`. Entries where every field is missing
    /// are dropped.
    fn from_value(value: &Value) -> Option<LineItem> {
        let obj = value.as_object()?;
        let desc = ["desc", "description", "name"]
            .iter()
            .find_map(|k| parse_text(obj.get(*k)));
        let item = LineItem {
            desc,
            qty: first_amount(obj, &["qty", "quantity"]),
            price: first_amount(obj, &["price", "amount", "total"]),
        };
        if item.desc.is_none() && item.qty.is_none() && item.price.is_none() {
            None
        } else {
            Some(item)
        }
    }
}

fn first_amount(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| obj.get(*k).and_then(parse_amount))
}

fn parse_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() || s.eq_ignore_ascii_case("null") {
                None
            } else {
                Some(s.to_string())
            }
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Lenient amount parsing: numbers pass through, strings lose currency
/// symbols and thousands separators.
///
/// With both `.` and `,` present the later one is the decimal separator
/// (`1,234.56`, `1.234,56`). A lone comma is a decimal separator. A leading
/// or trailing minus (`12.50-` on discount lines) makes the amount negative.
pub(crate) fn parse_amount(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let kept: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-'))
                .collect();
            let negative = kept.starts_with('-') || kept.ends_with('-');
            let digits = kept.replace('-', "");

            let cleaned = match (digits.rfind('.'), digits.rfind(',')) {
                (Some(dot), Some(comma)) if comma > dot => digits.replace('.', "").replace(',', "."),
                (Some(_), Some(_)) => digits.replace(',', ""),
                (None, Some(_)) if digits.matches(',').count() == 1 => digits.replace(',', "."),
                (None, Some(_)) => digits.replace(',', ""),
                (Some(_), None) if digits.matches('.').count() > 1 => digits.replace('.', ""),
                _ => digits,
            };
            let amount = cleaned.parse::<f64>().ok().filter(|v| v.is_finite())?;
            Some(if negative { -amount } else { amount })
        }
        _ => None,
    }
}

// ── Per-request output ───────────────────────────────────────────────────

/// Complete result of processing one receipt image.
///
/// Returned as `Ok` whenever the image decoded and the mask was obtained,
/// even if field extraction failed; check [`ReceiptOutput::error`].
#[derive(Debug, Clone, Serialize)]
pub struct ReceiptOutput {
    /// File name, path or URL the image came from.
    pub source: String,
    pub mode: PipelineMode,
    /// Parsed fields, when extraction succeeded.
    pub receipt: Option<Receipt>,
    /// Why extraction failed, carrying the raw model output when there was one.
    pub error: Option<ExtractionError>,
    /// Filtered recogniser text ([`PipelineMode::Ocr`] only).
    pub ocr_text: Option<String>,
    pub geometry: GeometrySummary,
    pub stats: ProcessingStats,
}

impl ReceiptOutput {
    pub fn is_success(&self) -> bool {
        self.receipt.is_some()
    }

    /// The response body: the receipt on success, otherwise an error object
    /// `{"error": <message>, "kind": …, "raw_response": …}`.
    pub fn to_json(&self) -> Value {
        if let Some(ref receipt) = self.receipt {
            return serde_json::to_value(receipt).unwrap_or_default();
        }
        let Some(ref error) = self.error else {
            return serde_json::json!({ "error": "no receipt produced" });
        };
        let mut body = match serde_json::to_value(error) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        body.insert("error".to_string(), Value::String(error.to_string()));
        if let Some(ref text) = self.ocr_text {
            body.insert("ocr_text".to_string(), Value::String(text.clone()));
        }
        Value::Object(body)
    }
}

/// What the geometry stage did to the photograph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeometrySummary {
    pub method: ExtractionMethod,
    /// Whether a quarter turn was applied.
    pub rotated: bool,
    pub width: u32,
    pub height: u32,
    /// Area of the dominant contour, when one was found.
    pub contour_area: Option<f64>,
    /// Vertex count of the simplified polygon, when one was computed.
    pub vertices: Option<usize>,
}

impl From<&ExtractedImage> for GeometrySummary {
    fn from(e: &ExtractedImage) -> Self {
        Self {
            method: e.method,
            rotated: e.rotated,
            width: e.image.width(),
            height: e.image.height(),
            contour_area: e.contour_area,
            vertices: e.vertices,
        }
    }
}

/// Timing and token accounting for one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessingStats {
    /// Model calls made by the field extractor (0, 1 or 2).
    pub attempts: u8,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Mask acquisition + contour analysis + warp.
    pub geometry_ms: u64,
    /// Line recognition ([`PipelineMode::Ocr`] only).
    pub ocr_ms: u64,
    pub extraction_ms: u64,
    pub total_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_fields_become_null() {
        let r = Receipt::from_value(&json!({"store_name": "X"})).unwrap();
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["store_name"], "X");
        for key in ["date", "time", "total_amount", "subtotal", "tax_tps_amount", "tax_tvq_amount"] {
            assert!(v.get(key).is_some(), "{key} missing");
            assert!(v[key].is_null(), "{key} not null");
        }
        assert_eq!(v["items"], json!([]));
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(Receipt::from_value(&json!([1, 2])).is_none());
        assert!(Receipt::from_value(&json!("text")).is_none());
    }

    #[test]
    fn amounts_are_parsed_leniently() {
        assert_eq!(parse_amount(&json!(12.5)), Some(12.5));
        assert_eq!(parse_amount(&json!("$12.50")), Some(12.5));
        assert_eq!(parse_amount(&json!("1,234.56")), Some(1234.56));
        assert_eq!(parse_amount(&json!("12,50 $")), Some(12.5));
        assert_eq!(parse_amount(&json!("n/a")), None);
        assert_eq!(parse_amount(&json!("1.234,56")), Some(1234.56));
        assert_eq!(parse_amount(&json!("€ 1.234.567")), Some(1234567.0));
        assert_eq!(parse_amount(&json!("12.50-")), Some(-12.5));
        assert_eq!(parse_amount(&json!("-3,00")), Some(-3.0));
        assert_eq!(parse_amount(&json!("-")), None);
        assert_eq!(parse_amount(&Value::Null), None);
    }

    #[test]
    fn nested_taxes_are_flattened_and_extra_taxes_kept() {
        let r = Receipt::from_value(&json!({
            "taxes": {"TPS": 1.5, "tvq": "2.99"},
            "tax_hst_amount": 3.0
        }))
        .unwrap();
        assert_eq!(r.taxes["tax_tps_amount"], Some(1.5));
        assert_eq!(r.taxes["tax_tvq_amount"], Some(2.99));
        assert_eq!(r.taxes["tax_hst_amount"], Some(3.0));
    }

    #[test]
    fn item_aliases_are_accepted_and_empty_items_dropped() {
        let r = Receipt::from_value(&json!({
            "items": [
                {"description": "Regular", "quantity": "42.619", "price": "1.619"},
                {"name": "Milk", "amount": 4.29},
                {},
                {"desc": null, "qty": null, "price": null}
            ]
        }))
        .unwrap();
        assert_eq!(r.items.len(), 2);
        assert_eq!(r.items[0].desc.as_deref(), Some("Regular"));
        assert_eq!(r.items[0].qty, Some(42.619));
        assert_eq!(r.items[1].price, Some(4.29));
        assert_eq!(r.items[1].qty, None);
    }

    #[test]
    fn receipt_serialises_taxes_flat() {
        let r = Receipt::from_value(&json!({"total_amount": 10, "tax_tps_amount": 0.5})).unwrap();
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["total_amount"], 10.0);
        assert_eq!(v["tax_tps_amount"], 0.5);
        assert!(v.get("taxes").is_none());
    }

    fn output_with(receipt: Option<Receipt>, error: Option<ExtractionError>) -> ReceiptOutput {
        ReceiptOutput {
            source: "r.jpg".into(),
            mode: PipelineMode::Vision,
            receipt,
            error,
            ocr_text: None,
            geometry: GeometrySummary {
                method: ExtractionMethod::NoContour,
                rotated: false,
                width: 10,
                height: 20,
                contour_area: None,
                vertices: None,
            },
            stats: ProcessingStats::default(),
        }
    }

    #[test]
    fn to_json_returns_receipt_on_success() {
        let r = Receipt::from_value(&json!({"store_name": "Metro"})).unwrap();
        let out = output_with(Some(r), None);
        assert!(out.is_success());
        assert_eq!(out.to_json()["store_name"], "Metro");
    }

    #[test]
    fn to_json_returns_diagnostics_on_failure() {
        let out = output_with(
            None,
            Some(ExtractionError::ParseFailed {
                attempts: 2,
                raw_response: "garbage".into(),
                repair_response: Some("still garbage".into()),
            }),
        );
        assert!(!out.is_success());
        let v = out.to_json();
        assert_eq!(v["kind"], "parse_failed");
        assert_eq!(v["raw_response"], "garbage");
        assert!(v["error"].as_str().unwrap().contains("2 attempts"));
    }
}
