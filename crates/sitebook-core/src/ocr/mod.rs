//! OCR pipeline
//!
//! Two modes, selected automatically:
//! - **Fast**: text-bearing files (plain text, PDFs with extractable text,
//!   or uploads carrying pre-extracted text) run through vendor regex
//!   parsers. Falls through to heavy mode when the parse finds no total,
//!   no line items, or no vendor.
//! - **Heavy**: page images (bounded count) go to the vision tier with an
//!   explicit JSON schema; every scalar carries a confidence.
//!
//! Image buffers and the source blob are dropped before any database work;
//! no image bytes outlive a single call.

pub mod parsers;

use base64::Engine as _;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::ai::{ImagePayload, LlmBackend, LlmClient};
use crate::config::Config;
use crate::db::{Database, OcrMetricRow};
use crate::error::{Error, Result};
use crate::models::{ExtractedReceipt, ReceiptLineItem, TotalMatch};
use crate::money::Money;

/// Page cap for the vision tier.
const MAX_PAGES: usize = 8;
/// Minimum machine text to trust the fast path.
const MIN_TEXT_CHARS: usize = 100;

/// An uploaded file entering the pipeline. Large buffers travel by value so
/// the pipeline can drop them deterministically.
pub struct ReceiptFile {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    /// Text the uploader already extracted (e.g. an image whose metadata
    /// declares OCR was performed upstream).
    pub pre_extracted_text: Option<String>,
    /// Pre-rasterized page images for PDFs, one per page.
    pub page_images: Option<Vec<Vec<u8>>>,
}

pub struct OcrPipeline {
    db: Database,
    llm: Option<LlmClient>,
    config: Config,
}

#[derive(Debug, Deserialize)]
struct VisionLineItem {
    description: String,
    #[serde(default)]
    quantity: Option<f64>,
    #[serde(default)]
    unit_price: Option<String>,
    line_total: String,
    #[serde(default = "default_confidence")]
    confidence: i64,
}

fn default_confidence() -> i64 {
    70
}

#[derive(Debug, Deserialize)]
struct VisionReceipt {
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default = "default_confidence")]
    vendor_confidence: i64,
    #[serde(default)]
    date: Option<String>,
    #[serde(default = "default_confidence")]
    date_confidence: i64,
    #[serde(default)]
    bill_ref: Option<String>,
    #[serde(default)]
    subtotal: Option<String>,
    #[serde(default)]
    tax: Option<String>,
    #[serde(default)]
    total: Option<String>,
    #[serde(default = "default_confidence")]
    total_confidence: i64,
    #[serde(default)]
    line_items: Vec<VisionLineItem>,
}

impl OcrPipeline {
    pub fn new(db: Database, llm: Option<LlmClient>, config: Config) -> Self {
        Self { db, llm, config }
    }

    /// Extract a normalized receipt record from an uploaded file.
    pub async fn extract(
        &self,
        file: ReceiptFile,
        project_id: Option<Uuid>,
    ) -> Result<(ExtractedReceipt, Option<String>)> {
        if file.bytes.is_empty() {
            return Err(Error::Validation("Empty file".into()));
        }
        let started = Instant::now();

        // Fast path: any machine text we can trust.
        if let Some(text) = Self::machine_text(&file) {
            let parse = parsers::parse_text(&text);
            if parse.is_sufficient() {
                let receipt = self.finish_text_parse(parse);
                self.db.record_ocr_metric(&OcrMetricRow {
                    agent: "ocr_pipeline".into(),
                    method: "text".into(),
                    model_tier: "none".into(),
                    wall_ms: started.elapsed().as_millis() as i64,
                    char_count: Some(text.len() as i64),
                    item_count: Some(receipt.line_items.len() as i64),
                    tax_detected: receipt.tax.is_some(),
                    total_match: Some(receipt.total_match.as_str().to_string()),
                    success: true,
                    project_id,
                });
                return Ok((receipt, Some(text)));
            }
            debug!(
                vendor_found = parse.vendor.is_some(),
                items = parse.line_items.len(),
                "Text parse insufficient, falling through to vision"
            );
        }

        // Heavy path: vision extraction over page images.
        let result = self.extract_via_vision(file).await;

        let (success, item_count, tax_detected, total_match) = match &result {
            Ok(r) => (
                true,
                Some(r.line_items.len() as i64),
                r.tax.is_some(),
                Some(r.total_match.as_str().to_string()),
            ),
            Err(_) => (false, None, false, None),
        };
        self.db.record_ocr_metric(&OcrMetricRow {
            agent: "ocr_pipeline".into(),
            method: "vision".into(),
            model_tier: "large".into(),
            wall_ms: started.elapsed().as_millis() as i64,
            char_count: None,
            item_count,
            tax_detected,
            total_match,
            success,
            project_id,
        });

        result.map(|r| (r, None))
    }

    /// Usable machine text, if the upload carries any.
    fn machine_text(file: &ReceiptFile) -> Option<String> {
        if let Some(text) = &file.pre_extracted_text {
            if text.trim().len() >= MIN_TEXT_CHARS {
                return Some(text.clone());
            }
        }
        if file.mime_type.starts_with("text/") {
            if let Ok(text) = std::str::from_utf8(&file.bytes) {
                if text.trim().len() >= MIN_TEXT_CHARS {
                    return Some(text.to_string());
                }
            }
        }
        if file.mime_type == "application/pdf" {
            let text = extract_pdf_text(&file.bytes);
            let meaningful: usize = text.chars().filter(|c| !c.is_whitespace()).count();
            if meaningful >= MIN_TEXT_CHARS {
                return Some(text);
            }
        }
        None
    }

    fn finish_text_parse(&self, parse: parsers::TextParse) -> ExtractedReceipt {
        // Text-parsed fields are machine-read: high fixed confidence.
        let mut line_items: Vec<ReceiptLineItem> = parse
            .line_items
            .into_iter()
            .map(|(description, quantity, unit_price, line_total)| ReceiptLineItem {
                description,
                quantity,
                unit_price,
                line_total,
                tax_included: None,
                confidence: 95,
            })
            .collect();

        // If the items sum to the subtotal and a tax line exists, fold the
        // tax in so items sum to the grand total.
        let pre_tax_match = parsers::reconcile_totals(
            &line_items,
            parse.subtotal,
            parse.total,
            self.config.amount_tolerance_cents,
            self.config.amount_tolerance_pct,
        );
        if pre_tax_match == TotalMatch::Subtotal {
            if let (Some(tax), Some(subtotal)) = (parse.tax, parse.subtotal) {
                parsers::distribute_tax(&mut line_items, tax, subtotal);
            }
        }

        let total_match = parsers::reconcile_totals(
            &line_items,
            parse.subtotal,
            parse.total,
            self.config.amount_tolerance_cents,
            self.config.amount_tolerance_pct,
        );

        ExtractedReceipt {
            vendor: parse.vendor,
            vendor_confidence: 95,
            date: parse.date,
            date_confidence: if parse.date.is_some() { 95 } else { 0 },
            bill_ref: parse.bill_ref,
            subtotal: parse.subtotal,
            tax: parse.tax,
            total: parse.total,
            total_confidence: if parse.total.is_some() { 95 } else { 0 },
            line_items,
            total_match,
        }
    }

    async fn extract_via_vision(&self, file: ReceiptFile) -> Result<ExtractedReceipt> {
        let Some(llm) = &self.llm else {
            return Err(Error::UpstreamUnavailable(
                "Vision extraction requires the LLM gateway".into(),
            ));
        };

        let ReceiptFile {
            bytes,
            mime_type,
            page_images,
            ..
        } = file;

        let images: Vec<ImagePayload> = match page_images {
            Some(pages) => {
                let total = pages.len();
                if total > MAX_PAGES {
                    info!(pages = total, cap = MAX_PAGES, "Truncating page set for vision");
                }
                pages
                    .into_iter()
                    .take(MAX_PAGES)
                    .map(|page| ImagePayload {
                        base64: base64::engine::general_purpose::STANDARD.encode(&page),
                        media_type: "image/png".into(),
                    })
                    .collect()
            }
            None => vec![ImagePayload {
                base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
                media_type: mime_type.clone(),
            }],
        };
        // The blob buffer must not outlive the call.
        drop(bytes);

        let reply = llm
            .extract_vision("ocr_extract", &vision_prompt(images.len()), &images)
            .await
            .map_err(Error::from)?;
        // Rasterized pages are released before any database work.
        drop(images);

        let parsed: VisionReceipt = serde_json::from_value(reply.value)
            .map_err(|e| Error::UpstreamInvalid(format!("Vision schema mismatch: {}", e)))?;

        let mut line_items = Vec::with_capacity(parsed.line_items.len());
        for item in parsed.line_items {
            let line_total = Money::parse(&item.line_total).map_err(|_| {
                Error::UpstreamInvalid(format!("Bad line total '{}'", item.line_total))
            })?;
            line_items.push(ReceiptLineItem {
                description: item.description,
                quantity: item.quantity,
                unit_price: item.unit_price.as_deref().and_then(|p| Money::parse(p).ok()),
                line_total,
                tax_included: None,
                confidence: item.confidence.clamp(0, 100),
            });
        }

        let subtotal = parsed.subtotal.as_deref().and_then(|s| Money::parse(s).ok());
        let tax = parsed.tax.as_deref().and_then(|s| Money::parse(s).ok());
        let total = parsed.total.as_deref().and_then(|s| Money::parse(s).ok());
        let date: Option<NaiveDate> = parsed.date.as_deref().and_then(|d| d.parse().ok());

        let pre_tax_match = parsers::reconcile_totals(
            &line_items,
            subtotal,
            total,
            self.config.amount_tolerance_cents,
            self.config.amount_tolerance_pct,
        );
        if pre_tax_match == TotalMatch::Subtotal {
            if let (Some(tax), Some(subtotal)) = (tax, subtotal) {
                parsers::distribute_tax(&mut line_items, tax, subtotal);
            }
        }
        let total_match = parsers::reconcile_totals(
            &line_items,
            subtotal,
            total,
            self.config.amount_tolerance_cents,
            self.config.amount_tolerance_pct,
        );

        Ok(ExtractedReceipt {
            vendor: parsed.vendor,
            vendor_confidence: parsed.vendor_confidence.clamp(0, 100),
            date,
            date_confidence: parsed.date_confidence.clamp(0, 100),
            bill_ref: parsed.bill_ref,
            subtotal,
            tax,
            total,
            total_confidence: parsed.total_confidence.clamp(0, 100),
            line_items,
            total_match,
        })
    }
}

fn vision_prompt(page_count: usize) -> String {
    let pages_hint = if page_count > 1 {
        format!(
            "\nThis document has {} pages, provided in order. Combine data from all pages.\n",
            page_count
        )
    } else {
        String::new()
    };
    format!(
        "Extract ALL expense line items from this receipt/invoice.{}\n\
         Rules:\n\
         - line_total is the extended amount (rightmost dollar figure per line), never the unit price.\n\
         - Extract every line item separately; do not combine items.\n\
         - Delivery, freight, environmental fees, surcharges, and tips are separate line items.\n\
         - Do NOT emit tax as a line item; report it in the tax field.\n\
         - Amounts are strings with two decimals and no currency symbols.\n\
         - Every scalar gets a confidence 0-100; below 50 means you could not read it clearly.\n\n\
         Return ONLY JSON:\n{}",
        pages_hint,
        json!({
            "vendor": "name or null",
            "vendor_confidence": 90,
            "date": "YYYY-MM-DD or null",
            "date_confidence": 90,
            "bill_ref": "invoice/receipt number or null",
            "subtotal": "0.00 or null",
            "tax": "0.00 or null",
            "total": "0.00 or null",
            "total_confidence": 90,
            "line_items": [{
                "description": "item text",
                "quantity": 1,
                "unit_price": "0.00 or null",
                "line_total": "0.00",
                "confidence": 90
            }]
        })
    )
}

/// Pull literal text out of uncompressed PDF content streams. Real scans
/// have no text layer and fall through to vision; native PDFs with
/// uncompressed streams carry their text in `Tj`/`TJ` show operators.
fn extract_pdf_text(bytes: &[u8]) -> String {
    let content = String::from_utf8_lossy(bytes);
    let mut out = String::new();
    let mut chars = content.char_indices().peekable();
    let mut in_paren = 0usize;
    let mut current = String::new();

    while let Some((_, c)) = chars.next() {
        match c {
            '(' => {
                if in_paren > 0 {
                    current.push(c);
                }
                in_paren += 1;
            }
            ')' if in_paren > 0 => {
                in_paren -= 1;
                if in_paren == 0 {
                    // Keep strings followed by a show operator.
                    let rest: String = chars.clone().take(4).map(|(_, c)| c).collect();
                    if rest.trim_start().starts_with("Tj")
                        || rest.trim_start().starts_with("TJ")
                        || rest.trim_start().starts_with(']')
                    {
                        out.push_str(&current);
                        out.push('\n');
                    }
                    current.clear();
                } else {
                    current.push(c);
                }
            }
            '\\' if in_paren > 0 => {
                if let Some((_, next)) = chars.next() {
                    match next {
                        'n' => current.push('\n'),
                        't' => current.push('\t'),
                        _ => current.push(next),
                    }
                }
            }
            _ if in_paren > 0 => current.push(c),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const RECEIPT_TEXT: &str = "\
THE HOME DEPOT #1234
Invoice # HD-1
07/15/2026
2X4X8 STUD                          12.00
WOOD SCREWS 1LB BOX                  4.50
SUBTOTAL                            16.50
TOTAL                              $16.50
";

    fn pipeline(llm: Option<LlmClient>) -> (OcrPipeline, Database) {
        let db = Database::in_memory().unwrap();
        (OcrPipeline::new(db.clone(), llm, Config::default()), db)
    }

    #[tokio::test]
    async fn test_fast_mode_with_pre_extracted_text() {
        let (pipeline, db) = pipeline(None);
        let file = ReceiptFile {
            bytes: b"binary-image".to_vec(),
            mime_type: "image/jpeg".into(),
            pre_extracted_text: Some(RECEIPT_TEXT.to_string()),
            page_images: None,
        };
        let (receipt, text) = pipeline.extract(file, None).await.unwrap();
        assert!(text.is_some());
        assert_eq!(receipt.vendor.as_deref(), Some("Home Depot"));
        assert_eq!(receipt.line_items.len(), 2);
        assert_eq!(receipt.total_match, TotalMatch::Total);

        let (calls, successes, _) = db.ocr_metric_summary().unwrap();
        assert_eq!((calls, successes), (1, 1));
    }

    #[tokio::test]
    async fn test_vision_fallback_when_text_insufficient() {
        let llm = LlmClient::mock();
        llm.as_mock().unwrap().push_response(
            "ocr_extract",
            json!({
                "vendor": "Home Depot", "vendor_confidence": 92,
                "date": "2026-07-15", "date_confidence": 90,
                "bill_ref": "HD-1",
                "subtotal": "16.50", "tax": null, "total": "16.50",
                "total_confidence": 95,
                "line_items": [
                    {"description": "2x4 lumber", "quantity": 2, "unit_price": "6.00",
                     "line_total": "12.00", "confidence": 93},
                    {"description": "wood screws", "line_total": "4.50", "confidence": 88}
                ]
            }),
        );
        let (pipeline, _db) = pipeline(Some(llm));
        let file = ReceiptFile {
            bytes: vec![0xFF, 0xD8, 0xFF, 0xE0],
            mime_type: "image/jpeg".into(),
            pre_extracted_text: None,
            page_images: None,
        };
        let (receipt, text) = pipeline.extract(file, None).await.unwrap();
        assert!(text.is_none());
        assert_eq!(receipt.line_items.len(), 2);
        assert_eq!(receipt.total_match, TotalMatch::Total);
        assert_eq!(receipt.min_confidence(), 88);
    }

    #[tokio::test]
    async fn test_vision_tax_distribution() {
        let llm = LlmClient::mock();
        llm.as_mock().unwrap().push_response(
            "ocr_extract",
            json!({
                "vendor": "Lowe's", "vendor_confidence": 92,
                "date": "2026-07-15", "date_confidence": 90,
                "subtotal": "100.00", "tax": "8.00", "total": "108.00",
                "total_confidence": 95,
                "line_items": [
                    {"description": "item a", "line_total": "60.00", "confidence": 90},
                    {"description": "item b", "line_total": "40.00", "confidence": 90}
                ]
            }),
        );
        let (pipeline, _db) = pipeline(Some(llm));
        let file = ReceiptFile {
            bytes: vec![1, 2, 3],
            mime_type: "image/png".into(),
            pre_extracted_text: None,
            page_images: None,
        };
        let (receipt, _) = pipeline.extract(file, None).await.unwrap();
        let sum: Money = receipt.line_items.iter().map(|i| i.line_total).sum();
        assert_eq!(sum, Money::parse("108.00").unwrap());
        assert_eq!(receipt.total_match, TotalMatch::Total);
    }

    #[tokio::test]
    async fn test_mismatch_detection() {
        let llm = LlmClient::mock();
        llm.as_mock().unwrap().push_response(
            "ocr_extract",
            json!({
                "vendor": "Lowe's", "vendor_confidence": 92,
                "total": "1048.05", "total_confidence": 95,
                "line_items": [
                    {"description": "item a", "line_total": "850.00", "confidence": 90}
                ]
            }),
        );
        let (pipeline, _db) = pipeline(Some(llm));
        let file = ReceiptFile {
            bytes: vec![1],
            mime_type: "image/png".into(),
            pre_extracted_text: None,
            page_images: None,
        };
        let (receipt, _) = pipeline.extract(file, None).await.unwrap();
        assert_eq!(receipt.total_match, TotalMatch::Mismatch);
    }

    #[tokio::test]
    async fn test_empty_file_rejected() {
        let (pipeline, _db) = pipeline(None);
        let file = ReceiptFile {
            bytes: vec![],
            mime_type: "image/png".into(),
            pre_extracted_text: None,
            page_images: None,
        };
        let err = pipeline.extract(file, None).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_extract_pdf_text_show_operators() {
        let pdf = b"stream BT (Hello receipt) Tj (TOTAL 12.00) Tj ET endstream";
        let text = extract_pdf_text(pdf);
        assert!(text.contains("Hello receipt"));
        assert!(text.contains("TOTAL 12.00"));
    }
}
