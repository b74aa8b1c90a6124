//! Vendor-specific text parsers for the OCR fast path
//!
//! When a document yields machine text, these regex parsers pull out the
//! vendor, totals, and line items without touching a model. Each parser is
//! keyed by a vendor signature found in the text; the generic parser covers
//! everything else. A parse that finds no total or no line items falls
//! through to the vision path.

use chrono::NaiveDate;
use regex::Regex;

use crate::models::{ReceiptLineItem, TotalMatch};
use crate::money::Money;

/// Raw parse output before totals reconciliation
#[derive(Debug, Clone, Default)]
pub struct TextParse {
    pub vendor: Option<String>,
    pub date: Option<NaiveDate>,
    pub bill_ref: Option<String>,
    pub subtotal: Option<Money>,
    pub tax: Option<Money>,
    pub total: Option<Money>,
    pub line_items: Vec<(String, Option<f64>, Option<Money>, Money)>,
}

impl TextParse {
    /// A parse is usable when it found a total and at least one line item
    /// and identified the vendor.
    pub fn is_sufficient(&self) -> bool {
        self.total.is_some() && !self.line_items.is_empty() && self.vendor.is_some()
    }
}

/// Signatures that identify a vendor inside receipt text.
const VENDOR_SIGNATURES: &[(&str, &[&str])] = &[
    ("Home Depot", &["home depot", "homedepot.com"]),
    ("Lowe's", &["lowe's", "lowes.com", "lowes #"]),
    ("Ferguson", &["ferguson", "ferguson.com"]),
    ("84 Lumber", &["84 lumber"]),
];

/// Identify the vendor from known signatures.
pub fn detect_vendor(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    for (name, signatures) in VENDOR_SIGNATURES {
        if signatures.iter().any(|s| lower.contains(s)) {
            return Some(name.to_string());
        }
    }
    None
}

fn money_re() -> Regex {
    Regex::new(r"\$?\s*([0-9][0-9,]*\.[0-9]{2})").unwrap()
}

fn parse_money(s: &str) -> Option<Money> {
    let cleaned = s.replace([',', '$'], "");
    Money::parse(cleaned.trim()).ok()
}

fn find_labeled_amount(text: &str, labels: &[&str]) -> Option<Money> {
    let money = money_re();
    // Labels are tried in priority order across the whole text, so a
    // "GRAND TOTAL" line beats a plain "TOTAL" line regardless of position.
    for label in labels {
        for line in text.lines() {
            let lower = line.to_lowercase();
            if !lower.contains(label) {
                continue;
            }
            // a bare "total" label must not claim subtotal lines
            if *label == "total"
                && (lower.contains("subtotal")
                    || lower.contains("sub-total")
                    || lower.contains("sub total"))
            {
                continue;
            }
            if let Some(caps) = money.captures(line) {
                return parse_money(&caps[1]);
            }
        }
    }
    None
}

fn find_date(text: &str) -> Option<NaiveDate> {
    // ISO first, then US month/day/year
    let iso = Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").unwrap();
    if let Some(caps) = iso.captures(text) {
        if let Ok(d) = format!("{}-{}-{}", &caps[1], &caps[2], &caps[3]).parse() {
            return Some(d);
        }
    }
    let us = Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{2,4})\b").unwrap();
    if let Some(caps) = us.captures(text) {
        let month: u32 = caps[1].parse().ok()?;
        let day: u32 = caps[2].parse().ok()?;
        let mut year: i32 = caps[3].parse().ok()?;
        if year < 100 {
            year += 2000;
        }
        return NaiveDate::from_ymd_opt(year, month, day);
    }
    None
}

fn find_bill_ref(text: &str) -> Option<String> {
    let re = Regex::new(
        r"(?i)(?:invoice|bill|receipt|order|ref|po)\s*(?:#|no\.?|number)?\s*[:#]?\s*([A-Z0-9][A-Z0-9\-]{3,20})",
    )
    .unwrap();
    re.captures(text).map(|c| c[1].to_string())
}

/// Lines that name totals, not merchandise.
fn is_summary_line(lower: &str) -> bool {
    const SUMMARY: &[&str] = &[
        "subtotal",
        "sub-total",
        "sub total",
        "total",
        "tax",
        "balance",
        "amount due",
        "change due",
        "cash",
        "credit",
        "debit",
        "visa",
        "mastercard",
        "payment",
        "tender",
        "savings",
        "merchandise",
    ];
    SUMMARY.iter().any(|s| lower.contains(s))
}

/// Parse receipt text into a draft record. Vendor-specific quirks are
/// handled inline; the shape is the same for all vendors.
pub fn parse_text(text: &str) -> TextParse {
    let vendor = detect_vendor(text);
    let money = money_re();

    let mut parse = TextParse {
        vendor,
        date: find_date(text),
        bill_ref: find_bill_ref(text),
        subtotal: find_labeled_amount(text, &["subtotal", "sub-total", "sub total"]),
        tax: find_labeled_amount(text, &["sales tax", "tax"]),
        total: find_labeled_amount(text, &["grand total", "total due", "amount due", "total"]),
        line_items: Vec::new(),
    };

    // Quantity prefix like "3 @ 4.99" or "2x"
    let qty_re = Regex::new(r"(?i)\b(\d{1,3})\s*(?:@|x)\s*\$?([0-9,]+\.[0-9]{2})").unwrap();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.len() < 4 {
            continue;
        }
        let lower = trimmed.to_lowercase();
        if is_summary_line(&lower) {
            continue;
        }

        // Line total is the rightmost dollar amount on the line.
        let amounts: Vec<Money> = money
            .captures_iter(trimmed)
            .filter_map(|c| parse_money(&c[1]))
            .collect();
        let Some(&line_total) = amounts.last() else {
            continue;
        };
        if !line_total.is_positive() {
            continue;
        }

        // Description: text before the first amount.
        let desc_end = money
            .find(trimmed)
            .map(|m| m.start())
            .unwrap_or(trimmed.len());
        let description = trimmed[..desc_end]
            .trim()
            .trim_end_matches(['.', '-', ':'])
            .trim()
            .to_string();
        if description.is_empty() || description.chars().all(|c| !c.is_alphabetic()) {
            continue;
        }

        let (quantity, unit_price) = match qty_re.captures(trimmed) {
            Some(caps) => (
                caps[1].parse::<f64>().ok(),
                parse_money(&caps[2]),
            ),
            None => (None, None),
        };

        parse.line_items.push((description, quantity, unit_price, line_total));
    }

    parse
}

/// Reconcile extracted totals: the sum of line totals must agree with the
/// grand total or the subtotal within tolerance (the greater of the
/// absolute and relative bands).
pub fn reconcile_totals(
    line_items: &[ReceiptLineItem],
    subtotal: Option<Money>,
    total: Option<Money>,
    abs_cents: i64,
    rel_pct: f64,
) -> TotalMatch {
    let sum: Money = line_items.iter().map(|i| i.line_total).sum();
    if let Some(total) = total {
        if sum.within_tolerance(total, abs_cents, rel_pct) {
            return TotalMatch::Total;
        }
    }
    if let Some(subtotal) = subtotal {
        if sum.within_tolerance(subtotal, abs_cents, rel_pct) {
            return TotalMatch::Subtotal;
        }
    }
    TotalMatch::Mismatch
}

/// Distribute a detected tax amount proportionally across line items so the
/// items sum to the grand total. Tax is never its own line item. Shares are
/// computed in integer cents; the last item absorbs the truncation remainder
/// so the distribution is exact.
pub fn distribute_tax(items: &mut [ReceiptLineItem], tax: Money, subtotal: Money) {
    if tax.is_zero() || subtotal.is_zero() || items.is_empty() {
        return;
    }
    let mut distributed = Money::ZERO;
    let count = items.len();
    for (i, item) in items.iter_mut().enumerate() {
        let share = if i == count - 1 {
            tax - distributed
        } else {
            item.line_total.prorate(tax, subtotal)
        };
        item.line_total += share;
        item.tax_included = Some(share);
        distributed += share;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOME_DEPOT_TEXT: &str = "\
THE HOME DEPOT #1234
123 BUILDER WAY
Invoice # HD-88421
07/15/2026

2X4X8 STUD                          12.00
WOOD SCREWS 1LB BOX                  4.50
SUBTOTAL                            16.50
SALES TAX                            1.32
TOTAL                              $17.82
";

    #[test]
    fn test_detect_vendor() {
        assert_eq!(detect_vendor(HOME_DEPOT_TEXT).as_deref(), Some("Home Depot"));
        assert_eq!(detect_vendor("LOWES #221 store"), Some("Lowe's".into()));
        assert!(detect_vendor("Bob's Hardware").is_none());
    }

    #[test]
    fn test_parse_text_full_receipt() {
        let parse = parse_text(HOME_DEPOT_TEXT);
        assert!(parse.is_sufficient());
        assert_eq!(parse.vendor.as_deref(), Some("Home Depot"));
        assert_eq!(parse.bill_ref.as_deref(), Some("HD-88421"));
        assert_eq!(
            parse.date,
            Some(NaiveDate::from_ymd_opt(2026, 7, 15).unwrap())
        );
        assert_eq!(parse.subtotal, Some(Money::parse("16.50").unwrap()));
        assert_eq!(parse.tax, Some(Money::parse("1.32").unwrap()));
        assert_eq!(parse.total, Some(Money::parse("17.82").unwrap()));
        assert_eq!(parse.line_items.len(), 2);
        assert_eq!(parse.line_items[0].0, "2X4X8 STUD");
        assert_eq!(parse.line_items[0].3, Money::parse("12.00").unwrap());
    }

    #[test]
    fn test_parse_text_without_total_is_insufficient() {
        let parse = parse_text("HOME DEPOT\nWIDGET 3.00\n");
        assert!(!parse.is_sufficient());
    }

    #[test]
    fn test_line_total_is_rightmost_amount() {
        let parse = parse_text("LOWES\nPGT2 TIE 80 @ $1.84 EXTENSION 147.20\nTOTAL 147.20\n");
        assert_eq!(parse.line_items.len(), 1);
        assert_eq!(parse.line_items[0].3, Money::parse("147.20").unwrap());
        assert_eq!(parse.line_items[0].1, Some(80.0));
        assert_eq!(parse.line_items[0].2, Some(Money::parse("1.84").unwrap()));
    }

    fn item(desc: &str, total: &str) -> ReceiptLineItem {
        ReceiptLineItem {
            description: desc.into(),
            quantity: None,
            unit_price: None,
            line_total: Money::parse(total).unwrap(),
            tax_included: None,
            confidence: 90,
        }
    }

    #[test]
    fn test_reconcile_totals() {
        let items = vec![item("a", "60.00"), item("b", "40.00")];
        assert_eq!(
            reconcile_totals(
                &items,
                Some(Money::parse("100.00").unwrap()),
                Some(Money::parse("100.03").unwrap()),
                5,
                0.005
            ),
            TotalMatch::Total
        );
        assert_eq!(
            reconcile_totals(
                &items,
                Some(Money::parse("100.00").unwrap()),
                Some(Money::parse("108.00").unwrap()),
                5,
                0.005
            ),
            TotalMatch::Subtotal
        );
        assert_eq!(
            reconcile_totals(
                &items,
                Some(Money::parse("90.00").unwrap()),
                Some(Money::parse("108.00").unwrap()),
                5,
                0.005
            ),
            TotalMatch::Mismatch
        );
    }

    #[test]
    fn test_distribute_tax_sums_to_grand_total() {
        let mut items = vec![item("a", "60.00"), item("b", "40.00")];
        distribute_tax(
            &mut items,
            Money::parse("8.00").unwrap(),
            Money::parse("100.00").unwrap(),
        );
        assert_eq!(items[0].line_total, Money::parse("64.80").unwrap());
        assert_eq!(items[1].line_total, Money::parse("43.20").unwrap());
        assert_eq!(items[0].tax_included, Some(Money::parse("4.80").unwrap()));
        let sum: Money = items.iter().map(|i| i.line_total).sum();
        assert_eq!(sum, Money::parse("108.00").unwrap());
    }

    #[test]
    fn test_distribute_tax_rounding_absorbed_by_last_item() {
        let mut items = vec![item("a", "33.33"), item("b", "33.33"), item("c", "33.34")];
        distribute_tax(
            &mut items,
            Money::parse("10.00").unwrap(),
            Money::parse("100.00").unwrap(),
        );
        let tax_sum: Money = items.iter().filter_map(|i| i.tax_included).sum();
        assert_eq!(tax_sum, Money::parse("10.00").unwrap());
        let sum: Money = items.iter().map(|i| i.line_total).sum();
        assert_eq!(sum, Money::parse("110.00").unwrap());
    }
}
