//! System prompts for receipt field extraction.
//!
//! Every prompt the pipeline sends lives here so prompt changes never touch
//! retry or parsing code, and tests can inspect prompts without a model.
//! Callers can override the two extraction prompts via
//! [`crate::config::ReceiptConfig::vision_prompt`] and
//! [`crate::config::ReceiptConfig::text_prompt`].

/// Default system prompt for the vision path (cropped image → JSON).
pub const VISION_PROMPT: &str = r#"You are a specialized receipt OCR engine. Extract all data from the receipt image into valid JSON.

1. STORE NAME
   - Ignore generic headers such as "Transaction Record", "Merchant Copy", "Original" or "Welcome".
   - The store name is usually the largest text or the first distinct business name in the top 20% of the receipt.

2. LINE ITEMS
   - Read every line. If an item appears several times, list it several times.
   - Do NOT list "Subtotal", "Tax", "Total", "Balance" or "Change" as items.
   - Standard items: `price` is the final line total; `qty` is 1 unless a quantity is printed.
   - Fuel ("Pump", "Regular", "Diesel", "Fuel"): `desc` is the grade, `qty` the volume in litres, `price` the unit price per litre.

3. TAXES AND TOTALS
   - Tax amounts are the money values labelled TPS, TVQ, GST, HST or QST. Extract the amount, not the registration number.
   - Report each tax as `tax_<label>_amount` using the lower-case label.

4. DATES
   - Format dates as YYYY-MM-DD and times as HH:MM.
   - If the year is ambiguous (e.g. "25"), prefer the current era (2024-2026).

5. OUTPUT
   - Output only one raw JSON object. No markdown, no explanations.
   - Use null for any field that is not printed on the receipt.

JSON STRUCTURE:
{
    "store_name": "string",
    "date": "YYYY-MM-DD",
    "time": "HH:MM",
    "total_amount": number,
    "subtotal": number,
    "tax_tps_amount": number,
    "tax_tvq_amount": number,
    "items": [
        { "desc": "string", "qty": number, "price": number }
    ]
}"#;

/// Default system prompt for the OCR path (recognised text → JSON).
pub const TEXT_PROMPT: &str = r#"You are a specialized receipt parsing engine. Convert the raw OCR text of a receipt into strict JSON.

1. STORE NAME
   - If the first line is "Transaction Record", "Merchant Copy", "Original" or "Welcome", skip it.
   - The store name is usually the first distinct business name in the top 5 lines.

2. FUEL
   - If you see "Pump", "Regular", "Diesel" or "Fuel Sales": `desc` is the grade, `qty` the volume in litres (e.g. "42.619L" -> 42.619), `price` the unit price (e.g. "$1.619/L" -> 1.619).
   - `qty * price` must roughly equal the printed line total.

3. ITEMS
   - Do NOT list "Subtotal", "Tax", "Total", "Balance Due" or "Payment" as items.
   - Only extract distinct products or services.

4. TAXES
   - Report each tax amount (TPS, TVQ, GST, HST, QST) as `tax_<label>_amount` using the lower-case label.

5. DATES
   - Format dates as YYYY-MM-DD and times as HH:MM.
   - If the year is ambiguous, prefer the current era (2024-2026).

6. OUTPUT
   - Return ONLY one JSON object. Write numbers, never arithmetic expressions.
   - Use null for anything the text does not contain.

JSON STRUCTURE:
{
    "store_name": "string or null",
    "date": "YYYY-MM-DD or null",
    "time": "HH:MM or null",
    "total_amount": number,
    "subtotal": number,
    "tax_tps_amount": number,
    "tax_tvq_amount": number,
    "items": [
        { "desc": "string", "qty": number, "price": number }
    ]
}"#;

/// System prompt for the second attempt: the previous response is sent back
/// as the user message.
pub const REPAIR_PROMPT: &str = "You are a code fixer. Fix the following invalid JSON. \
Replace any math expression with its value (e.g. '5*2' -> '10'). \
Remove comments and trailing commas. Return ONLY the JSON object.";

/// System prompt for [`crate::pipeline::text::VisionLineRecognizer`].
pub const TRANSCRIBE_PROMPT: &str = r#"You are an OCR engine. Transcribe every line of text printed on this receipt image.

- Output one receipt line per output line, top to bottom, exactly as printed.
- Keep prices, quantities and codes on the same line as their description.
- Do not summarise, translate, correct or comment.
- Do not wrap the output in code fences."#;

/// Build the user message carrying OCR text for the text path.
pub fn text_user_message(ocr_text: &str) -> String {
    format!("RAW TEXT:\n{}", ocr_text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extraction_prompts_name_every_schema_field() {
        for prompt in [VISION_PROMPT, TEXT_PROMPT] {
            for field in [
                "store_name",
                "date",
                "time",
                "total_amount",
                "subtotal",
                "tax_tps_amount",
                "tax_tvq_amount",
                "items",
                "desc",
                "qty",
                "price",
            ] {
                assert!(prompt.contains(field), "prompt is missing {field}");
            }
        }
    }

    #[test]
    fn text_user_message_prefixes_raw_text() {
        assert_eq!(text_user_message("STORE\nTOTAL 5.00"), "RAW TEXT:\nSTORE\nTOTAL 5.00");
    }
}
