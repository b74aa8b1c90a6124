//! JSON normalization for model output
//!
//! Models wrap JSON in markdown fences, leave trailing commas, or add
//! comments. The extractor tries progressively more forgiving passes and
//! fails only when no object can be recovered.

use regex::Regex;

use super::types::GatewayError;

/// Fix common model JSON defects: line comments and trailing commas.
fn sanitize(text: &str) -> String {
    let no_comments = Regex::new(r"//[^\n]*").unwrap().replace_all(text, "");
    Regex::new(r",\s*([}\]])")
        .unwrap()
        .replace_all(&no_comments, "$1")
        .into_owned()
}

/// Extract a JSON value from raw model text.
pub fn extract_json(text: &str) -> Result<serde_json::Value, GatewayError> {
    let trimmed = text.trim();

    // 1. Direct parse
    if let Ok(v) = serde_json::from_str(trimmed) {
        return Ok(v);
    }

    // 2. Fenced block
    let fence = Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").unwrap();
    if let Some(caps) = fence.captures(trimmed) {
        let inner = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        if let Ok(v) = serde_json::from_str(inner) {
            return Ok(v);
        }
        if let Ok(v) = serde_json::from_str(&sanitize(inner)) {
            return Ok(v);
        }
    }

    // 3. Outermost object
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            let slice = &trimmed[start..=end];
            if let Ok(v) = serde_json::from_str(slice) {
                return Ok(v);
            }
            if let Ok(v) = serde_json::from_str(&sanitize(slice)) {
                return Ok(v);
            }
        }
    }

    // 4. Sanitize everything
    if let Ok(v) = serde_json::from_str(&sanitize(trimmed)) {
        return Ok(v);
    }

    let preview: String = trimmed.chars().take(200).collect();
    Err(GatewayError::InvalidResponse(format!(
        "No JSON object in model output: {}",
        preview
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_parse() {
        let v = extract_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn test_fenced_block() {
        let v = extract_json("Here you go:\n```json\n{\"a\": 2}\n```").unwrap();
        assert_eq!(v["a"], 2);
    }

    #[test]
    fn test_embedded_object() {
        let v = extract_json("The answer is {\"confidence\": 85} as requested.").unwrap();
        assert_eq!(v["confidence"], 85);
    }

    #[test]
    fn test_trailing_commas_and_comments() {
        let v = extract_json("{\"items\": [1, 2,], // note\n \"ok\": true,}").unwrap();
        assert_eq!(v["items"].as_array().unwrap().len(), 2);
        assert_eq!(v["ok"], true);
    }

    #[test]
    fn test_garbage_fails() {
        assert!(extract_json("no json here at all").is_err());
    }
}
