#![forbid(unsafe_code)]

use parley_domain::Attachment;
use serde_json::Value;

/// Turn the loosely typed `attachments` field of a send into an ordered list.
///
/// Accepts an array, or a string holding a JSON array. Anything else,
/// including a string that does not parse, yields an empty list. Inside an
/// array, bare strings are taken as URLs and unusable entries are skipped.
pub fn normalize_attachments(raw: &Value) -> Vec<Attachment> {
	match raw {
		Value::Array(items) => items.iter().filter_map(attachment_from_value).collect(),
		Value::String(s) => match serde_json::from_str::<Value>(s) {
			Ok(Value::Array(items)) => items.iter().filter_map(attachment_from_value).collect(),
			_ => Vec::new(),
		},
		_ => Vec::new(),
	}
}

fn attachment_from_value(v: &Value) -> Option<Attachment> {
	match v {
		Value::String(url) if !url.trim().is_empty() => Some(Attachment {
			url: url.clone(),
			mime: None,
			size: None,
			name: None,
		}),
		Value::Object(_) => serde_json::from_value::<Attachment>(v.clone())
			.ok()
			.filter(|a| !a.url.trim().is_empty()),
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn array_is_kept_in_order() {
		let raw = json!([
			{"url": "/u/1.png", "mime": "image/png", "size": 10},
			{"url": "/u/2.pdf", "mimetype": "application/pdf", "filename": "doc.pdf"}
		]);
		let out = normalize_attachments(&raw);
		assert_eq!(out.len(), 2);
		assert_eq!(out[0].url, "/u/1.png");
		assert_eq!(out[1].mime.as_deref(), Some("application/pdf"));
		assert_eq!(out[1].name.as_deref(), Some("doc.pdf"));
	}

	#[test]
	fn serialized_string_form_is_parsed() {
		let raw = Value::String(r#"[{"url":"/u/a.jpg"}]"#.to_string());
		let out = normalize_attachments(&raw);
		assert_eq!(out.len(), 1);
		assert_eq!(out[0].url, "/u/a.jpg");
	}

	#[test]
	fn malformed_string_degrades_to_empty() {
		assert!(normalize_attachments(&Value::String("[{not json".into())).is_empty());
		assert!(normalize_attachments(&Value::String(r#"{"url":"/x"}"#.into())).is_empty());
		assert!(normalize_attachments(&Value::Null).is_empty());
		assert!(normalize_attachments(&json!(42)).is_empty());
	}

	#[test]
	fn unusable_entries_are_skipped() {
		let raw = json!(["/u/plain.png", 7, {"mime": "x"}, {"url": ""}, {"url": "/u/ok"}]);
		let urls: Vec<_> = normalize_attachments(&raw).into_iter().map(|a| a.url).collect();
		assert_eq!(urls, vec!["/u/plain.png", "/u/ok"]);
	}
}
