//! 模型响应解析
//!
//! 模型经常把 JSON 包在 ```json 代码块里，或在前后加说明文字。
//! 这里只负责把响应还原成"条目数组"，字段级校验由各任务完成。

use regex::Regex;
use serde_json::Value;

/// 去掉 Markdown 代码块围栏
pub fn strip_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Ok(re) = Regex::new(r"(?s)```[a-zA-Z]*\s*\n?(.*?)\n?\s*```") {
        if let Some(caps) = re.captures(trimmed) {
            if let Some(body) = caps.get(1) {
                return body.as_str().trim().to_string();
            }
        }
    }
    trimmed.to_string()
}

/// 从响应中取出条目数组
///
/// 接受顶层数组，或只包含一个数组字段的对象（如 `{"results": [...]}`）
pub fn extract_entries(raw: &str) -> Result<Vec<Value>, String> {
    let body = strip_fences(raw);
    if body.is_empty() {
        return Err("响应为空".to_string());
    }

    let value = parse_lenient(&body)?;
    match value {
        Value::Array(entries) => Ok(entries),
        Value::Object(map) => {
            let mut arrays = map.into_iter().filter_map(|(_, v)| match v {
                Value::Array(entries) => Some(entries),
                _ => None,
            });
            match (arrays.next(), arrays.next()) {
                (Some(entries), None) => Ok(entries),
                (None, _) => Err("对象中没有数组字段".to_string()),
                (Some(_), Some(_)) => Err("对象中包含多个数组字段".to_string()),
            }
        }
        other => Err(format!("期望数组或对象，实际为 {}", type_name(&other))),
    }
}

/// 先整体解析，失败后截取最外层的 `[...]` 或 `{...}` 再试
fn parse_lenient(body: &str) -> Result<Value, String> {
    match serde_json::from_str::<Value>(body) {
        Ok(v) => Ok(v),
        Err(first_err) => {
            for (open, close) in [('[', ']'), ('{', '}')] {
                if let (Some(start), Some(end)) = (body.find(open), body.rfind(close)) {
                    if start < end {
                        if let Ok(v) = serde_json::from_str::<Value>(&body[start..=end]) {
                            return Ok(v);
                        }
                    }
                }
            }
            Err(format!("JSON 解析失败: {}", first_err))
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// 条目的 question_id，数字 id 也接受
pub fn entry_id(entry: &Value) -> Option<String> {
    match entry.get("question_id")? {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// 字符串字段
pub fn str_field<'a>(entry: &'a Value, name: &str) -> Option<&'a str> {
    entry.get(name).and_then(Value::as_str)
}

/// 数值字段，也接受 "7.5" 这样的字符串
pub fn f64_field(entry: &Value, name: &str) -> Option<f64> {
    match entry.get(name)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|v: &f64| v.is_finite())
}

/// 字符串列表字段，缺失时为空
pub fn str_list_field(entry: &Value, name: &str) -> Vec<String> {
    match entry.get(name) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

/// 按字符数截断
pub fn clip(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_fences() {
        let raw = "```json\n[{\"question_id\": \"1\"}]\n```";
        assert_eq!(strip_fences(raw), "[{\"question_id\": \"1\"}]");
        assert_eq!(strip_fences("  [1]  "), "[1]");
    }

    #[test]
    fn test_accepts_top_level_array() {
        let entries = extract_entries(r#"[{"question_id": "1"}, {"question_id": 2}]"#).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entry_id(&entries[1]).as_deref(), Some("2"));
    }

    #[test]
    fn test_accepts_wrapped_array() {
        let entries = extract_entries(r#"{"results": [{"question_id": "1"}], "note": "ok"}"#).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_accepts_surrounding_prose() {
        let raw = "好的，结果如下：\n[{\"question_id\": \"1\"}]\n以上。";
        assert_eq!(extract_entries(raw).unwrap().len(), 1);
    }

    #[test]
    fn test_rejects_non_array_payloads() {
        assert!(extract_entries("").is_err());
        assert!(extract_entries("无法评分").is_err());
        assert!(extract_entries(r#"{"a": [1], "b": [2]}"#).is_err());
        assert!(extract_entries(r#"{"score": 3}"#).is_err());
    }

    #[test]
    fn test_field_helpers() {
        let entry = json!({"score": "7.5", "strengths": ["清晰", " ", 3], "weaknesses": "缺少单位"});
        assert_eq!(f64_field(&entry, "score"), Some(7.5));
        assert_eq!(str_list_field(&entry, "strengths"), vec!["清晰"]);
        assert_eq!(str_list_field(&entry, "weaknesses"), vec!["缺少单位"]);
        assert!(str_list_field(&entry, "missing").is_empty());
        assert_eq!(clip("一二三四", 2), "一二");
    }
}
