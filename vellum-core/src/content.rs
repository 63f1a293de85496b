//! Per-type content validation for blocks.
//!
//! Every block type stores its payload as a JSON object and requires one
//! type-specific field to be present:
//!
//! | Block type | Required field |
//! |------------|----------------|
//! | text       | `text`         |
//! | heading    | `text`         |
//! | code       | `code`         |
//! | latex      | `formula`      |
//! | image      | `url`          |
//! | table      | `rows`         |
//! | list       | `items`        |
//!
//! Headings additionally accept an optional `level` field which, when
//! present, must be an integer in 1..=6 (absent means level 1).

use serde_json::Value;
use std::error::Error;
use std::fmt;

use crate::BlockType;

/// Why a content payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentError {
    /// The payload was not a JSON object.
    NotAnObject,
    /// The type-specific required field was missing.
    MissingField(&'static str),
    /// A heading carried a `level` outside 1..=6 (or not an integer).
    InvalidHeadingLevel,
}

impl fmt::Display for ContentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentError::NotAnObject => write!(f, "content must be a JSON object"),
            ContentError::MissingField(field) => {
                write!(f, "content is missing required field '{}'", field)
            }
            ContentError::InvalidHeadingLevel => {
                write!(f, "heading level must be an integer between 1 and 6")
            }
        }
    }
}

impl Error for ContentError {}

/// The field a block type's content object must carry.
pub fn required_field(block_type: BlockType) -> &'static str {
    match block_type {
        BlockType::Text | BlockType::Heading => "text",
        BlockType::Code => "code",
        BlockType::Latex => "formula",
        BlockType::Image => "url",
        BlockType::Table => "rows",
        BlockType::List => "items",
    }
}

/// Check that `content` is a well-formed payload for `block_type`.
pub fn validate_content(block_type: BlockType, content: &Value) -> Result<(), ContentError> {
    let obj = content.as_object().ok_or(ContentError::NotAnObject)?;

    let field = required_field(block_type);
    if !obj.contains_key(field) {
        return Err(ContentError::MissingField(field));
    }

    if block_type == BlockType::Heading {
        if let Some(level) = obj.get("level") {
            match level.as_u64() {
                Some(n) if (1..=6).contains(&n) => {}
                _ => return Err(ContentError::InvalidHeadingLevel),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_requires_text_field() {
        assert!(validate_content(BlockType::Text, &json!({"text": "hello"})).is_ok());
        assert_eq!(
            validate_content(BlockType::Text, &json!({"body": "hello"})),
            Err(ContentError::MissingField("text"))
        );
    }

    #[test]
    fn test_non_object_rejected() {
        assert_eq!(
            validate_content(BlockType::Text, &json!("just a string")),
            Err(ContentError::NotAnObject)
        );
        assert_eq!(
            validate_content(BlockType::List, &json!([1, 2, 3])),
            Err(ContentError::NotAnObject)
        );
        assert_eq!(
            validate_content(BlockType::Code, &Value::Null),
            Err(ContentError::NotAnObject)
        );
    }

    #[test]
    fn test_heading_level_bounds() {
        // Absent level is fine (treated as level 1)
        assert!(validate_content(BlockType::Heading, &json!({"text": "t"})).is_ok());

        for level in 1..=6 {
            assert!(
                validate_content(BlockType::Heading, &json!({"text": "t", "level": level})).is_ok()
            );
        }

        for bad in [json!(0), json!(7), json!(-1), json!(2.5), json!("3")] {
            assert_eq!(
                validate_content(BlockType::Heading, &json!({"text": "t", "level": bad})),
                Err(ContentError::InvalidHeadingLevel)
            );
        }
    }

    #[test]
    fn test_per_type_required_fields() {
        assert!(validate_content(BlockType::Code, &json!({"code": "fn main() {}"})).is_ok());
        assert!(validate_content(BlockType::Latex, &json!({"formula": "e^{i\\pi}"})).is_ok());
        assert!(validate_content(BlockType::Image, &json!({"url": "https://x/y.png"})).is_ok());
        assert!(validate_content(BlockType::Table, &json!({"rows": [["a"]]})).is_ok());
        assert!(validate_content(BlockType::List, &json!({"items": ["one"]})).is_ok());

        assert_eq!(
            validate_content(BlockType::Latex, &json!({"text": "wrong"})),
            Err(ContentError::MissingField("formula"))
        );
        assert_eq!(
            validate_content(BlockType::Image, &json!({})),
            Err(ContentError::MissingField("url"))
        );
    }

    #[test]
    fn test_extra_fields_allowed() {
        assert!(validate_content(
            BlockType::Code,
            &json!({"code": "x", "language": "rust", "line_numbers": true})
        )
        .is_ok());
    }
}
