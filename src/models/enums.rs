use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }
    };
}

str_enum!(ExtractionMethod {
    LlmExtraction => "llm_extraction",
    PatternMatch => "pattern_match",
    OcrRegion => "ocr_region",
    ManualEntry => "manual_entry",
});

str_enum!(VerificationAction {
    Correct => "correct",
    Incorrect => "incorrect",
    NotFound => "not_found",
});

str_enum!(FieldKind {
    Text => "text",
    Number => "number",
    Date => "date",
    Boolean => "boolean",
    Array => "array",
    Table => "table",
    Object => "object",
});
