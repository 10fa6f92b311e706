use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use super::{
    set_formatter, validator, virtual_formatter, SetFormatter, Table, Validator, VirtualFormatter,
};
use crate::template::{self, Template};

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)+$")
            .expect("static regex is valid")
    })
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:https?|ftp)://[^\s/$.?#][^\s]*$").expect("static regex is valid")
    })
}

fn uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
            .expect("static regex is valid")
    })
}

/// Apply a string predicate; non-string values never validate.
fn string_check(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Validator {
    validator(move |value: &Value| value.as_str().map_or(false, &f))
}

pub(super) fn validators() -> Table<Validator> {
    Table::new()
        .with("isEmail", string_check(|s| email_re().is_match(s)))
        .with("isURL", string_check(|s| url_re().is_match(s)))
        .with("isUUID", string_check(|s| uuid_re().is_match(s)))
        .with(
            "isNumeric",
            validator(|v| match v {
                Value::Number(_) => true,
                Value::String(s) => !s.is_empty() && s.parse::<f64>().is_ok(),
                _ => false,
            }),
        )
        .with(
            "isInt",
            validator(|v| match v {
                Value::Number(n) => n.is_i64() || n.is_u64(),
                Value::String(s) => s.parse::<i64>().is_ok(),
                _ => false,
            }),
        )
        .with(
            "isAlpha",
            string_check(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphabetic())),
        )
        .with(
            "isAlphanumeric",
            string_check(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric())),
        )
        .with("isLowercase", string_check(|s| s == s.to_lowercase()))
        .with("isUppercase", string_check(|s| s == s.to_uppercase()))
        .with(
            "isHexadecimal",
            string_check(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())),
        )
        .with(
            "isMongoId",
            string_check(|s| s.len() == 24 && s.chars().all(|c| c.is_ascii_hexdigit())),
        )
        .with(
            "notEmpty",
            validator(|v| match v {
                Value::Null => false,
                Value::String(s) => !s.trim().is_empty(),
                Value::Array(items) => !items.is_empty(),
                Value::Object(map) => !map.is_empty(),
                _ => true,
            }),
        )
}

/// Map string values through `f`; other values pass through untouched.
fn string_map(f: impl Fn(&str) -> String + Send + Sync + 'static) -> SetFormatter {
    set_formatter(move |value| match value {
        Value::String(s) => Value::String(f(&s)),
        other => other,
    })
}

pub(super) fn set_formatters() -> Table<SetFormatter> {
    Table::new()
        .with("trim", string_map(|s| s.trim().to_string()))
        .with("toLowerCase", string_map(str::to_lowercase))
        .with("toUpperCase", string_map(str::to_uppercase))
        .with("slugify", string_map(template::slugify))
}

pub(super) fn virtual_formatters() -> Table<VirtualFormatter> {
    Table::new().with(
        "template",
        virtual_formatter(|record, args| {
            let Some(raw) = args.first().and_then(Value::as_str) else {
                return Value::Null;
            };
            match Template::parse(raw) {
                Ok(template) => Value::String(template.render(record.doc())),
                Err(e) => {
                    log::warn!("Template virtual skipped: {e}");
                    Value::Null
                }
            }
        }),
    )
}
