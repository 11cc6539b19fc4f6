//! `{FieldName}` placeholder substitution.
//!
//! Every schema field is substituted on every call. A token only matches as a
//! whole (`{Name}` never matches inside `{NameSuffix}`), tokens for unknown
//! fields are left as written, and substituted values are not rescanned.
//! There is no escape syntax: literal braces around a field name are always
//! replaced.

use crate::dataset::Record;

/// Render `template` against `record`. Null values render as the empty string.
///
/// No token from the template survives for a known field. A value that itself
/// contains `{Other}` is copied as is, so such text can still appear in the
/// output.
#[must_use]
pub fn render(template: &str, record: &Record) -> String {
    // Longest names first: a field name containing `}` must win over its own prefix.
    let mut fields: Vec<_> = record.fields().collect();
    fields.sort_by_key(|(name, _)| std::cmp::Reverse(name.len()));

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        let hit = fields.iter().find(|(name, _)| {
            after.starts_with(name) && after[name.len()..].starts_with('}')
        });
        match hit {
            Some((name, value)) => {
                out.push_str(&value.to_string());
                rest = &after[name.len() + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// The tokens an operator can use with the given columns.
#[must_use]
pub fn placeholders(columns: &[String]) -> Vec<String> {
    columns.iter().map(|c| format!("{{{c}}}")).collect()
}
