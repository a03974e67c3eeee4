//! Message template rendering against an entity property snapshot.
//!
//! Templates use `{case.<property>}` variables. Any path that does
//! not resolve substitutes the literal `(?)` placeholder — rendering
//! never fails mid-send. The `.days_until` suffix renders the whole
//! days remaining until a timestamp-valued property (rounded to the
//! nearest day).

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::trigger::parse_timestamp;

/// Placeholder substituted for unresolvable variable paths.
pub const MISSING: &str = "(?)";

/// Render `template` against `properties` at time `now`.
pub fn render(template: &str, properties: &HashMap<String, String>, now: DateTime<Utc>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '{' => {
                if matches!(chars.peek(), Some((_, '{'))) {
                    chars.next();
                    out.push('{');
                    continue;
                }
                match template[i + 1..].find('}') {
                    Some(rel) => {
                        let path = &template[i + 1..i + 1 + rel];
                        out.push_str(&resolve(path, properties, now));
                        // Skip up to and including the closing brace
                        while let Some((j, _)) = chars.next() {
                            if j == i + 1 + rel {
                                break;
                            }
                        }
                    }
                    None => {
                        // Unclosed brace: render the rest literally
                        out.push('{');
                    }
                }
            }
            '}' => {
                if matches!(chars.peek(), Some((_, '}'))) {
                    chars.next();
                }
                out.push('}');
            }
            _ => out.push(c),
        }
    }
    out
}

/// Resolve one variable path, substituting `(?)` at any dead end.
fn resolve(path: &str, properties: &HashMap<String, String>, now: DateTime<Utc>) -> String {
    let mut parts = path.split('.');
    if parts.next() != Some("case") {
        return MISSING.to_string();
    }
    let Some(name) = parts.next() else {
        return MISSING.to_string();
    };
    let Some(value) = properties.get(name) else {
        return MISSING.to_string();
    };
    match parts.next() {
        None => value.clone(),
        Some("days_until") if parts.next().is_none() => match parse_timestamp(value) {
            // +12h floors to the nearest whole day
            Some(ts) => (ts - now + Duration::hours(12)).num_days().to_string(),
            None => MISSING.to_string(),
        },
        Some(_) => MISSING.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn substitutes_properties() {
        let text = render(
            "Hello {case.name}, your visit is due.",
            &props(&[("name", "Amina")]),
            now(),
        );
        assert_eq!(text, "Hello Amina, your visit is due.");
    }

    #[test]
    fn missing_path_becomes_placeholder() {
        assert_eq!(render("Hi {case.nope}", &props(&[]), now()), "Hi (?)");
        assert_eq!(render("Hi {user.name}", &props(&[]), now()), "Hi (?)");
        assert_eq!(render("Hi {case.a.b.c}", &props(&[("a", "x")]), now()), "Hi (?)");
    }

    #[test]
    fn days_until_rounds_to_nearest_day() {
        let p = props(&[("edd", "2024-01-11")]);
        // 2024-01-11T00:00 is 9d15h away from now; +12h rounds to 10
        assert_eq!(render("{case.edd.days_until} days left", &p, now()), "10 days left");
    }

    #[test]
    fn days_until_non_timestamp_is_placeholder() {
        assert_eq!(render("{case.x.days_until}", &props(&[("x", "soon")]), now()), "(?)");
    }

    #[test]
    fn brace_escapes_and_unclosed() {
        assert_eq!(render("{{literal}}", &props(&[]), now()), "{literal}");
        assert_eq!(render("dangling {case.name", &props(&[("name", "A")]), now()), "dangling {case.name");
    }
}
