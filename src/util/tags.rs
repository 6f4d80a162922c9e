//! Tag-preference lookups mirroring the OSM tag naming conventions.

use std::collections::HashMap;

const PREFERRED_NAME_KEYS: &[&str] = &[
    "name:ru",
    "name",
    "name:en",
    "official_name:ru",
    "official_name",
    "short_name:ru",
    "short_name",
];

const PREFERRED_ENGLISH_NAME_KEYS: &[&str] = &[
    "name:en",
    "int_name",
    "official_name:en",
    "official_name",
    "name",
    "short_name:en",
    "short_name",
];

const ISO2_KEYS: &[&str] = &[
    "ISO3166-1:alpha2",
    "ISO3166-1",
    "iso3166-1:alpha2",
    "iso3166-1",
];

fn first_non_empty(tags: &HashMap<String, String>, keys: &[&str]) -> String {
    for key in keys {
        if let Some(v) = tags.get(*key) {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    String::new()
}

pub fn preferred_name_from_tags(tags: &HashMap<String, String>) -> String {
    first_non_empty(tags, PREFERRED_NAME_KEYS)
}

pub fn preferred_english_name_from_tags(tags: &HashMap<String, String>) -> String {
    first_non_empty(tags, PREFERRED_ENGLISH_NAME_KEYS)
}

pub fn iso2_from_tags(tags: &HashMap<String, String>) -> String {
    for key in ISO2_KEYS {
        if let Some(v) = tags.get(*key) {
            let normalized = v.trim().to_uppercase();
            if normalized.len() == 2 && normalized.chars().all(|c| c.is_ascii_alphabetic()) {
                return normalized;
            }
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn preferred_name_prefers_russian_first() {
        let t = tags(&[("name", "Germany"), ("name:ru", "Германия")]);
        assert_eq!(preferred_name_from_tags(&t), "Германия");
    }

    #[test]
    fn preferred_english_name_skips_russian() {
        let t = tags(&[("name", "Germany"), ("name:ru", "Германия")]);
        assert_eq!(preferred_english_name_from_tags(&t), "Germany");
    }

    #[test]
    fn iso2_rejects_three_letter_codes() {
        let t = tags(&[("ISO3166-1:alpha2", "DEU")]);
        assert_eq!(iso2_from_tags(&t), "");
    }

    #[test]
    fn iso2_accepts_two_letter_code() {
        let t = tags(&[("ISO3166-1:alpha2", "de")]);
        assert_eq!(iso2_from_tags(&t), "DE");
    }

    #[test]
    fn empty_tags_yield_empty_strings() {
        let t = HashMap::new();
        assert_eq!(preferred_name_from_tags(&t), "");
        assert_eq!(iso2_from_tags(&t), "");
    }
}
