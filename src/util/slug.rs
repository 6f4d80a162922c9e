//! ASCII slug generation with Cyrillic transliteration.

use unicode_normalization::UnicodeNormalization;

const CYR_MAP: &[(char, &str)] = &[
    ('а', "a"),
    ('б', "b"),
    ('в', "v"),
    ('г', "g"),
    ('д', "d"),
    ('е', "e"),
    ('ё', "yo"),
    ('ж', "zh"),
    ('з', "z"),
    ('и', "i"),
    ('й', "y"),
    ('к', "k"),
    ('л', "l"),
    ('м', "m"),
    ('н', "n"),
    ('о', "o"),
    ('п', "p"),
    ('р', "r"),
    ('с', "s"),
    ('т', "t"),
    ('у', "u"),
    ('ф', "f"),
    ('х', "h"),
    ('ц', "ts"),
    ('ч', "ch"),
    ('ш', "sh"),
    ('щ', "sch"),
    ('ъ', ""),
    ('ы', "y"),
    ('ь', ""),
    ('э', "e"),
    ('ю', "yu"),
    ('я', "ya"),
];

fn cyr_lookup(low: char) -> Option<&'static str> {
    CYR_MAP
        .iter()
        .find(|(c, _)| *c == low)
        .map(|(_, tr)| *tr)
}

fn translit_ru(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        let low = ch.to_lowercase().next().unwrap_or(ch);
        if let Some(tr) = cyr_lookup(low) {
            if ch.is_uppercase() && !tr.is_empty() {
                let mut chars = tr.chars();
                if let Some(first) = chars.next() {
                    out.extend(first.to_uppercase());
                    out.push_str(chars.as_str());
                }
            } else {
                out.push_str(tr);
            }
        } else {
            out.push(ch);
        }
    }
    out
}

/// Lowercase ASCII slug: Cyrillic transliteration, NFKD decomposition, ASCII
/// fold, then collapse to `[a-z0-9]+` groups joined by `-`. Idempotent.
pub fn slugify(text: &str, max_len: usize) -> String {
    let t = text.trim();
    if t.is_empty() {
        return "unnamed".to_string();
    }
    let t = translit_ru(t);
    let t: String = t.nfkd().filter(char::is_ascii).collect();
    let t = t.to_lowercase();

    let mut groups: Vec<&str> = Vec::new();
    let mut start: Option<usize> = None;
    for (i, ch) in t.char_indices() {
        let keep = ch.is_ascii_alphanumeric();
        match (keep, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                groups.push(&t[s..i]);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        groups.push(&t[s..]);
    }

    let joined = groups.join("-");
    let truncated: String = joined.chars().take(max_len).collect();
    let trimmed = truncated.trim_end_matches('-');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_unnamed() {
        assert_eq!(slugify("", 80), "unnamed");
        assert_eq!(slugify("   ", 80), "unnamed");
    }

    #[test]
    fn ascii_is_lowercased_and_hyphenated() {
        assert_eq!(slugify("United States", 80), "united-states");
    }

    #[test]
    fn cyrillic_is_transliterated() {
        assert_eq!(slugify("Москва", 80), "moskva");
        assert_eq!(slugify("Ёлки", 80), "yolki");
    }

    #[test]
    fn punctuation_collapses_to_single_hyphens() {
        assert_eq!(slugify("São Paulo!!!", 80), "sao-paulo");
    }

    #[test]
    fn idempotent() {
        let samples = ["United States", "Москва", "São Paulo!!!", "  ", "ü-ü-ü"];
        for s in samples {
            let once = slugify(s, 80);
            let twice = slugify(&once, 80);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn truncates_to_max_len() {
        let long = "a".repeat(200);
        assert_eq!(slugify(&long, 10).len(), 10);
    }
}
