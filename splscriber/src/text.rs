//! Text helpers shared by the extractor, renderer and import transform.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

static TAG_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());

/// Collapse every run of whitespace into a single space.
///
/// Leading and trailing whitespace is kept as a single space so inline text
/// fragments can be concatenated without gluing words together.
pub fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push(' ');
                in_space = true;
            }
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

/// Label text transliterations, one row per replacement. Case is kept; the micro sign
/// becomes `mc` the way labels abbreviate micrograms (`mcg`) and microliters (`mcL`).
const TRANSLITERATIONS: &[(&str, &str)] = &[
    ("ÀÁÂÃÄÅĀĂĄ", "A"),
    ("àáâãäåāăą", "a"),
    ("ÇĆČ", "C"),
    ("çćč", "c"),
    ("ÈÉÊËĒĖĘĚ", "E"),
    ("èéêëēėęě", "e"),
    ("ÌÍÎÏĪĮİ", "I"),
    ("ìíîïīįı", "i"),
    ("Ł", "L"),
    ("ł", "l"),
    ("ÑŃŇ", "N"),
    ("ñńň", "n"),
    ("ÒÓÔÕÖØŌŐ", "O"),
    ("òóôõöøōő", "o"),
    ("Ř", "R"),
    ("ř", "r"),
    ("ŚŞŠ", "S"),
    ("śşš", "s"),
    ("ÙÚÛÜŪŮŰ", "U"),
    ("ùúûüūůű", "u"),
    ("Ý", "Y"),
    ("ýÿ", "y"),
    ("ŹŻŽ", "Z"),
    ("źżž", "z"),
    ("Æ", "AE"),
    ("æ", "ae"),
    ("Œ", "OE"),
    ("œ", "oe"),
    ("ß", "ss"),
    ("α", "alpha"),
    ("β", "beta"),
    ("γ", "gamma"),
    ("δ", "delta"),
    ("ε", "epsilon"),
    ("κ", "kappa"),
    ("ω", "omega"),
    ("µμ", "mc"),
    ("\u{2010}\u{2011}\u{2012}\u{2013}\u{2014}\u{2212}", "-"),
    ("\u{2018}\u{2019}`", "'"),
    ("\u{201C}\u{201D}", "\""),
    ("…", "..."),
    ("•·", "*"),
    ("≥", ">="),
    ("≤", "<="),
    ("±", "+/-"),
    ("×", "x"),
    ("°", " degrees "),
];

static TRANSLITERATION_TABLE: LazyLock<HashMap<char, &'static str>> = LazyLock::new(|| {
    TRANSLITERATIONS
        .iter()
        .flat_map(|(chars, ascii)| chars.chars().map(move |c| (c, *ascii)))
        .collect()
});

/// Transliterate label text to ASCII and collapse whitespace. Characters with no
/// transliteration become spaces.
///
/// ```
/// use splscriber::text::normalize_to_ascii;
/// assert_eq!(normalize_to_ascii("Naproxén—NSAID"), "Naproxen-NSAID");
/// assert_eq!(normalize_to_ascii("Store at 25°C ± 2°"), "Store at 25 degrees C +/- 2 degrees");
/// ```
pub fn normalize_to_ascii(text: &str) -> String {
    let mut ascii = String::with_capacity(text.len());
    for c in text.chars() {
        match TRANSLITERATION_TABLE.get(&c) {
            Some(replacement) => ascii.push_str(replacement),
            None if c.is_ascii() => ascii.push(c),
            None => ascii.push(' '),
        }
    }
    ascii.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Derive a camelCase section key from a free-text label.
///
/// Punctuation is stripped and words are joined, so `"SPL UNCLASSIFIED SECTION"` becomes
/// `splUnclassifiedSection`. Labels that produce nothing usable fall back to `section`.
pub fn camel_case_key(label: &str) -> String {
    let ascii = normalize_to_ascii(label);
    let mut key = String::new();
    for word in ascii
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let lower = word.to_ascii_lowercase();
        if key.is_empty() {
            key.push_str(&lower);
        } else {
            let mut chars = lower.chars();
            if let Some(first) = chars.next() {
                key.push(first.to_ascii_uppercase());
                key.push_str(chars.as_str());
            }
        }
    }

    if key.is_empty() {
        return "section".to_string();
    }
    if key.starts_with(|c: char| c.is_ascii_digit()) {
        key.insert_str(0, "section");
    }
    key
}

/// Turn a camelCase key back into a readable heading (`instructionsForUse2` →
/// `Instructions For Use 2`).
pub fn format_key_title(key: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut prev: Option<char> = None;
    for c in key.chars() {
        let boundary = match prev {
            Some(p) => {
                (c.is_ascii_uppercase() && !p.is_ascii_uppercase())
                    || (c.is_ascii_digit() && !p.is_ascii_digit())
            }
            None => false,
        };
        if boundary && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        current.push(c);
        prev = Some(c);
    }
    if !current.is_empty() {
        words.push(current);
    }

    words
        .into_iter()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Escape text for inclusion in HTML element content.
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Escape text for inclusion in a double-quoted HTML attribute.
pub fn escape_attr(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Flatten rendered HTML to plain text: tags become spaces, the entities produced by
/// [`escape_text`]/[`escape_attr`] are decoded, whitespace is collapsed and trimmed.
pub fn html_to_text(html: &str) -> String {
    let stripped = TAG_PATTERN.replace_all(html, " ");
    let decoded = stripped
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    collapse_whitespace(&decoded).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transliterates_label_text() {
        assert_eq!(normalize_to_ascii("Ångström  Œuvre"), "Angstrom OEuvre");
        assert_eq!(normalize_to_ascii("500 \u{b5}g or 2 \u{3bc}L"), "500 mcg or 2 mcL");
        assert_eq!(normalize_to_ascii("interferon β\u{2011}1a"), "interferon beta-1a");
        assert_eq!(normalize_to_ascii("dose ≥ 10 mg • daily ✓"), "dose >= 10 mg * daily");
    }

    #[test]
    fn camel_case_key_strips_punctuation() {
        assert_eq!(camel_case_key("SPL UNCLASSIFIED SECTION"), "splUnclassifiedSection");
        assert_eq!(camel_case_key("Indications & Usage"), "indicationsUsage");
        assert_eq!(camel_case_key("17 PATIENT COUNSELING"), "section17PatientCounseling");
        assert_eq!(camel_case_key("***"), "section");
    }

    #[test]
    fn format_key_title_splits_camel_case_and_digits() {
        assert_eq!(format_key_title("instructionsForUse"), "Instructions For Use");
        assert_eq!(format_key_title("instructionsForUse2"), "Instructions For Use 2");
        assert_eq!(format_key_title("dosage"), "Dosage");
    }

    #[test]
    fn html_to_text_decodes_and_collapses() {
        let text = html_to_text("<p>Take &lt;2 tablets</p>\n<ul><li>with   food</li></ul>");
        assert_eq!(text, "Take <2 tablets with food");
    }

    #[test]
    fn escape_attr_quotes() {
        assert_eq!(escape_attr(r#"a "b" & c"#), "a &quot;b&quot; &amp; c");
    }

    #[test]
    fn collapse_whitespace_keeps_single_edges() {
        assert_eq!(collapse_whitespace("\n  Treats   X. \n"), " Treats X. ");
    }
}
