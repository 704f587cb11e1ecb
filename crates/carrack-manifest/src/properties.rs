//! Localization resource parsing.
//!
//! Resources are plain `key=value` files. Header values beginning with `%`
//! name a key looked up in a merged set of these resources, loaded from
//! progressively more specific locale variants of a base name.

use std::collections::BTreeMap;

/// Parse a `key=value` resource file. Lines starting with `#` or `!` are
/// comments; keys and values are trimmed; later keys win.
pub fn parse_properties(input: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in input.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if !key.is_empty() {
                map.insert(key.to_owned(), value.trim().to_owned());
            }
        }
    }
    map
}

/// Ordered candidate resource names for a locale, least specific first:
/// `base`, `base_l1`, `base_l1_l2`, ... for locale `l1_l2_...`.
pub fn locale_resource_names(base: &str, locale: &str) -> Vec<String> {
    let mut names = Vec::with_capacity(4);
    let mut current = base.to_owned();
    names.push(current.clone());
    for part in locale.split('_').filter(|p| !p.is_empty()) {
        current.push('_');
        current.push_str(part);
        names.push(current.clone());
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_pairs() {
        let props = parse_properties("a=1\nb = two \n");
        assert_eq!(props.get("a").map(String::as_str), Some("1"));
        assert_eq!(props.get("b").map(String::as_str), Some("two"));
    }

    #[test]
    fn skips_comments_and_blanks() {
        let props = parse_properties("# comment\n! also\n\nkey=value\n");
        assert_eq!(props.len(), 1);
    }

    #[test]
    fn later_keys_win() {
        let props = parse_properties("k=first\nk=second\n");
        assert_eq!(props.get("k").map(String::as_str), Some("second"));
    }

    #[test]
    fn lines_without_separator_ignored() {
        let props = parse_properties("not a pair\nk=v\n");
        assert_eq!(props.len(), 1);
    }

    #[test]
    fn resource_names_for_empty_locale() {
        assert_eq!(locale_resource_names("locale/bundle", ""), vec!["locale/bundle"]);
    }

    #[test]
    fn resource_names_grow_with_locale() {
        assert_eq!(
            locale_resource_names("locale/bundle", "en_US"),
            vec!["locale/bundle", "locale/bundle_en", "locale/bundle_en_US"]
        );
    }
}
