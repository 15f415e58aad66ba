//! Collation used for text sorts and order strings: case and accents are
//! ignored at the primary level and only break ties.

use std::cmp::Ordering;

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

fn primary(s: &str) -> impl Iterator<Item = char> + '_ {
    s.nfkd().filter(|c| !is_combining_mark(*c)).flat_map(char::to_lowercase)
}

fn secondary(s: &str) -> impl Iterator<Item = char> + '_ { s.nfkd().flat_map(char::to_lowercase) }

/// Primary sort key for `s`. Keys that differ compare bytewise the way
/// [`compare`] orders their strings.
pub fn key(s: &str) -> String { primary(s).collect() }

pub fn compare(a: &str, b: &str) -> Ordering {
    primary(a).cmp(primary(b)).then_with(|| secondary(a).cmp(secondary(b)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_case() {
        assert_eq!(compare("Alpha", "alpha"), Ordering::Equal);
        assert_eq!(compare("alpha", "Beta"), Ordering::Less);
        assert_eq!(compare("Éclair", "éclair"), Ordering::Equal);
        assert_eq!(key("MaRs"), "mars");
    }

    #[test]
    fn accents_fold_to_their_base_letter() {
        assert_eq!(compare("éclair", "zebra"), Ordering::Less);
        assert_eq!(compare("Ärger", "apfel"), Ordering::Greater);
        assert_eq!(compare("Ångström", "angstrom"), Ordering::Greater);
        assert_eq!(compare("eclair", "éclair"), Ordering::Less);
        assert_eq!(compare("ﬁle", "FILE"), Ordering::Equal);
        assert_eq!(key("Crème Brûlée"), "creme brulee");
    }

    #[test]
    fn scripts_keep_their_block_order() {
        assert_eq!(compare("яблоко", "apple"), Ordering::Greater);
        assert_eq!(compare("Яблоко", "яблоко"), Ordering::Equal);
        assert_eq!(compare("Ωmega", "ωmega"), Ordering::Equal);
        assert_eq!(compare("ёлка", "ель"), Ordering::Less);
        let mut words = vec!["zebra", "Éclair", "яблоко", "apple", "Über"];
        words.sort_by(|a, b| compare(a, b));
        assert_eq!(words, vec!["apple", "Éclair", "Über", "zebra", "яблоко"]);
    }
}
