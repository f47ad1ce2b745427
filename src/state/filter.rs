// DANS : src/state/filter.rs

use super::model::Bank;
use alloy::primitives::Address;

/// Vue dérivée du snapshot : "mes tirelires" et/ou recherche floue.
/// Fonction pure du snapshot courant, ne touche jamais au modèle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotFilter {
    pub owner: Option<Address>,
    pub query: Option<String>,
}

impl SnapshotFilter {
    pub fn owned_by(mut self, owner: Address) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn matching(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Conserve l'ordre d'entrée pour les éléments de même score.
    pub fn apply(&self, banks: &[Bank]) -> Vec<Bank> {
        let owned = banks
            .iter()
            .filter(|bank| self.owner.is_none_or(|owner| bank.owner == owner));

        let query = match self.query.as_deref().map(str::trim) {
            Some(q) if !q.is_empty() => q.to_lowercase(),
            _ => return owned.cloned().collect(),
        };

        let mut scored: Vec<(usize, &Bank)> = owned
            .filter_map(|bank| search_score(bank, &query).map(|score| (score, bank)))
            .collect();
        scored.sort_by_key(|(score, _)| *score);
        scored.into_iter().map(|(_, bank)| bank.clone()).collect()
    }
}

/// Premier champ qui matche, dans l'ordre adresse, nom, propriétaire.
fn search_score(bank: &Bank, query: &str) -> Option<usize> {
    [
        bank.address.to_string(),
        bank.display_name.clone(),
        bank.owner.to_string(),
    ]
    .iter()
    .find_map(|field| fuzzy_score(&field.to_lowercase(), query))
}

/// Plus petit = meilleur. 1 pour une égalité exacte, sinon 2 plus l'étendue
/// la plus serrée des caractères trouvés (ou la position, pour un seul caractère).
fn fuzzy_score(haystack: &str, query: &str) -> Option<usize> {
    if haystack == query {
        return Some(1);
    }
    let hay: Vec<char> = haystack.chars().collect();
    let needle: Vec<char> = query.chars().collect();
    let first = *needle.first()?;

    let mut best: Option<usize> = None;
    for start in (0..hay.len()).filter(|&i| hay[i] == first) {
        let Some(end) = subsequence_end(&hay[start + 1..], &needle[1..]) else {
            // Aucun départ plus tardif ne fera mieux.
            break;
        };
        let score = if needle.len() == 1 {
            start
        } else {
            end + 1
        };
        best = Some(best.map_or(score, |b| b.min(score)));
    }
    best.map(|score| score + 2)
}

/// Index (relatif à `hay`) du dernier caractère de `needle` trouvé en
/// correspondance gloutonne, ou 0 si `needle` est vide.
fn subsequence_end(hay: &[char], needle: &[char]) -> Option<usize> {
    let mut last = 0;
    let mut pos = 0;
    for c in needle {
        let offset = hay[pos..].iter().position(|h| h == c)?;
        last = pos + offset;
        pos = last + 1;
    }
    Some(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{U256, address};
    use chrono::Utc;

    const CC: Address = address!("00000000000000000000000000000000000000cc");
    const DD: Address = address!("00000000000000000000000000000000000000dd");

    fn bank(last_byte: u8, name: &str, owner: Address) -> Bank {
        Bank {
            address: Address::with_last_byte(last_byte),
            display_name: name.to_string(),
            owner,
            native_balance: U256::ZERO,
            tokens: vec![],
            collectibles: vec![],
            last_synced_at: Utc::now(),
        }
    }

    fn names(banks: &[Bank]) -> Vec<&str> {
        banks.iter().map(|b| b.display_name.as_str()).collect()
    }

    #[test]
    fn owner_filter_keeps_relative_order() {
        let snapshot = vec![
            bank(1, "un", CC),
            bank(2, "deux", DD),
            bank(3, "trois", CC),
            bank(4, "quatre", DD),
        ];
        let owned = SnapshotFilter::default().owned_by(CC).apply(&snapshot);
        assert_eq!(names(&owned), vec!["un", "trois"]);
    }

    #[test]
    fn empty_query_keeps_everything() {
        let snapshot = vec![bank(1, "Vacances", CC), bank(2, "Vélo", DD)];
        assert_eq!(SnapshotFilter::default().matching("  ").apply(&snapshot).len(), 2);
        assert_eq!(SnapshotFilter::default().apply(&snapshot).len(), 2);
    }

    #[test]
    fn fuzzy_query_is_a_case_insensitive_subsequence() {
        let snapshot = vec![
            bank(0x11, "Voyage au Canada", CC),
            bank(0x12, "Vacances", CC),
            bank(0x13, "Cadeau", CC),
        ];
        // "vcn" est une sous-séquence de "voyage au canada" et de "vacances",
        // plus serrée dans "vacances".
        let found = SnapshotFilter::default().matching("VCN").apply(&snapshot);
        assert_eq!(names(&found), vec!["Vacances", "Voyage au Canada"]);

        let none = SnapshotFilter::default().matching("xyz").apply(&snapshot);
        assert!(none.is_empty());
    }

    #[test]
    fn exact_match_ranks_first() {
        let snapshot = vec![bank(0x21, "Vacances 2024", CC), bank(0x22, "vacances", CC)];
        let found = SnapshotFilter::default().matching("Vacances").apply(&snapshot);
        assert_eq!(names(&found), vec!["vacances", "Vacances 2024"]);
    }

    #[test]
    fn query_also_matches_addresses() {
        let snapshot = vec![bank(0x31, "a", CC), bank(0x32, "b", DD)];
        let found = SnapshotFilter::default().matching("0xdd").apply(&snapshot);
        // Aucun nom ni adresse de tirelire ne contient "0xdd" : seul le propriétaire DD matche.
        assert_eq!(names(&found), vec!["b"]);
    }

    #[test]
    fn owner_and_query_combine() {
        let snapshot = vec![bank(0x41, "Vacances", DD), bank(0x42, "Vacances", CC)];
        let found = SnapshotFilter::default()
            .owned_by(CC)
            .matching("vac")
            .apply(&snapshot);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].owner, CC);
    }
}
