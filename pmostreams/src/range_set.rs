//! Suivi des plages d'octets déjà présentes dans le cache local.
//!
//! Un [`RangeSet`] est une séquence ordonnée de plages fermées `[lower, upper]`
//! disjointes et non adjacentes. Deux plages qui se touchent
//! (`left.upper + 1 >= right.lower`) sont systématiquement fusionnées.
//! Il n'existe aucune opération de suppression : les plages ne font que croître.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Plage fermée d'offsets 64 bits, inclusive aux deux bornes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(u64, u64)", into = "(u64, u64)")]
pub struct ByteRange {
    lower: u64,
    upper: u64,
}

impl ByteRange {
    /// Crée une plage `[lower, upper]`. Exige `lower <= upper`.
    pub fn new(lower: u64, upper: u64) -> Self {
        debug_assert!(lower <= upper, "invalid range [{lower}, {upper}]");
        Self { lower, upper }
    }

    /// Plage réduite à un seul octet.
    pub fn single(offset: u64) -> Self {
        Self::new(offset, offset)
    }

    pub fn lower(&self) -> u64 {
        self.lower
    }

    pub fn upper(&self) -> u64 {
        self.upper
    }

    /// Nombre d'octets couverts (les bornes sont inclusives).
    pub fn len(&self) -> u64 {
        self.upper - self.lower + 1
    }

    /// `true` si `other` est entièrement contenue dans `self`.
    pub fn contains(&self, other: &ByteRange) -> bool {
        self.lower <= other.lower && other.upper <= self.upper
    }

    /// Intersection des deux plages, ou `None` si elles sont disjointes.
    pub fn intersect(&self, other: &ByteRange) -> Option<ByteRange> {
        let lower = self.lower.max(other.lower);
        let upper = self.upper.min(other.upper);
        (lower <= upper).then_some(ByteRange { lower, upper })
    }
}

impl From<(u64, u64)> for ByteRange {
    fn from((lower, upper): (u64, u64)) -> Self {
        // Les métadonnées viennent du disque : on répare plutôt que de paniquer.
        Self {
            lower: lower.min(upper),
            upper: lower.max(upper),
        }
    }
}

impl From<ByteRange> for (u64, u64) {
    fn from(range: ByteRange) -> Self {
        (range.lower, range.upper)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.lower, self.upper)
    }
}

/// Ensemble de plages disjointes, triées par borne inférieure croissante.
///
/// Sérialisé comme une liste plate de paires `[lower, upper]`. À la
/// désérialisation, chaque paire repasse par [`RangeSet::union`] : un fichier de
/// métadonnées désordonné ou chevauchant est donc renormalisé silencieusement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<ByteRange>", into = "Vec<ByteRange>")]
pub struct RangeSet {
    ranges: Vec<ByteRange>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Nombre de plages distinctes.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Somme des longueurs de toutes les plages (octets couverts).
    pub fn total_len(&self) -> u64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }

    /// Copie des plages internes. Jamais exposées par référence : les mutations
    /// passent uniquement par [`RangeSet::union`].
    pub fn to_vec(&self) -> Vec<ByteRange> {
        self.ranges.clone()
    }

    /// Insère une plage à sa position triée puis fusionne les voisines devenues
    /// contiguës ou chevauchantes, jusqu'à stabilité.
    pub fn union(&mut self, range: ByteRange) {
        let position = self
            .ranges
            .iter()
            .position(|r| range.lower() <= r.lower())
            .unwrap_or(self.ranges.len());
        self.ranges.insert(position, range);
        self.merge_contiguous();
    }

    fn merge_contiguous(&mut self) {
        let mut i = 0;
        while i + 1 < self.ranges.len() {
            let left = self.ranges[i];
            let right = self.ranges[i + 1];
            // Test de contiguïté : adjacentes ou chevauchantes.
            if left.upper() + 1 >= right.lower() {
                self.ranges[i] = ByteRange::new(left.lower(), left.upper().max(right.upper()));
                self.ranges.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    /// Première plage interne qui chevauche `range`, réduite au chevauchement.
    pub fn intersect(&self, range: &ByteRange) -> Option<ByteRange> {
        self.ranges.iter().find_map(|r| r.intersect(range))
    }

    /// `true` si une plage interne contient entièrement `range`.
    pub fn contains(&self, range: &ByteRange) -> bool {
        self.ranges.iter().any(|r| r.contains(range))
    }
}

impl From<Vec<ByteRange>> for RangeSet {
    fn from(ranges: Vec<ByteRange>) -> Self {
        let mut set = RangeSet::new();
        for range in ranges {
            set.union(range);
        }
        set
    }
}

impl From<RangeSet> for Vec<ByteRange> {
    fn from(set: RangeSet) -> Self {
        set.ranges
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{range}")?;
        }
        write!(f, "}}")
    }
}
