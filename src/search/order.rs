use serde::{Deserialize, Serialize};

/// Order in which surviving siblings are queued for expansion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ordering {
    /// Discovery order
    #[serde(rename = "insertion")]
    Insertion,
    #[serde(rename = "random")]
    Random,
    /// Highest rank first
    #[default]
    #[serde(rename = "score-desc", alias = "normal")]
    ScoreDescending,
    /// Lowest rank first
    #[serde(rename = "score-asc", alias = "none")]
    ScoreAscending,
}

impl Ordering {
    pub fn needs_scores(&self) -> bool {
        matches!(self, Self::ScoreDescending | Self::ScoreAscending)
    }

    /// Reorder `items` in place. `score` is only consulted by the score
    /// orderings; ties keep discovery order.
    pub fn arrange<T>(&self, items: &mut Vec<(T, f64)>, rng: &mut fastrand::Rng) {
        if items.len() <= 1 {
            return;
        }
        match self {
            Self::Insertion => {}
            Self::Random => rng.shuffle(items),
            Self::ScoreDescending => {
                items.sort_by(|a, b| b.1.total_cmp(&a.1));
            }
            Self::ScoreAscending => {
                items.sort_by(|a, b| b.1.total_cmp(&a.1));
                items.reverse();
            }
        }
    }
}

impl std::fmt::Display for Ordering {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Insertion => "insertion",
            Self::Random => "random",
            Self::ScoreDescending => "score-desc",
            Self::ScoreAscending => "score-asc",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items() -> Vec<(&'static str, f64)> {
        vec![("a", 10.0), ("b", 90.0), ("c", 50.0), ("d", 90.0)]
    }

    fn names(items: &[(&'static str, f64)]) -> Vec<&'static str> {
        items.iter().map(|(n, _)| *n).collect()
    }

    #[test]
    fn test_score_descending_is_stable() {
        let mut v = items();
        Ordering::ScoreDescending.arrange(&mut v, &mut fastrand::Rng::with_seed(1));
        assert_eq!(names(&v), ["b", "d", "c", "a"]);
    }

    #[test]
    fn test_score_ascending_reverses_descending() {
        let mut v = items();
        Ordering::ScoreAscending.arrange(&mut v, &mut fastrand::Rng::with_seed(1));
        assert_eq!(names(&v), ["a", "c", "d", "b"]);
    }

    #[test]
    fn test_insertion_keeps_order() {
        let mut v = items();
        Ordering::Insertion.arrange(&mut v, &mut fastrand::Rng::with_seed(1));
        assert_eq!(names(&v), ["a", "b", "c", "d"]);
    }

    #[test]
    fn test_random_is_seeded() {
        let mut first = items();
        let mut second = items();
        Ordering::Random.arrange(&mut first, &mut fastrand::Rng::with_seed(42));
        Ordering::Random.arrange(&mut second, &mut fastrand::Rng::with_seed(42));
        assert_eq!(names(&first), names(&second));
    }

    #[test]
    fn test_aliases() {
        #[derive(Deserialize)]
        struct Wrap {
            ordering: Ordering,
        }
        let w: Wrap = toml::from_str("ordering = \"normal\"").unwrap();
        assert_eq!(w.ordering, Ordering::ScoreDescending);
        let w: Wrap = toml::from_str("ordering = \"none\"").unwrap();
        assert_eq!(w.ordering, Ordering::ScoreAscending);
        assert_eq!(Ordering::default().to_string(), "score-desc");
    }
}
