//! Room identifier generation.
//!
//! An identifier is four words joined with hyphens, one word drawn from each
//! of four vocabularies picked without replacement from the six below. Word
//! selection uses the OS entropy source so identifiers are not guessable.

use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "happy", "brave", "calm", "clever", "eager", "gentle", "jolly", "kind", "lively", "merry",
    "nimble", "proud", "quiet", "swift", "warm", "witty", "bright", "bold", "cozy", "daring",
    "fancy", "glad", "keen", "lucky", "mellow", "neat", "plucky", "quirky", "rosy", "snug",
    "spry", "sunny", "tidy", "vivid", "zesty", "breezy",
];

const ANIMALS: &[&str] = &[
    "kitten", "otter", "badger", "falcon", "gecko", "heron", "ibex", "jaguar", "koala", "lemur",
    "marmot", "narwhal", "ocelot", "panda", "quokka", "raven", "seal", "toucan", "urchin",
    "vole", "walrus", "yak", "zebra", "beaver", "condor", "dingo", "egret", "ferret", "gibbon",
    "hedgehog", "iguana", "jackal", "kiwi", "lynx", "magpie", "newt",
];

const COLORS: &[&str] = &[
    "amber", "azure", "beige", "cobalt", "coral", "crimson", "emerald", "fuchsia", "gold",
    "indigo", "ivory", "jade", "lavender", "lilac", "magenta", "maroon", "mauve", "ochre",
    "olive", "onyx", "pearl", "plum", "russet", "saffron", "sage", "scarlet", "sepia", "sienna",
    "silver", "slate", "teal", "topaz", "umber", "violet", "cyan", "copper",
];

const FOODS: &[&str] = &[
    "waffle", "bagel", "churro", "dumpling", "eclair", "fudge", "gnocchi", "hummus", "icing",
    "jam", "kebab", "latte", "muffin", "nougat", "pickle", "pretzel", "quiche", "ramen",
    "scone", "taco", "udon", "vanilla", "wasabi", "yogurt", "ziti", "biscuit", "crumpet",
    "donut", "espresso", "falafel", "granola", "honey", "mango", "noodle", "pesto", "sorbet",
];

const NATURE: &[&str] = &[
    "aspen", "birch", "canyon", "delta", "ember", "fjord", "glacier", "harbor", "island",
    "juniper", "kelp", "lagoon", "meadow", "nectar", "oasis", "prairie", "quartz", "reef",
    "summit", "tundra", "valley", "willow", "yonder", "zephyr", "boulder", "cascade", "dune",
    "estuary", "fern", "geyser", "heather", "inlet", "pebble", "knoll", "lichen", "moss",
];

const SPACE: &[&str] = &[
    "stardust", "aurora", "comet", "cosmos", "eclipse", "galaxy", "horizon", "ion", "jupiter",
    "kepler", "luna", "meteor", "nebula", "orbit", "pulsar", "quasar", "rocket", "saturn",
    "twilight", "umbra", "vega", "zenith", "andromeda", "borealis", "crater", "drift",
    "equinox", "flare", "gravity", "halo", "infinity", "lyra", "nova", "photon", "rigel",
    "solstice",
];

const VOCABULARIES: &[&[&str]] = &[ADJECTIVES, ANIMALS, COLORS, FOODS, NATURE, SPACE];

/// Words per identifier, drawn from that many distinct vocabularies.
const WORD_COUNT: usize = 4;

/// Generate a room identifier from the given randomness source.
pub fn room_id_with<R: Rng>(rng: &mut R) -> String {
    let picked: Vec<&&[&str]> = VOCABULARIES
        .choose_multiple(rng, WORD_COUNT)
        .collect();
    picked
        .iter()
        .map(|vocab| *vocab.choose(rng).expect("vocabulary is non-empty"))
        .collect::<Vec<_>>()
        .join("-")
}

/// Generate a room identifier from OS randomness.
pub fn room_id() -> String {
    room_id_with(&mut OsRng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn vocabulary_of(word: &str) -> Option<usize> {
        VOCABULARIES
            .iter()
            .position(|vocab| vocab.contains(&word))
    }

    #[test]
    fn fixed_seed_is_deterministic() {
        let a = room_id_with(&mut StdRng::seed_from_u64(7));
        let b = room_id_with(&mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    #[test]
    fn four_words_from_distinct_vocabularies() {
        for seed in 0..200 {
            let id = room_id_with(&mut StdRng::seed_from_u64(seed));
            let words: Vec<&str> = id.split('-').collect();
            assert_eq!(words.len(), WORD_COUNT, "id {id:?}");

            let vocabs: HashSet<usize> = words
                .iter()
                .map(|w| vocabulary_of(w).unwrap_or_else(|| panic!("{w:?} not in any vocabulary")))
                .collect();
            assert_eq!(vocabs.len(), WORD_COUNT, "id {id:?} reused a vocabulary");
        }
    }

    #[test]
    fn distinct_seeds_vary() {
        let ids: HashSet<String> = (0..50)
            .map(|seed| room_id_with(&mut StdRng::seed_from_u64(seed)))
            .collect();
        assert!(ids.len() > 40);
    }

    #[test]
    fn vocabularies_are_disjoint() {
        let mut seen = HashSet::new();
        for vocab in VOCABULARIES {
            for word in *vocab {
                assert!(seen.insert(*word), "{word:?} appears in two vocabularies");
            }
        }
    }
}
