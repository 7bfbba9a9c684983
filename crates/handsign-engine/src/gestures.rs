use rand::seq::IndexedRandom;

/// A hand sign a user must show in their verification photo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gesture {
    pub emoji: String,
    pub description: String,
}

impl Gesture {
    pub fn new(emoji: &str, description: &str) -> Self {
        Self {
            emoji: emoji.to_string(),
            description: description.to_string(),
        }
    }

    /// `"✌️ (peace sign)"`, as stored on the request and shown to humans.
    pub fn label(&self) -> String {
        format!("{} ({})", self.emoji, self.description)
    }
}

pub fn default_gestures() -> Vec<Gesture> {
    vec![
        Gesture::new("✌️", "peace sign"),
        Gesture::new("👍", "thumbs up"),
        Gesture::new("👌", "OK sign"),
        Gesture::new("🤘", "rock on"),
        Gesture::new("🤙", "call me"),
        Gesture::new("✋", "open palm"),
        Gesture::new("🤞", "crossed fingers"),
        Gesture::new("☝️", "index finger up"),
    ]
}

/// Uniformly random pick. `None` only for an empty set.
pub fn pick(gestures: &[Gesture]) -> Option<&Gesture> {
    gestures.choose(&mut rand::rng())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_stays_within_the_set() {
        let set = default_gestures();
        for _ in 0..100 {
            let g = pick(&set).unwrap();
            assert!(set.contains(g));
        }
        assert!(pick(&[]).is_none());
    }

    #[test]
    fn label_joins_emoji_and_description() {
        assert_eq!(Gesture::new("✌️", "peace sign").label(), "✌️ (peace sign)");
    }
}
