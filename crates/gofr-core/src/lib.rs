//! Core domain model for GOFR: offer records, categories, and identity hashing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "gofr-core";

/// Length of the identity fingerprint in hex characters.
///
/// 7 chars ≈ 28 bits; collisions are tolerated in exchange for short
/// redirect tokens.
pub const IDENTITY_HASH_LEN: usize = 7;

/// Offer category, persisted as its legacy store token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    IvyLeagueCourse,
    UdemyCourse,
    ItchioGame,
    Videogame,
    Dlc,
    Unknown,
}

impl Category {
    pub const ALL_NOTIFIABLE: [Category; 5] = [
        Category::IvyLeagueCourse,
        Category::UdemyCourse,
        Category::ItchioGame,
        Category::Videogame,
        Category::Dlc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::IvyLeagueCourse => "Ivy_League_Course",
            Category::UdemyCourse => "Udemy_Course",
            Category::ItchioGame => "itchio_game",
            Category::Videogame => "Videogame",
            Category::Dlc => "DLC",
            Category::Unknown => "unknown",
        }
    }

    pub fn from_token(token: &str) -> Self {
        match token {
            "Ivy_League_Course" => Category::IvyLeagueCourse,
            "Udemy_Course" => Category::UdemyCourse,
            "itchio_game" => Category::ItchioGame,
            "Videogame" => Category::Videogame,
            "DLC" => Category::Dlc,
            _ => Category::Unknown,
        }
    }

    /// Phrase used when the category appears inside generated ad copy.
    pub fn display_phrase(&self) -> &'static str {
        match self {
            Category::IvyLeagueCourse => "Ivy League course",
            Category::UdemyCourse => "Udemy course",
            Category::ItchioGame | Category::Videogame => "game",
            Category::Dlc => "DLC",
            Category::Unknown => "content",
        }
    }

    /// Classify an offer by its source and resolved link.
    ///
    /// Mirrors the historical per-site routing: gamerpower links under
    /// `/dlc/` are loot drops, everything else from gamerpower is a game.
    pub fn classify(source_url: &str, link: &str) -> Self {
        let source = source_url.to_ascii_lowercase();
        let link = link.to_ascii_lowercase();

        const UDEMY_SOURCES: [&str; 6] = [
            "real.discount",
            "scrollcoupons.com",
            "onlinecourses.ooo",
            "udemyfreebies.com",
            "infognu.com",
            "jucktion.com",
        ];

        if source.contains("itch.io") {
            Category::ItchioGame
        } else if source.contains("gamerpower.com") {
            if link.contains("/dlc/") {
                Category::Dlc
            } else {
                Category::Videogame
            }
        } else if source.contains("classcentral.com") {
            Category::IvyLeagueCourse
        } else if UDEMY_SOURCES.iter().any(|domain| source.contains(domain)) {
            Category::UdemyCourse
        } else {
            Category::Unknown
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Category::from_token(s))
    }
}

/// Deterministic content identity: first 7 hex chars of SHA-256(title ‖ link).
///
/// Every producer path derives identity this way; the hash doubles as the
/// public redirect token.
pub fn identity_hash(title: &str, link: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(link.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..IDENTITY_HASH_LEN].to_string()
}

/// Build the public click-through URL carrying an identity hash.
pub fn redirect_url(base: &str, hash: &str) -> String {
    format!("{base}?hash={hash}")
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DraftError {
    #[error("offer draft has an empty title")]
    EmptyTitle,
    #[error("offer draft has an empty link")]
    EmptyLink,
}

/// Producer-boundary handoff: one candidate offer as scraped, before it has
/// an identity or any store-managed timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferDraft {
    pub category: Category,
    pub title: String,
    pub link: String,
    #[serde(default)]
    pub description: Option<String>,
    pub pub_date: DateTime<Utc>,
    #[serde(default)]
    pub image_url: Option<String>,
    pub source_url: String,
}

impl OfferDraft {
    /// Validate the draft and attach its computed identity.
    ///
    /// Rejection is a per-item data error; callers skip the item and keep
    /// processing the batch.
    pub fn validate(self) -> Result<Offer, DraftError> {
        if self.title.trim().is_empty() {
            return Err(DraftError::EmptyTitle);
        }
        if self.link.trim().is_empty() {
            return Err(DraftError::EmptyLink);
        }
        let identity_hash = identity_hash(&self.title, &self.link);
        Ok(Offer {
            identity_hash,
            category: self.category,
            title: self.title,
            link: self.link,
            description: self.description,
            pub_date: self.pub_date,
            image_url: self.image_url,
            source_url: self.source_url,
            ad_copy: None,
        })
    }
}

/// Validated offer carrying its identity hash, ready for reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub identity_hash: String,
    pub category: Category,
    pub title: String,
    pub link: String,
    pub description: Option<String>,
    pub pub_date: DateTime<Utc>,
    pub image_url: Option<String>,
    pub source_url: String,
    pub ad_copy: Option<String>,
}

/// Producer of short promotional copy for a newly sighted offer.
///
/// A `None` return means reconciliation proceeds without copy; copy
/// generation is never allowed to fail an item.
pub trait AdCopyGenerator: Send + Sync {
    fn generate(&self, category: Category, title: &str) -> Option<String>;
}

/// Fixed-template copy generator, the default (and historical) implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateAdCopy;

impl AdCopyGenerator for TemplateAdCopy {
    fn generate(&self, category: Category, title: &str) -> Option<String> {
        let phrase = category.display_phrase();
        Some(format!(
            "🔥 FREE {phrase} ALERT! 🔥 Get instant access to our premium {title} \
             without spending a single penny - available completely FREE for a \
             limited time only! Don't miss this incredible opportunity to unlock \
             your {phrase} at zero cost - claim your copy of {title} right now \
             while it's still FREE!"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn draft(title: &str, link: &str) -> OfferDraft {
        OfferDraft {
            category: Category::Videogame,
            title: title.to_string(),
            link: link.to_string(),
            description: None,
            pub_date: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap(),
            image_url: None,
            source_url: "https://www.gamerpower.com".to_string(),
        }
    }

    #[test]
    fn identity_is_deterministic_and_short() {
        let a = identity_hash("Free Game X", "https://g.example/x");
        let b = identity_hash("Free Game X", "https://g.example/x");
        assert_eq!(a, b);
        assert_eq!(a.len(), IDENTITY_HASH_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn identity_changes_with_either_field() {
        let base = identity_hash("Free Game X", "https://g.example/x");
        assert_ne!(base, identity_hash("Free Game Y", "https://g.example/x"));
        assert_ne!(base, identity_hash("Free Game X", "https://g.example/y"));
    }

    #[test]
    fn category_tokens_round_trip() {
        for category in Category::ALL_NOTIFIABLE {
            assert_eq!(Category::from_token(category.as_str()), category);
        }
        assert_eq!(Category::from_token("something-else"), Category::Unknown);
    }

    #[test]
    fn classify_routes_known_sources() {
        assert_eq!(
            Category::classify("https://itch.io", "https://itch.io/some-game"),
            Category::ItchioGame
        );
        assert_eq!(
            Category::classify(
                "https://www.gamerpower.com",
                "https://www.gamerpower.com/dlc/free-loot"
            ),
            Category::Dlc
        );
        assert_eq!(
            Category::classify(
                "https://www.gamerpower.com",
                "https://www.gamerpower.com/free-game"
            ),
            Category::Videogame
        );
        assert_eq!(
            Category::classify("https://www.classcentral.com", "https://u.example/a"),
            Category::IvyLeagueCourse
        );
        assert_eq!(
            Category::classify("https://www.real.discount/", "https://udemy.com/course"),
            Category::UdemyCourse
        );
        assert_eq!(
            Category::classify("https://example.org", "https://example.org/x"),
            Category::Unknown
        );
    }

    #[test]
    fn draft_validation_rejects_empty_fields() {
        let mut bad = draft("", "https://g.example/x");
        assert_eq!(bad.clone().validate().unwrap_err(), DraftError::EmptyTitle);
        bad = draft("Free Game X", "  ");
        assert_eq!(bad.validate().unwrap_err(), DraftError::EmptyLink);
    }

    #[test]
    fn validated_offer_carries_identity() {
        let offer = draft("Free Game X", "https://g.example/x").validate().unwrap();
        assert_eq!(
            offer.identity_hash,
            identity_hash("Free Game X", "https://g.example/x")
        );
        assert!(offer.ad_copy.is_none());
    }

    #[test]
    fn redirect_url_embeds_hash() {
        assert_eq!(
            redirect_url("https://offers.example/", "abc1234"),
            "https://offers.example/?hash=abc1234"
        );
    }

    #[test]
    fn template_copy_mentions_title_and_phrase() {
        let copy = TemplateAdCopy
            .generate(Category::UdemyCourse, "Rust for Everyone")
            .unwrap();
        assert!(copy.contains("Rust for Everyone"));
        assert!(copy.contains("Udemy course"));
    }
}
