//! Invalidation rules: which tags a kind of mutation makes stale.
//!
//! Each [`Mutation`] maps the identifiers it touched and the payload fields it
//! changed to a set of tags. Card edits are narrowed to the sub-region the
//! payload actually touches; anything unrecognised widens to every region.

use std::collections::BTreeSet;
use std::fmt;

use serde_json::Value;

use super::tags::Tag;

/// Tag classes shared by read routes and invalidation rules.
pub mod class {
    pub const CARD: &str = "Card";
    pub const OVERVIEW: &str = "Overview";
    pub const FLASHCARDS: &str = "Flashcards";
    pub const QUIZ: &str = "Quiz";
    pub const REVIEW_QUEUE: &str = "ReviewQueue";
    pub const CATEGORY: &str = "Category";
    pub const ITEM: &str = "Item";
    pub const MEMBERS: &str = "Members";
    pub const LIBRARY: &str = "Library";
    pub const PROGRESS: &str = "Progress";
    pub const PROFILE: &str = "Profile";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mutation {
    CardCreated,
    CardUpdated,
    CardDeleted,
    ItemAdded,
    ItemUpdated,
    ItemDeleted,
    ItemsReordered,
    MembershipGranted,
    MembershipRevoked,
    ProgressRecorded,
    ProfileUpdated,
}

impl Mutation {
    pub const ALL: [Mutation; 11] = [
        Self::CardCreated,
        Self::CardUpdated,
        Self::CardDeleted,
        Self::ItemAdded,
        Self::ItemUpdated,
        Self::ItemDeleted,
        Self::ItemsReordered,
        Self::MembershipGranted,
        Self::MembershipRevoked,
        Self::ProgressRecorded,
        Self::ProfileUpdated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CardCreated => "card_created",
            Self::CardUpdated => "card_updated",
            Self::CardDeleted => "card_deleted",
            Self::ItemAdded => "item_added",
            Self::ItemUpdated => "item_updated",
            Self::ItemDeleted => "item_deleted",
            Self::ItemsReordered => "items_reordered",
            Self::MembershipGranted => "membership_granted",
            Self::MembershipRevoked => "membership_revoked",
            Self::ProgressRecorded => "progress_recorded",
            Self::ProfileUpdated => "profile_updated",
        }
    }

    /// Tags made stale by this mutation.
    pub fn tags(self, ids: &AffectedIds, fields: &ChangedFields) -> Vec<Tag> {
        let mut tags = TagSet::default();
        let card = ids.card.as_deref();

        match self {
            Self::CardCreated => {
                tags.class(class::CARD);
                match fields.category() {
                    Some(category) => tags.instance(class::CATEGORY, Some(category)),
                    None => tags.class(class::CATEGORY),
                }
                tags.owned(ids.actor.as_deref(), class::LIBRARY);
            }
            Self::CardUpdated => {
                tags.card_aggregates(card);
                for region in fields.regions() {
                    tags.region(region, card, fields);
                }
            }
            Self::CardDeleted => {
                tags.class(class::CARD);
                tags.class(class::CATEGORY);
                tags.card_aggregates(card);
                for region in Region::ALL {
                    tags.region(region, card, fields);
                }
                tags.instance(class::MEMBERS, card);
                // Every member's library and progress may reference the card.
                tags.class(class::LIBRARY);
                tags.class(class::PROGRESS);
            }
            Self::ItemAdded | Self::ItemUpdated | Self::ItemDeleted | Self::ItemsReordered => {
                tags.card_aggregates(card);
                if self != Self::ItemsReordered
                    && let Some(item) = ids.item.as_deref()
                {
                    tags.push(Tag::instance(class::ITEM, item));
                }
                let regions = if self == Self::ItemDeleted {
                    Region::ALL.into_iter().collect()
                } else {
                    fields.regions()
                };
                for region in regions
                    .into_iter()
                    .filter(|region| matches!(region, Region::Flashcards | Region::Quiz))
                {
                    tags.region(region, card, fields);
                }
            }
            Self::MembershipGranted | Self::MembershipRevoked => {
                tags.instance(class::MEMBERS, card);
                tags.owned(ids.member(), class::LIBRARY);
                if self == Self::MembershipRevoked {
                    tags.owned_instance(ids.member(), class::PROGRESS, card);
                }
            }
            Self::ProgressRecorded => {
                tags.owned_instance(ids.actor.as_deref(), class::PROGRESS, card);
                tags.owned(ids.actor.as_deref(), class::PROGRESS);
                tags.owned(ids.actor.as_deref(), class::LIBRARY);
            }
            Self::ProfileUpdated => {
                let user = ids.user.as_deref().or(ids.actor.as_deref());
                tags.instance(class::PROFILE, user);
                tags.owned(user, class::PROFILE);
                tags.class(class::MEMBERS);
            }
        }

        tags.into_vec()
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifiers a mutation touched, gathered from path parameters and the
/// authenticated principal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AffectedIds {
    pub card: Option<String>,
    pub item: Option<String>,
    /// Subject of membership and profile operations.
    pub user: Option<String>,
    /// Principal performing the mutation.
    pub actor: Option<String>,
}

impl AffectedIds {
    pub fn card(card: impl Into<String>) -> Self {
        Self {
            card: Some(card.into()),
            ..Self::default()
        }
    }

    /// Build from path parameters, by naming convention.
    pub fn from_params<'a, I>(params: I, actor: Option<&str>) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut ids = Self {
            actor: actor.map(str::to_string),
            ..Self::default()
        };
        for (name, value) in params {
            let slot = match name {
                "id" | "card_id" | "cardId" => &mut ids.card,
                "item_id" | "itemId" => &mut ids.item,
                "user_id" | "userId" | "member_id" | "memberId" => &mut ids.user,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.to_string());
            }
        }
        ids
    }

    fn member(&self) -> Option<&str> {
        self.user.as_deref().or(self.actor.as_deref())
    }
}

/// Sub-regions of a card that are cached and invalidated independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Region {
    Overview,
    Flashcards,
    Quiz,
    Category,
}

impl Region {
    pub const ALL: [Region; 4] = [
        Self::Overview,
        Self::Flashcards,
        Self::Quiz,
        Self::Category,
    ];

    fn for_field(field: &str) -> Option<Self> {
        match field {
            "question" | "answer" | "hint" | "front" | "back" | "flashcard" | "flashcards"
            | "cards" => Some(Self::Flashcards),
            "option" | "options" | "quiz" | "quizzes" | "choices" | "correctOption"
            | "correct_option" => Some(Self::Quiz),
            "title" | "description" | "coverImage" | "cover_image" | "visibility" | "tags" => {
                Some(Self::Overview)
            }
            "category" | "categoryId" | "category_id" => Some(Self::Category),
            _ => None,
        }
    }
}

/// Top-level field names present in a mutation payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangedFields {
    names: BTreeSet<String>,
    category: Option<String>,
}

impl ChangedFields {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            category: None,
        }
    }

    /// Read field names (and the new category, if any) from a JSON object.
    /// Anything other than an object yields no fields.
    pub fn from_json(payload: &Value) -> Self {
        let Some(object) = payload.as_object() else {
            return Self::default();
        };
        let category = ["category", "categoryId", "category_id"]
            .iter()
            .find_map(|field| object.get(*field))
            .and_then(|value| match value {
                Value::String(text) if !text.is_empty() => Some(text.clone()),
                Value::Number(number) => Some(number.to_string()),
                _ => None,
            });
        Self {
            names: object.keys().cloned().collect(),
            category,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self.names.insert("category".to_string());
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    /// Regions touched by these fields; every region when none is recognised.
    pub fn regions(&self) -> BTreeSet<Region> {
        let regions: BTreeSet<Region> = self
            .names
            .iter()
            .filter_map(|name| Region::for_field(name))
            .collect();
        if regions.is_empty() {
            Region::ALL.into_iter().collect()
        } else {
            regions
        }
    }
}

#[derive(Default)]
struct TagSet(BTreeSet<Tag>);

impl TagSet {
    fn push(&mut self, tag: Tag) {
        self.0.insert(tag);
    }

    fn class(&mut self, class: &str) {
        self.push(Tag::class(class));
    }

    /// Instance tag, or the whole class when the id is unknown.
    fn instance(&mut self, class: &str, id: Option<&str>) {
        match id {
            Some(id) => self.push(Tag::instance(class, id)),
            None => self.class(class),
        }
    }

    /// Principal-scoped class tag, or the global class when nobody is known.
    fn owned(&mut self, principal: Option<&str>, class: &str) {
        match principal {
            Some(principal) => self.push(Tag::principal_class(principal, class)),
            None => self.class(class),
        }
    }

    fn owned_instance(&mut self, principal: Option<&str>, class: &str, id: Option<&str>) {
        match (principal, id) {
            (Some(principal), Some(id)) => self.push(Tag::principal(principal, class, id)),
            (Some(principal), None) => self.push(Tag::principal_class(principal, class)),
            (None, _) => self.class(class),
        }
    }

    /// Views that mix every region of a card.
    fn card_aggregates(&mut self, card: Option<&str>) {
        self.instance(class::OVERVIEW, card);
        self.instance(class::REVIEW_QUEUE, card);
    }

    fn region(&mut self, region: Region, card: Option<&str>, fields: &ChangedFields) {
        match region {
            Region::Flashcards => self.instance(class::FLASHCARDS, card),
            Region::Quiz => self.instance(class::QUIZ, card),
            Region::Overview => {
                self.instance(class::OVERVIEW, card);
                self.instance(class::CARD, card);
            }
            Region::Category => {
                self.class(class::CATEGORY);
                if let Some(category) = fields.category() {
                    self.push(Tag::instance(class::CATEGORY, category));
                }
                self.instance(class::CARD, card);
            }
        }
    }

    fn into_vec(self) -> Vec<Tag> {
        self.0.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn names(tags: &[Tag]) -> Vec<&str> {
        tags.iter().map(Tag::as_str).collect()
    }

    #[test]
    fn quiz_edit_touches_only_quiz_and_aggregates() {
        let fields = ChangedFields::from_json(&json!({ "options": ["a", "b"], "correctOption": 1 }));
        let tags = Mutation::CardUpdated.tags(&AffectedIds::card("c1"), &fields);
        assert_eq!(names(&tags), vec!["Overview:c1", "Quiz:c1", "ReviewQueue:c1"]);
    }

    #[test]
    fn category_change_reaches_category_listings() {
        let fields = ChangedFields::from_json(&json!({ "options": [], "category": "Math" }));
        let tags = Mutation::CardUpdated.tags(&AffectedIds::card("c1"), &fields);
        assert_eq!(
            names(&tags),
            vec![
                "Card:c1",
                "Category",
                "Category:Math",
                "Overview:c1",
                "Quiz:c1",
                "ReviewQueue:c1"
            ]
        );
    }

    #[test]
    fn flashcard_fields_select_flashcards_region() {
        let fields = ChangedFields::new(["question", "answer"]);
        let tags = Mutation::CardUpdated.tags(&AffectedIds::card("c1"), &fields);
        assert!(tags.contains(&Tag::new("Flashcards:c1")));
        assert!(!tags.contains(&Tag::new("Quiz:c1")));
    }

    #[test]
    fn unknown_fields_widen_to_every_region() {
        let tags = Mutation::CardUpdated.tags(
            &AffectedIds::card("c1"),
            &ChangedFields::new(["somethingElse"]),
        );
        for expected in ["Flashcards:c1", "Quiz:c1", "Overview:c1", "Card:c1", "Category"] {
            assert!(tags.contains(&Tag::new(expected)), "missing {expected}");
        }
    }

    #[test]
    fn missing_ids_fall_back_to_class_tags() {
        let tags = Mutation::CardUpdated.tags(&AffectedIds::default(), &ChangedFields::new(["title"]));
        assert_eq!(names(&tags), vec!["Card", "Overview", "ReviewQueue"]);
    }

    #[test]
    fn progress_is_scoped_to_the_actor() {
        let ids = AffectedIds {
            card: Some("c1".into()),
            actor: Some("u1".into()),
            ..AffectedIds::default()
        };
        let tags = Mutation::ProgressRecorded.tags(&ids, &ChangedFields::default());
        assert_eq!(names(&tags), vec!["u1:Library", "u1:Progress", "u1:Progress:c1"]);
        assert!(tags.iter().all(|tag| !tag.as_str().starts_with("u2:")));
    }

    #[test]
    fn membership_targets_the_member_not_the_actor() {
        let ids = AffectedIds::from_params([("id", "c1"), ("user_id", "u2")], Some("owner"));
        let tags = Mutation::MembershipRevoked.tags(&ids, &ChangedFields::default());
        assert_eq!(names(&tags), vec!["Members:c1", "u2:Library", "u2:Progress:c1"]);
    }

    #[test]
    fn item_reorder_keeps_region_narrowing() {
        let ids = AffectedIds::from_params([("card_id", "c1"), ("item_id", "i9")], None);
        let quiz = Mutation::ItemsReordered.tags(&ids, &ChangedFields::new(["quizzes"]));
        assert_eq!(names(&quiz), vec!["Overview:c1", "Quiz:c1", "ReviewQueue:c1"]);

        let deleted = Mutation::ItemDeleted.tags(&ids, &ChangedFields::default());
        assert_eq!(
            names(&deleted),
            vec!["Flashcards:c1", "Item:i9", "Overview:c1", "Quiz:c1", "ReviewQueue:c1"]
        );
    }

    #[test]
    fn card_creation_uses_payload_category() {
        let ids = AffectedIds {
            actor: Some("u1".into()),
            ..AffectedIds::default()
        };
        let fields = ChangedFields::from_json(&json!({ "title": "T", "category": "Math" }));
        let tags = Mutation::CardCreated.tags(&ids, &fields);
        assert_eq!(names(&tags), vec!["Card", "Category:Math", "u1:Library"]);
    }

    #[test]
    fn every_mutation_yields_tags() {
        for mutation in Mutation::ALL {
            assert!(
                !mutation
                    .tags(&AffectedIds::default(), &ChangedFields::default())
                    .is_empty(),
                "{mutation} produced no tags"
            );
        }
    }

    #[test]
    fn non_object_payload_has_no_fields() {
        assert_eq!(ChangedFields::from_json(&json!([1, 2])), ChangedFields::default());
        assert_eq!(ChangedFields::from_json(&json!({ "category": 7 })).category(), Some("7"));
    }
}
