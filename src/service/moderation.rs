//! Moderation decisions
//!
//! Computes the decision attached to each hydrated post from one snapshot of
//! the viewer's moderation preferences.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::api::{GetPreferencesOutput, Label, MutedWord, PostRecord, PostView, PreferenceItem};

/// Labels hidden unless the viewer enabled adult content
const ADULT_LABELS: &[&str] = &["porn", "sexual", "nudity", "graphic-media"];

/// System label that always hides content
const LABEL_HIDE: &str = "!hide";
/// System label that always warns
const LABEL_WARN: &str = "!warn";

/// What the viewer wants done with a labeled post
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LabelVisibility {
    Ignore,
    #[default]
    Warn,
    Hide,
}

impl LabelVisibility {
    /// Parse a `contentLabelPref.visibility` value
    pub fn parse(value: &str) -> Self {
        match value {
            "hide" => LabelVisibility::Hide,
            "ignore" | "show" => LabelVisibility::Ignore,
            _ => LabelVisibility::Warn,
        }
    }
}

/// Viewer moderation preferences
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModerationPrefs {
    pub adult_content_enabled: bool,
    /// Label value to visibility
    pub labels: BTreeMap<String, LabelVisibility>,
    pub muted_words: Vec<MutedWord>,
    /// URIs of posts the viewer hid
    pub hidden_posts: Vec<String>,
    /// Labelers the viewer subscribed to
    pub labelers: Vec<String>,
}

impl ModerationPrefs {
    /// Collect moderation preferences from `app.bsky.actor.getPreferences`
    pub fn from_preferences(output: &GetPreferencesOutput) -> Self {
        let mut prefs = Self::default();
        for item in &output.preferences {
            match item {
                PreferenceItem::AdultContent { enabled } => prefs.adult_content_enabled = *enabled,
                PreferenceItem::ContentLabel {
                    label, visibility, ..
                } => {
                    prefs
                        .labels
                        .insert(label.clone(), LabelVisibility::parse(visibility));
                }
                PreferenceItem::MutedWords { items } => prefs.muted_words.extend(items.iter().cloned()),
                PreferenceItem::HiddenPosts { items } => prefs.hidden_posts.extend(items.iter().cloned()),
                PreferenceItem::Labelers { labelers } => {
                    prefs.labelers.extend(labelers.iter().map(|l| l.did.clone()))
                }
                PreferenceItem::Interests { .. } | PreferenceItem::Other => {}
            }
        }
        prefs
    }
}

/// Inputs to every moderation decision of a batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModerationOpts {
    /// Signed-in viewer
    pub user_did: Option<String>,
    pub prefs: ModerationPrefs,
}

/// Why a post was moderated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModerationCause {
    Blocking,
    BlockedBy,
    MutedAuthor,
    HiddenPost,
    Label { val: String, src: String },
    MutedWord,
}

/// Moderation outcome for one post
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModerationDecision {
    pub causes: Vec<ModerationCause>,
    /// Drop from feeds
    pub filter: bool,
    /// Cover behind an interstitial
    pub blur: bool,
    /// Show a warning badge
    pub alert: bool,
}

impl ModerationDecision {
    fn add(&mut self, cause: ModerationCause, filter: bool, blur: bool, alert: bool) {
        self.causes.push(cause);
        self.filter |= filter;
        self.blur |= blur;
        self.alert |= alert;
    }
}

/// Moderation decision for a post
pub fn moderate_post(post: &PostView, opts: &ModerationOpts) -> ModerationDecision {
    let mut decision = ModerationDecision::default();
    let is_own = opts.user_did.as_deref() == Some(post.author.did.as_str());

    if let Some(viewer) = &post.author.viewer {
        if viewer.blocking.is_some() {
            decision.add(ModerationCause::Blocking, true, true, false);
        }
        if viewer.blocked_by {
            decision.add(ModerationCause::BlockedBy, true, true, false);
        }
        if viewer.muted {
            decision.add(ModerationCause::MutedAuthor, true, true, false);
        }
    }

    if opts.prefs.hidden_posts.iter().any(|uri| uri == &post.uri) {
        decision.add(ModerationCause::HiddenPost, true, true, false);
    }

    for label in post.labels.iter().chain(post.author.labels.iter()) {
        moderate_label(label, &opts.prefs, &mut decision);
    }

    if !is_own {
        let record = PostRecord::from_value(&post.record);
        let following = post
            .author
            .viewer
            .as_ref()
            .is_some_and(|viewer| viewer.following.is_some());
        let mutes: Vec<MutedWord> = opts
            .prefs
            .muted_words
            .iter()
            .filter(|mute| !(following && mute.actor_target.as_deref() == Some("exclude-following")))
            .cloned()
            .collect();
        if has_muted_word(&mutes, &record.text, &record.all_tags(), Utc::now()) {
            decision.add(ModerationCause::MutedWord, true, true, false);
        }
    }

    decision
}

fn moderate_label(label: &Label, prefs: &ModerationPrefs, decision: &mut ModerationDecision) {
    if label.neg {
        return;
    }
    let cause = || ModerationCause::Label {
        val: label.val.clone(),
        src: label.src.clone(),
    };

    match label.val.as_str() {
        LABEL_HIDE => decision.add(cause(), true, true, false),
        LABEL_WARN => decision.add(cause(), false, true, true),
        val if ADULT_LABELS.contains(&val) && !prefs.adult_content_enabled => {
            decision.add(cause(), true, true, false)
        }
        val => match prefs.labels.get(val) {
            Some(LabelVisibility::Hide) => decision.add(cause(), true, true, false),
            Some(LabelVisibility::Warn) => decision.add(cause(), false, true, true),
            Some(LabelVisibility::Ignore) | None => {}
        },
    }
}

/// Whether any unexpired muted word matches the text or tags
///
/// Phrases, single characters and words containing punctuation (`c++`,
/// `e.g.`) match as case-insensitive substrings. Other words match whole
/// tokens after trimming punctuation. Tag targets match tags with or
/// without a leading `#`.
pub fn has_muted_word(
    muted_words: &[MutedWord],
    text: &str,
    tags: &[String],
    now: DateTime<Utc>,
) -> bool {
    let text = text.to_lowercase();
    let tags: Vec<String> = tags
        .iter()
        .map(|tag| tag.trim_start_matches('#').to_lowercase())
        .collect();

    muted_words.iter().any(|mute| {
        if mute.expires_at.is_some_and(|expires_at| expires_at <= now) {
            return false;
        }
        let value = mute.value.trim().to_lowercase();
        let bare = value.trim_start_matches('#');
        if bare.is_empty() {
            return false;
        }

        let targets_tags = mute.targets.is_empty() || mute.targets.iter().any(|t| t == "tag");
        let targets_content =
            mute.targets.is_empty() || mute.targets.iter().any(|t| t == "content");

        if targets_tags && tags.iter().any(|tag| tag == bare) {
            return true;
        }
        if !targets_content {
            return false;
        }

        if bare.chars().count() == 1 || bare.chars().any(|c| !c.is_alphanumeric()) {
            return text.contains(bare);
        }
        text.split_whitespace()
            .map(|token| token.trim_matches(|c: char| !c.is_alphanumeric()))
            .any(|token| token == bare)
    })
}
