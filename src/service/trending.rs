//! Trending topics
//!
//! Reads trends from the public appview. Responses are cached unfiltered;
//! the viewer's muted words are applied on every read.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::moderation::{ModerationPrefs, has_muted_word};
use crate::api::xrpc::fetch_json;
use crate::api::{
    GetPreferencesOutput, GetTrendsOutput, MutedWord, TrendingTopic, TrendingTopicsOutput,
    aggregate_user_interests, create_topics_header,
};
use crate::config::AppConfig;
use crate::data::{QueryCache, QueryKey};
use crate::error::{AppError, Result};

pub const TRENDS_NAMESPACE: &str = "trends";
pub const TRENDING_TOPICS_NAMESPACE: &str = "trending-topics";

/// Trends requested per call
pub const TRENDS_LIMIT: u32 = 5;
/// Trending topics requested per call
pub const TRENDING_TOPICS_LIMIT: u32 = 14;

/// Trends and trending topics, cached per process
#[derive(Clone)]
pub struct TrendingService {
    http: Arc<reqwest::Client>,
    public_api: String,
    debug_topics: Option<String>,
    content_languages: String,
    stale_time: Duration,
    trends: QueryCache<GetTrendsOutput>,
    topics: QueryCache<TrendingTopicsOutput>,
}

impl TrendingService {
    pub fn new(http: Arc<reqwest::Client>, config: &AppConfig) -> Self {
        Self {
            http,
            public_api: config.service.public_api.trim_end_matches('/').to_string(),
            debug_topics: config.service.debug_topics.clone(),
            content_languages: config.service.content_languages.clone(),
            stale_time: Duration::from_secs(config.cache.trending_stale_seconds),
            trends: QueryCache::new(),
            topics: QueryCache::new(),
        }
    }

    /// Current trends with muted topics removed
    ///
    /// # Errors
    /// Returns `AppError::Validation` until preferences are loaded, or the
    /// remote error
    pub async fn get_trends(&self, preferences: Option<&GetPreferencesOutput>) -> Result<GetTrendsOutput> {
        let preferences = preferences
            .ok_or_else(|| AppError::Validation("preferences are not loaded".to_string()))?;

        let interests = aggregate_user_interests(Some(preferences));
        let (topics_header, topics) =
            create_topics_header(self.debug_topics.as_deref(), Some(&interests));
        let request = self
            .http
            .get(format!("{}/xrpc/app.bsky.unspecced.getTrends", self.public_api))
            .query(&[("limit", TRENDS_LIMIT)])
            .header(topics_header, topics)
            .header(reqwest::header::ACCEPT_LANGUAGE, self.content_languages.clone());

        let data = self
            .trends
            .get_or_fetch(&QueryKey::root(TRENDS_NAMESPACE), self.stale_time, move |_| {
                fetch_json::<GetTrendsOutput>("getTrends", request)
            })
            .await
            .map_err(|err| AppError::from(err).record())?;

        let muted_words = muted_words(Some(preferences));
        Ok(GetTrendsOutput {
            trends: data
                .trends
                .iter()
                .filter(|trend| {
                    let text = format!(
                        "{} {} {}",
                        trend.topic,
                        trend.display_name,
                        trend.category.as_deref().unwrap_or_default()
                    );
                    !is_muted(&muted_words, &text)
                })
                .cloned()
                .collect(),
        })
    }

    /// Trending and suggested topics with muted topics removed
    pub async fn get_trending_topics(
        &self,
        preferences: Option<&GetPreferencesOutput>,
    ) -> Result<TrendingTopicsOutput> {
        let request = self
            .http
            .get(format!(
                "{}/xrpc/app.bsky.unspecced.getTrendingTopics",
                self.public_api
            ))
            .query(&[("limit", TRENDING_TOPICS_LIMIT)]);

        let data = self
            .topics
            .get_or_fetch(
                &QueryKey::root(TRENDING_TOPICS_NAMESPACE),
                self.stale_time,
                move |_| fetch_json::<TrendingTopicsOutput>("getTrendingTopics", request),
            )
            .await
            .map_err(|err| AppError::from(err).record())?;

        let muted_words = muted_words(preferences);
        let keep = |topic: &&TrendingTopic| {
            let text = format!(
                "{} {} {}",
                topic.topic,
                topic.display_name.as_deref().unwrap_or_default(),
                topic.description.as_deref().unwrap_or_default()
            );
            !is_muted(&muted_words, &text)
        };
        Ok(TrendingTopicsOutput {
            topics: data.topics.iter().filter(keep).cloned().collect(),
            suggested: data.suggested.iter().filter(keep).cloned().collect(),
        })
    }

    /// Force the next reads to refetch
    pub async fn invalidate(&self) {
        self.trends.invalidate_namespace(TRENDS_NAMESPACE).await;
        self.topics.invalidate_namespace(TRENDING_TOPICS_NAMESPACE).await;
    }
}

fn muted_words(preferences: Option<&GetPreferencesOutput>) -> Vec<MutedWord> {
    preferences
        .map(|prefs| ModerationPrefs::from_preferences(prefs).muted_words)
        .unwrap_or_default()
}

fn is_muted(muted_words: &[MutedWord], text: &str) -> bool {
    !muted_words.is_empty() && has_muted_word(muted_words, text, &[], Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use axum::{Json, Router, extract::Query, http::HeaderMap, routing::get};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn service(base: String) -> TrendingService {
        let mut config = test_config();
        config.service.public_api = base;
        TrendingService::new(Arc::new(reqwest::Client::new()), &config)
    }

    fn prefs(muted: &[&str]) -> GetPreferencesOutput {
        serde_json::from_value(json!({
            "preferences": [
                {"$type": "app.bsky.actor.defs#interestsPref", "tags": ["art", "music"]},
                {"$type": "app.bsky.actor.defs#mutedWordsPref", "items": muted
                    .iter()
                    .map(|w| json!({"value": w, "targets": ["content", "tag"]}))
                    .collect::<Vec<_>>()}
            ]
        }))
        .unwrap()
    }

    fn trend(topic: &str) -> serde_json::Value {
        json!({
            "topic": topic,
            "displayName": topic,
            "link": format!("/search?q={topic}"),
            "startedAt": "2024-01-01T00:00:00Z",
            "postCount": 10
        })
    }

    #[tokio::test]
    async fn trends_are_filtered_cached_and_carry_headers() {
        let seen = Arc::new(Mutex::new(Vec::<(String, String, String)>::new()));
        let recorder = Arc::clone(&seen);
        let app = Router::new().route(
            "/xrpc/app.bsky.unspecced.getTrends",
            get(
                move |Query(params): Query<HashMap<String, String>>, headers: HeaderMap| {
                    let recorder = Arc::clone(&recorder);
                    async move {
                        let header = |name: &str| {
                            headers
                                .get(name)
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or_default()
                                .to_string()
                        };
                        recorder.lock().unwrap().push((
                            params.get("limit").cloned().unwrap_or_default(),
                            header("x-bsky-topics"),
                            header("accept-language"),
                        ));
                        Json(json!({
                            "trends": [trend("cats"), trend("elections"), trend("rust")]
                        }))
                    }
                },
            ),
        );
        let service = service(serve(app).await);
        let preferences = prefs(&["elections"]);

        let trends = service.get_trends(Some(&preferences)).await.unwrap();
        let topics: Vec<&str> = trends.trends.iter().map(|t| t.topic.as_str()).collect();
        assert_eq!(topics, vec!["cats", "rust"]);
        assert_eq!(
            seen.lock().unwrap().clone(),
            vec![("5".to_string(), "art,music".to_string(), "en".to_string())]
        );

        // cached for the stale time
        service.get_trends(Some(&preferences)).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);

        // muting applies on read, without a refetch
        let trends = service.get_trends(Some(&prefs(&["cats"]))).await.unwrap();
        assert_eq!(trends.trends.len(), 2);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn trends_wait_for_preferences() {
        let service = service("http://127.0.0.1:9".to_string());
        assert!(matches!(
            service.get_trends(None).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn trending_topics_default_missing_arrays() {
        let app = Router::new().route(
            "/xrpc/app.bsky.unspecced.getTrendingTopics",
            get(|| async {
                Json(json!({
                    "topics": [
                        {"topic": "art", "link": "/a"},
                        {"topic": "spoilers", "description": "big spoilers", "link": "/s"}
                    ]
                }))
            }),
        );
        let service = service(serve(app).await);

        let output = service
            .get_trending_topics(Some(&prefs(&["spoilers"])))
            .await
            .unwrap();
        assert_eq!(output.topics.len(), 1);
        assert_eq!(output.topics[0].topic, "art");
        assert!(output.suggested.is_empty());

        let unfiltered = service.get_trending_topics(None).await.unwrap();
        assert_eq!(unfiltered.topics.len(), 2);
    }
}
