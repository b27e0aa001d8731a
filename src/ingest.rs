use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

use crate::db::{Database, StoreError};
use crate::fetcher::{FetchError, Fetcher};

#[derive(Debug, Error)]
pub enum IngestError {
    /// The store has no feeds at all; nothing to do this cycle.
    #[error("no feeds to fetch")]
    NoFeeds,
    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What one ingestion cycle saw, for operator logging.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub feed_name: String,
    pub items_seen: usize,
    pub new_posts: usize,
}

/// Run one fetch-and-store cycle against the least-recently-fetched feed.
///
/// The feed is marked as fetched *before* its content is requested, so a
/// slow or failing fetch cannot cause the same feed to be selected again on
/// the next tick. Duplicate post URLs are expected (feeds keep old entries
/// in the document) and skipped silently; any other insertion failure skips
/// that single item and the cycle continues.
pub async fn ingest_next(db: &Database, fetcher: &Fetcher) -> Result<IngestOutcome, IngestError> {
    let feed = db
        .get_next_feed_to_fetch()
        .await?
        .ok_or(IngestError::NoFeeds)?;

    db.mark_feed_fetched(&feed.id, Utc::now()).await?;

    let parsed = fetcher
        .fetch(&feed.url)
        .await
        .map_err(|source| IngestError::Fetch {
            url: feed.url.clone(),
            source,
        })?;

    let mut new_posts = 0;
    for item in &parsed.items {
        let published_at = item.pub_date.as_deref().and_then(parse_pub_date);
        match db
            .create_post(
                &item.title,
                &item.link,
                item.description.as_deref(),
                published_at,
                &feed.id,
            )
            .await
        {
            Ok(_) => new_posts += 1,
            Err(StoreError::Duplicate(_)) => {}
            Err(err) => {
                warn!(url = %item.link, error = %err, "couldn't store post");
            }
        }
    }

    Ok(IngestOutcome {
        feed_name: feed.name,
        items_seen: parsed.items.len(),
        new_posts,
    })
}

/// Parse an RSS `pubDate` (RFC 1123 with a numeric zone, e.g.
/// `"Mon, 02 Jan 2006 15:04:05 -0700"`). Anything unparseable is treated as
/// an absent date, never an error.
pub fn parse_pub_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::db::User;

    async fn test_db() -> Database {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.initialize().await.unwrap();
        db
    }

    async fn serve_feed(server: &MockServer, route: &str, body: &str) {
        Mock::given(method("GET"))
            .and(path(route.to_string()))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/rss+xml")
                    .set_body_string(body.to_string()),
            )
            .mount(server)
            .await;
    }

    async fn seed_followed_feed(db: &Database, url: &str) -> (User, String) {
        let user = db.create_user("alice").await.unwrap();
        let feed = db.create_feed("Blog", url, &user.id).await.unwrap();
        db.create_feed_follow(&user.id, &feed.id).await.unwrap();
        (user, feed.id)
    }

    fn three_item_feed() -> String {
        r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Blog</title>
    <link>https://example.com/</link>
    <description>Posts</description>
    <item>
      <title>A</title>
      <link>https://example.com/a</link>
      <description>First</description>
      <pubDate>Mon, 02 Jan 2006 15:04:05 -0700</pubDate>
    </item>
    <item>
      <title>B</title>
      <link>https://example.com/b</link>
      <description>Second</description>
      <pubDate>Tue, 03 Jan 2006 15:04:05 -0700</pubDate>
    </item>
    <item>
      <title>C</title>
      <link>https://example.com/c</link>
      <description>Third</description>
      <pubDate>not a date</pubDate>
    </item>
  </channel>
</rss>"#
            .to_string()
    }

    mod parse_pub_date_tests {
        use super::*;

        #[test]
        fn test_numeric_zone_round_trips() {
            let parsed = parse_pub_date("Mon, 02 Jan 2006 15:04:05 -0700").unwrap();
            let expected = Utc.with_ymd_and_hms(2006, 1, 2, 22, 4, 5).unwrap();
            assert_eq!(parsed, expected);
        }

        #[test]
        fn test_gmt_zone_is_accepted() {
            let parsed = parse_pub_date("Mon, 21 Oct 2024 07:28:00 GMT").unwrap();
            let expected = Utc.with_ymd_and_hms(2024, 10, 21, 7, 28, 0).unwrap();
            assert_eq!(parsed, expected);
        }

        #[test]
        fn test_unparseable_date_is_none() {
            assert!(parse_pub_date("yesterday-ish").is_none());
            assert!(parse_pub_date("").is_none());
            assert!(parse_pub_date("2006-01-02T15:04:05Z").is_none());
        }
    }

    mod ingest_tests {
        use super::*;

        #[tokio::test]
        async fn test_ingest_stores_all_items() {
            let server = MockServer::start().await;
            serve_feed(&server, "/feed", &three_item_feed()).await;

            let db = test_db().await;
            let (user, _) = seed_followed_feed(&db, &format!("{}/feed", server.uri())).await;

            let outcome = ingest_next(&db, &Fetcher::new()).await.unwrap();

            assert_eq!(outcome.feed_name, "Blog");
            assert_eq!(outcome.items_seen, 3);
            assert_eq!(outcome.new_posts, 3);
            assert_eq!(db.get_posts_for_user(&user.id, 10).await.unwrap().len(), 3);
        }

        #[tokio::test]
        async fn test_second_ingest_is_idempotent() {
            let server = MockServer::start().await;
            serve_feed(&server, "/feed", &three_item_feed()).await;

            let db = test_db().await;
            let (user, _) = seed_followed_feed(&db, &format!("{}/feed", server.uri())).await;

            let first = ingest_next(&db, &Fetcher::new()).await.unwrap();
            let second = ingest_next(&db, &Fetcher::new()).await.unwrap();

            assert_eq!(first.new_posts, 3);
            assert_eq!(second.items_seen, 3);
            assert_eq!(second.new_posts, 0);
            assert_eq!(db.get_posts_for_user(&user.id, 10).await.unwrap().len(), 3);
        }

        #[tokio::test]
        async fn test_self_duplicate_in_document_stored_once() {
            let body = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Blog</title>
    <link>http://example.com/</link>
    <description>Posts</description>
    <item>
      <title>A</title>
      <link>http://example.com/a</link>
    </item>
    <item>
      <title>A</title>
      <link>http://example.com/a</link>
    </item>
  </channel>
</rss>"#;
            let server = MockServer::start().await;
            serve_feed(&server, "/feed", body).await;

            let db = test_db().await;
            let (user, _) = seed_followed_feed(&db, &format!("{}/feed", server.uri())).await;

            let outcome = ingest_next(&db, &Fetcher::new()).await.unwrap();

            assert_eq!(outcome.items_seen, 2);
            assert_eq!(outcome.new_posts, 1);
            assert_eq!(db.get_posts_for_user(&user.id, 10).await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn test_unparseable_pub_date_stores_undated_post() {
            let server = MockServer::start().await;
            serve_feed(&server, "/feed", &three_item_feed()).await;

            let db = test_db().await;
            let (user, _) = seed_followed_feed(&db, &format!("{}/feed", server.uri())).await;

            ingest_next(&db, &Fetcher::new()).await.unwrap();

            let posts = db.get_posts_for_user(&user.id, 10).await.unwrap();
            let undated = posts.iter().find(|p| p.title == "C").unwrap();
            assert!(undated.published_at.is_none());
        }

        #[tokio::test]
        async fn test_stored_publish_date_round_trips() {
            let server = MockServer::start().await;
            serve_feed(&server, "/feed", &three_item_feed()).await;

            let db = test_db().await;
            let (user, _) = seed_followed_feed(&db, &format!("{}/feed", server.uri())).await;

            ingest_next(&db, &Fetcher::new()).await.unwrap();

            let posts = db.get_posts_for_user(&user.id, 10).await.unwrap();
            let dated = posts.iter().find(|p| p.title == "A").unwrap();
            let expected = Utc.with_ymd_and_hms(2006, 1, 2, 22, 4, 5).unwrap();
            assert_eq!(dated.published_at, Some(expected));
        }

        #[tokio::test]
        async fn test_empty_store_is_no_feeds() {
            let db = test_db().await;
            let result = ingest_next(&db, &Fetcher::new()).await;
            assert!(matches!(result, Err(IngestError::NoFeeds)));
        }

        #[tokio::test]
        async fn test_failed_fetch_still_marks_feed_fetched() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/feed"))
                .respond_with(ResponseTemplate::new(500))
                .mount(&server)
                .await;

            let db = test_db().await;
            let url = format!("{}/feed", server.uri());
            seed_followed_feed(&db, &url).await;

            let result = ingest_next(&db, &Fetcher::new()).await;

            assert!(matches!(result, Err(IngestError::Fetch { .. })));
            let feed = db.get_feed_by_url(&url).await.unwrap().unwrap();
            assert!(feed.last_fetched_at.is_some());
        }

        #[tokio::test]
        async fn test_ingest_advances_last_fetched() {
            let server = MockServer::start().await;
            serve_feed(&server, "/feed", &three_item_feed()).await;

            let db = test_db().await;
            let url = format!("{}/feed", server.uri());
            seed_followed_feed(&db, &url).await;

            ingest_next(&db, &Fetcher::new()).await.unwrap();
            let first = db
                .get_feed_by_url(&url)
                .await
                .unwrap()
                .unwrap()
                .last_fetched_at
                .unwrap();

            ingest_next(&db, &Fetcher::new()).await.unwrap();
            let second = db
                .get_feed_by_url(&url)
                .await
                .unwrap()
                .unwrap()
                .last_fetched_at
                .unwrap();

            assert!(second > first);
        }

        #[tokio::test]
        async fn test_feeds_rotate_by_staleness() {
            let server = MockServer::start().await;
            serve_feed(&server, "/one", &three_item_feed()).await;
            serve_feed(&server, "/two", &three_item_feed()).await;

            let db = test_db().await;
            let user = db.create_user("alice").await.unwrap();
            db.create_feed("One", &format!("{}/one", server.uri()), &user.id)
                .await
                .unwrap();
            db.create_feed("Two", &format!("{}/two", server.uri()), &user.id)
                .await
                .unwrap();

            let first = ingest_next(&db, &Fetcher::new()).await.unwrap();
            let second = ingest_next(&db, &Fetcher::new()).await.unwrap();

            // Both feeds polled once before either is revisited.
            let mut names = vec![first.feed_name, second.feed_name];
            names.sort();
            assert_eq!(names, vec!["One", "Two"]);
        }
    }
}
