use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, FromRow, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} already exists")]
    Duplicate(&'static str),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl StoreError {
    /// Map a unique-constraint violation on INSERT to `Duplicate`.
    fn on_insert(entity: &'static str, err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if matches!(db_err.kind(), sqlx::error::ErrorKind::UniqueViolation) {
                return StoreError::Duplicate(entity);
            }
        }
        StoreError::Db(err)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct Feed {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub url: String,
    pub user_id: String,
    pub last_fetched_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct FeedFollow {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub user_id: String,
    pub feed_id: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct Post {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub title: String,
    pub url: String,
    pub description: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub feed_id: String,
}

/// A post joined with the name of the feed it came from, for display.
#[derive(Debug, Clone, FromRow)]
pub struct UserPost {
    pub title: String,
    pub url: String,
    pub description: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub feed_name: String,
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn initialize(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                name TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                name TEXT NOT NULL,
                url TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL REFERENCES users(id),
                last_fetched_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_follows (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                user_id TEXT NOT NULL REFERENCES users(id),
                feed_id TEXT NOT NULL REFERENCES feeds(id),
                UNIQUE(user_id, feed_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                title TEXT NOT NULL,
                url TEXT NOT NULL UNIQUE,
                description TEXT,
                published_at TEXT,
                feed_id TEXT NOT NULL REFERENCES feeds(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_posts_published
            ON posts(published_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ===== Users =====

    pub async fn create_user(&self, name: &str) -> Result<User, StoreError> {
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            name: name.to_string(),
        };

        sqlx::query("INSERT INTO users (id, created_at, updated_at, name) VALUES (?, ?, ?, ?)")
            .bind(&user.id)
            .bind(user.created_at)
            .bind(user.updated_at)
            .bind(&user.name)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::on_insert("user", e))?;

        Ok(user)
    }

    pub async fn get_user(&self, name: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn get_user_by_id(&self, id: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn get_users(&self) -> Result<Vec<User>, StoreError> {
        let users = sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(users)
    }

    /// Wipe all stored entities. Children first, so foreign keys hold
    /// throughout.
    pub async fn reset_all(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM posts").execute(&self.pool).await?;
        sqlx::query("DELETE FROM feed_follows")
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM feeds").execute(&self.pool).await?;
        sqlx::query("DELETE FROM users").execute(&self.pool).await?;
        Ok(())
    }

    // ===== Feeds =====

    pub async fn create_feed(
        &self,
        name: &str,
        url: &str,
        user_id: &str,
    ) -> Result<Feed, StoreError> {
        let now = Utc::now();
        let feed = Feed {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            name: name.to_string(),
            url: url.to_string(),
            user_id: user_id.to_string(),
            last_fetched_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO feeds (id, created_at, updated_at, name, url, user_id, last_fetched_at)
            VALUES (?, ?, ?, ?, ?, ?, NULL)
            "#,
        )
        .bind(&feed.id)
        .bind(feed.created_at)
        .bind(feed.updated_at)
        .bind(&feed.name)
        .bind(&feed.url)
        .bind(&feed.user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::on_insert("feed", e))?;

        Ok(feed)
    }

    pub async fn get_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        let feeds = sqlx::query_as::<_, Feed>("SELECT * FROM feeds ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(feeds)
    }

    pub async fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>, StoreError> {
        let feed = sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    /// The feed whose last fetch is the furthest in the past. Feeds that have
    /// never been fetched sort before all others.
    pub async fn get_next_feed_to_fetch(&self) -> Result<Option<Feed>, StoreError> {
        let feed = sqlx::query_as::<_, Feed>(
            r#"
            SELECT * FROM feeds
            ORDER BY last_fetched_at ASC NULLS FIRST
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(feed)
    }

    pub async fn mark_feed_fetched(
        &self,
        feed_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE feeds SET last_fetched_at = ?, updated_at = ? WHERE id = ?")
            .bind(at)
            .bind(at)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ===== Feed follows =====

    pub async fn create_feed_follow(
        &self,
        user_id: &str,
        feed_id: &str,
    ) -> Result<FeedFollow, StoreError> {
        let now = Utc::now();
        let follow = FeedFollow {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            user_id: user_id.to_string(),
            feed_id: feed_id.to_string(),
        };

        sqlx::query(
            r#"
            INSERT INTO feed_follows (id, created_at, updated_at, user_id, feed_id)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&follow.id)
        .bind(follow.created_at)
        .bind(follow.updated_at)
        .bind(&follow.user_id)
        .bind(&follow.feed_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::on_insert("follow", e))?;

        Ok(follow)
    }

    pub async fn get_feed_follows_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        let names = sqlx::query_scalar::<_, String>(
            r#"
            SELECT feeds.name FROM feed_follows
            JOIN feeds ON feeds.id = feed_follows.feed_id
            WHERE feed_follows.user_id = ?
            ORDER BY feeds.name
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    pub async fn unfollow_feed(&self, user_id: &str, feed_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM feed_follows WHERE user_id = ? AND feed_id = ?")
            .bind(user_id)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ===== Posts =====

    pub async fn create_post(
        &self,
        title: &str,
        url: &str,
        description: Option<&str>,
        published_at: Option<DateTime<Utc>>,
        feed_id: &str,
    ) -> Result<Post, StoreError> {
        let now = Utc::now();
        let post = Post {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            title: title.to_string(),
            url: url.to_string(),
            description: description.map(str::to_string),
            published_at,
            feed_id: feed_id.to_string(),
        };

        sqlx::query(
            r#"
            INSERT INTO posts (id, created_at, updated_at, title, url, description, published_at, feed_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(post.created_at)
        .bind(post.updated_at)
        .bind(&post.title)
        .bind(&post.url)
        .bind(post.description.as_deref())
        .bind(post.published_at)
        .bind(&post.feed_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::on_insert("post", e))?;

        Ok(post)
    }

    /// Posts from the feeds `user_id` follows, newest publish date first,
    /// undated posts last.
    pub async fn get_posts_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<UserPost>, StoreError> {
        let posts = sqlx::query_as::<_, UserPost>(
            r#"
            SELECT posts.title, posts.url, posts.description, posts.published_at,
                   feeds.name AS feed_name
            FROM posts
            JOIN feed_follows ON feed_follows.feed_id = posts.feed_id
            JOIN feeds ON feeds.id = posts.feed_id
            WHERE feed_follows.user_id = ?
            ORDER BY posts.published_at DESC NULLS LAST
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(posts)
    }
}
