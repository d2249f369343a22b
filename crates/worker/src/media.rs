//! Image lookup and alt-text persistence for the worker.

use async_trait::async_trait;
use chrono::Utc;
use optti_core::{EntityId, sanitize_key};
use serde_json::{Value, json};
use sqlx::SqlitePool;
use tracing::instrument;

/// Where images come from and where generated text goes.
#[async_trait]
pub trait MediaLibrary: Send + Sync {
    /// Payload for the generation request, or `None` when the image is gone.
    async fn image_payload(&self, entity_id: EntityId) -> anyhow::Result<Option<Value>>;

    async fn save_alt_text(&self, entity_id: EntityId, alt_text: &str) -> anyhow::Result<()>;
}

/// Media records kept in `optti_alt_text_<slug>`.
///
/// A row must exist for an entity to count as an image. Rows without an
/// explicit URL get one from the URL template.
#[derive(Debug, Clone)]
pub struct SqliteMediaLibrary {
    pool: SqlitePool,
    table: String,
    url_template: String,
    site_url: String,
}

impl SqliteMediaLibrary {
    pub fn new(
        pool: SqlitePool,
        plugin_slug: &str,
        url_template: impl Into<String>,
        site_url: impl Into<String>,
    ) -> Self {
        let slug = sanitize_key(plugin_slug).replace('-', "_");
        let slug = if slug.is_empty() { "optti".to_string() } else { slug };
        Self {
            pool,
            table: format!("optti_alt_text_{slug}"),
            url_template: url_template.into(),
            site_url: site_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    pub async fn create_table(&self) -> Result<(), sqlx::Error> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                entity_id   INTEGER PRIMARY KEY,
                image_url   TEXT NULL,
                alt_text    TEXT NULL,
                updated_at  INTEGER NULL
            )
            "#,
            self.table
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Make an entity known as an image, optionally with its own URL.
    pub async fn register_image(
        &self,
        entity_id: EntityId,
        image_url: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(&format!(
            "INSERT INTO {} (entity_id, image_url) VALUES (?1, ?2) \
             ON CONFLICT(entity_id) DO UPDATE SET image_url = excluded.image_url",
            self.table
        ))
        .bind(entity_id.get())
        .bind(image_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn alt_text(&self, entity_id: EntityId) -> Result<Option<String>, sqlx::Error> {
        let sql = format!("SELECT alt_text FROM {} WHERE entity_id = ?1", self.table);
        let row: Option<(Option<String>,)> = sqlx::query_as(&sql)
            .bind(entity_id.get())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|(text,)| text))
    }

    fn template_url(&self, entity_id: EntityId) -> String {
        self.url_template
            .replace("{site_url}", &self.site_url)
            .replace("{id}", &entity_id.to_string())
    }
}

#[async_trait]
impl MediaLibrary for SqliteMediaLibrary {
    async fn image_payload(&self, entity_id: EntityId) -> anyhow::Result<Option<Value>> {
        let sql = format!("SELECT image_url FROM {} WHERE entity_id = ?1", self.table);
        let row: Option<(Option<String>,)> = sqlx::query_as(&sql)
            .bind(entity_id.get())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(url,)| {
            let url = url
                .filter(|u| !u.trim().is_empty())
                .unwrap_or_else(|| self.template_url(entity_id));
            json!({ "image_source": "url", "image_url": url })
        }))
    }

    async fn save_alt_text(&self, entity_id: EntityId, alt_text: &str) -> anyhow::Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (entity_id, alt_text, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(entity_id) DO UPDATE SET alt_text = excluded.alt_text, \
             updated_at = excluded.updated_at",
            self.table
        ))
        .bind(entity_id.get())
        .bind(alt_text)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn library() -> SqliteMediaLibrary {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let library = SqliteMediaLibrary::new(
            pool,
            "beepbeep-ai",
            "{site_url}/?attachment_id={id}",
            "https://blog.example/",
        );
        library.create_table().await.unwrap();
        library
    }

    fn entity(id: i64) -> EntityId {
        EntityId::new(id).unwrap()
    }

    #[tokio::test]
    async fn unknown_entity_has_no_payload() {
        let library = library().await;
        assert_eq!(library.table(), "optti_alt_text_beepbeep_ai");
        assert!(library.image_payload(entity(7)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn payload_prefers_registered_url() {
        let library = library().await;
        library.register_image(entity(7), None).await.unwrap();
        library
            .register_image(entity(8), Some("https://cdn.example/8.png"))
            .await
            .unwrap();

        let templated = library.image_payload(entity(7)).await.unwrap().unwrap();
        assert_eq!(templated["image_url"], "https://blog.example/?attachment_id=7");
        assert_eq!(templated["image_source"], "url");

        let explicit = library.image_payload(entity(8)).await.unwrap().unwrap();
        assert_eq!(explicit["image_url"], "https://cdn.example/8.png");
    }

    #[tokio::test]
    async fn saving_alt_text_keeps_the_image() {
        let library = library().await;
        library
            .register_image(entity(3), Some("https://cdn.example/3.png"))
            .await
            .unwrap();
        library.save_alt_text(entity(3), "A harbour").await.unwrap();
        library.save_alt_text(entity(3), "A quiet harbour").await.unwrap();

        let saved = library.alt_text(entity(3)).await.unwrap();
        assert_eq!(saved.as_deref(), Some("A quiet harbour"));
        let payload = library.image_payload(entity(3)).await.unwrap().unwrap();
        assert_eq!(payload["image_url"], "https://cdn.example/3.png");
    }
}
