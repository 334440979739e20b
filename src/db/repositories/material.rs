//! Kodik material repository
//!
//! A material row carries its translation id; genres, seasons and episodes
//! live in side tables. [`MaterialRepository::upsert`] writes all of them in
//! one transaction through [`MaterialTxOps`]. Relations missing from an
//! upstream item leave the stored ones alone.

use crate::db::repositories::user::escape_like;
use crate::db::{DbBackend, DynDatabasePool, MysqlTx, SqliteTx};
use crate::models::{Episode, Genre, Material, MaterialFilter, Season, Translation};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{MySqlConnection, MySqlPool, Row, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait]
pub trait MaterialRepository: Send + Sync {
    /// Insert or overwrite a material and its relations by `kodik_id`;
    /// returns `true` when created
    async fn upsert(&self, material: &Material) -> Result<bool>;

    /// Material with genres, seasons and episodes
    async fn get(&self, kodik_id: &str) -> Result<Option<Material>>;

    /// Filtered page, most recently updated upstream first, with the total
    /// count. Seasons are not loaded.
    async fn list(
        &self,
        filter: &MaterialFilter,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<Material>, i64)>;

    /// Known genres by name, optionally narrowed to one source or a name
    /// fragment
    async fn genres(&self, source: Option<&str>, search: Option<&str>) -> Result<Vec<Genre>>;
}

/// Material writes inside a transaction
#[async_trait]
pub trait MaterialTxOps: Send {
    /// Write the material row; `true` when it did not exist
    async fn material_save(&mut self, material: &Material) -> Result<bool>;

    async fn translation_upsert(&mut self, translation: &Translation) -> Result<()>;

    /// Link exactly these genres, creating the missing ones
    async fn material_genres_replace(&mut self, kodik_id: &str, genres: &[Genre]) -> Result<()>;

    /// Swap the stored seasons and episodes for these
    async fn material_seasons_replace(&mut self, kodik_id: &str, seasons: &[Season]) -> Result<()>;
}

pub struct SqlxMaterialRepository {
    pool: DynDatabasePool,
}

impl SqlxMaterialRepository {
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn MaterialRepository> {
        Arc::new(Self::new(pool))
    }
}

const MATERIAL_SELECT: &str = "SELECT m.kodik_id, m.slug, m.material_type, m.link, m.title, \
     m.title_orig, m.other_title, m.year, m.quality, m.camrip, m.lgbt, m.kinopoisk_id, \
     m.imdb_id, m.mdl_id, m.worldart_link, m.shikimori_id, m.remote_created_at, \
     m.remote_updated_at, m.last_season, m.last_episode, m.episodes_count, m.screenshots, \
     m.poster_url, m.blocked_countries, m.synced_at, m.translation_id, \
     t.title AS translation_title, t.translation_type \
     FROM kodik_materials m LEFT JOIN kodik_translations t ON t.id = m.translation_id";

const INSERT_SQL: &str = r#"
    INSERT INTO kodik_materials (kodik_id, slug, material_type, link, title, title_orig,
        other_title, year, quality, camrip, lgbt, kinopoisk_id, imdb_id, mdl_id, worldart_link,
        shikimori_id, remote_created_at, remote_updated_at, last_season, last_episode,
        episodes_count, screenshots, poster_url, blocked_countries, translation_id, synced_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

const UPDATE_SQL: &str = r#"
    UPDATE kodik_materials
    SET slug = ?, material_type = ?, link = ?, title = ?, title_orig = ?, other_title = ?,
        year = ?, quality = ?, camrip = ?, lgbt = ?, kinopoisk_id = ?, imdb_id = ?, mdl_id = ?,
        worldart_link = ?, shikimori_id = ?, remote_created_at = ?, remote_updated_at = ?,
        last_season = ?, last_episode = ?, episodes_count = ?, screenshots = ?, poster_url = ?,
        blocked_countries = ?, translation_id = ?, synced_at = ?
    WHERE kodik_id = ?
"#;

const GENRE_ID_SQL: &str = "SELECT id FROM kodik_genres WHERE name = ? AND source = ?";

const INSERT_SEASON_SQL: &str =
    "INSERT INTO material_seasons (kodik_id, number, link) VALUES (?, ?, ?)";

const INSERT_EPISODE_SQL: &str = r#"
    INSERT INTO material_episodes (kodik_id, season_number, number, link, title, screenshots)
    VALUES (?, ?, ?, ?, ?, ?)
"#;

const SEASONS_SQL: &str =
    "SELECT number, link FROM material_seasons WHERE kodik_id = ? ORDER BY number";

const EPISODES_SQL: &str = r#"
    SELECT season_number, number, link, title, screenshots FROM material_episodes
    WHERE kodik_id = ? ORDER BY season_number, number
"#;

/// WHERE clause shared by the list and count queries
fn filter_clause(escape: &str) -> String {
    format!(
        "(? IS NULL OR m.material_type = ?) AND (? IS NULL OR m.year = ?) AND \
         (? IS NULL OR m.translation_id = ?) AND \
         (? IS NULL OR EXISTS (SELECT 1 FROM material_genres mg \
            JOIN kodik_genres g ON g.id = mg.genre_id \
            WHERE mg.kodik_id = m.kodik_id AND g.name = ?)) AND \
         (? IS NULL OR m.title LIKE ? ESCAPE '{0}' OR m.title_orig LIKE ? ESCAPE '{0}' \
         OR m.other_title LIKE ? ESCAPE '{0}')",
        escape
    )
}

fn list_sql(escape: &str) -> String {
    format!(
        "{} WHERE {} ORDER BY m.remote_updated_at DESC, m.kodik_id LIMIT ? OFFSET ?",
        MATERIAL_SELECT,
        filter_clause(escape)
    )
}

fn count_sql(escape: &str) -> String {
    format!(
        "SELECT COUNT(*) as count FROM kodik_materials m WHERE {}",
        filter_clause(escape)
    )
}

fn genres_of_sql(count: usize) -> String {
    format!(
        "SELECT mg.kodik_id, g.name, g.source FROM material_genres mg \
         JOIN kodik_genres g ON g.id = mg.genre_id \
         WHERE mg.kodik_id IN ({}) ORDER BY g.id",
        vec!["?"; count].join(", ")
    )
}

fn genres_sql(escape: &str) -> String {
    format!(
        "SELECT name, source FROM kodik_genres \
         WHERE (? IS NULL OR source = ?) AND (? IS NULL OR name LIKE ? ESCAPE '{}') \
         ORDER BY name, source",
        escape
    )
}

/// Bind values for `filter_clause`, in placeholder order
struct FilterBinds {
    material_type: Option<String>,
    year: Option<i64>,
    translation_id: Option<i64>,
    genre: Option<String>,
    pattern: Option<String>,
}

impl FilterBinds {
    fn from_filter(filter: &MaterialFilter) -> Self {
        let trimmed = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        Self {
            material_type: trimmed(&filter.material_type),
            year: filter.year,
            translation_id: filter.translation_id,
            genre: trimmed(&filter.genre),
            pattern: trimmed(&filter.search).map(|s| format!("%{}%", escape_like(&s))),
        }
    }
}

macro_rules! bind_filter {
    ($query:expr, $binds:expr) => {
        $query
            .bind(&$binds.material_type)
            .bind(&$binds.material_type)
            .bind($binds.year)
            .bind($binds.year)
            .bind($binds.translation_id)
            .bind($binds.translation_id)
            .bind(&$binds.genre)
            .bind(&$binds.genre)
            .bind(&$binds.pattern)
            .bind(&$binds.pattern)
            .bind(&$binds.pattern)
            .bind(&$binds.pattern)
    };
}

macro_rules! bind_material {
    ($query:expr, $material:expr, $screenshots:expr, $blocked:expr) => {
        $query
            .bind(&$material.slug)
            .bind(&$material.material_type)
            .bind(&$material.link)
            .bind(&$material.title)
            .bind(&$material.title_orig)
            .bind(Some($material.other_title.as_str()).filter(|t| !t.is_empty()))
            .bind($material.year)
            .bind(&$material.quality)
            .bind($material.camrip)
            .bind($material.lgbt)
            .bind(&$material.kinopoisk_id)
            .bind(&$material.imdb_id)
            .bind(&$material.mdl_id)
            .bind(&$material.worldart_link)
            .bind(&$material.shikimori_id)
            .bind($material.created_at)
            .bind($material.updated_at)
            .bind($material.last_season)
            .bind($material.last_episode)
            .bind($material.episodes_count)
            .bind($screenshots)
            .bind(&$material.poster_url)
            .bind($blocked)
            .bind($material.translation.as_ref().map(|t| t.id))
            .bind($material.synced_at)
    };
}

#[async_trait]
impl MaterialRepository for SqlxMaterialRepository {
    async fn upsert(&self, material: &Material) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        if let Some(translation) = &material.translation {
            tx.translation_upsert(translation).await?;
        }
        let created = tx.material_save(material).await?;
        if !material.genres.is_empty() {
            tx.material_genres_replace(&material.kodik_id, &material.genres)
                .await?;
        }
        if !material.seasons.is_empty() {
            tx.material_seasons_replace(&material.kodik_id, &material.seasons)
                .await?;
        }
        tx.commit().await?;
        Ok(created)
    }

    async fn get(&self, kodik_id: &str) -> Result<Option<Material>> {
        let sql = format!("{} WHERE m.kodik_id = ?", MATERIAL_SELECT);
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => {
                let Some(row) = sqlx::query(&sql)
                    .bind(kodik_id)
                    .fetch_optional(pool)
                    .await
                    .context("Failed to get material")?
                else {
                    return Ok(None);
                };
                let mut materials = vec![row_to_material_sqlite(&row)?];
                attach_genres_sqlite(pool, &mut materials).await?;
                let mut material = materials.remove(0);
                material.seasons = seasons_sqlite(pool, kodik_id).await?;
                Ok(Some(material))
            }
            DbBackend::Mysql(pool) => {
                let Some(row) = sqlx::query(&sql)
                    .bind(kodik_id)
                    .fetch_optional(pool)
                    .await
                    .context("Failed to get material")?
                else {
                    return Ok(None);
                };
                let mut materials = vec![row_to_material_mysql(&row)?];
                attach_genres_mysql(pool, &mut materials).await?;
                let mut material = materials.remove(0);
                material.seasons = seasons_mysql(pool, kodik_id).await?;
                Ok(Some(material))
            }
        }
    }

    async fn list(
        &self,
        filter: &MaterialFilter,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<Material>, i64)> {
        let binds = FilterBinds::from_filter(filter);
        let offset = (page.max(1) - 1) * page_size;

        match self.pool.backend() {
            DbBackend::Sqlite(pool) => {
                let count_sql = count_sql("\\");
                let count: i64 = bind_filter!(sqlx::query(&count_sql), binds)
                    .fetch_one(pool)
                    .await
                    .context("Failed to count materials")?
                    .get("count");

                let list_sql = list_sql("\\");
                let rows = bind_filter!(sqlx::query(&list_sql), binds)
                    .bind(page_size)
                    .bind(offset)
                    .fetch_all(pool)
                    .await
                    .context("Failed to list materials")?;
                let mut materials = rows
                    .iter()
                    .map(row_to_material_sqlite)
                    .collect::<Result<Vec<_>>>()?;
                attach_genres_sqlite(pool, &mut materials).await?;
                Ok((materials, count))
            }
            DbBackend::Mysql(pool) => {
                let count_sql = count_sql("\\\\");
                let count: i64 = bind_filter!(sqlx::query(&count_sql), binds)
                    .fetch_one(pool)
                    .await
                    .context("Failed to count materials")?
                    .get("count");

                let list_sql = list_sql("\\\\");
                let rows = bind_filter!(sqlx::query(&list_sql), binds)
                    .bind(page_size)
                    .bind(offset)
                    .fetch_all(pool)
                    .await
                    .context("Failed to list materials")?;
                let mut materials = rows
                    .iter()
                    .map(row_to_material_mysql)
                    .collect::<Result<Vec<_>>>()?;
                attach_genres_mysql(pool, &mut materials).await?;
                Ok((materials, count))
            }
        }
    }

    async fn genres(&self, source: Option<&str>, search: Option<&str>) -> Result<Vec<Genre>> {
        let source = source.map(str::trim).filter(|s| !s.is_empty());
        let pattern = search
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", escape_like(s)));

        let rows = match self.pool.backend() {
            DbBackend::Sqlite(pool) => {
                let sql = genres_sql("\\");
                sqlx::query(&sql)
                    .bind(source)
                    .bind(source)
                    .bind(&pattern)
                    .bind(&pattern)
                    .fetch_all(pool)
                    .await
                    .context("Failed to list genres")?
                    .iter()
                    .map(|row| Genre {
                        name: row.get("name"),
                        source: row.get("source"),
                    })
                    .collect()
            }
            DbBackend::Mysql(pool) => {
                let sql = genres_sql("\\\\");
                sqlx::query(&sql)
                    .bind(source)
                    .bind(source)
                    .bind(&pattern)
                    .bind(&pattern)
                    .fetch_all(pool)
                    .await
                    .context("Failed to list genres")?
                    .iter()
                    .map(|row| Genre {
                        name: row.get("name"),
                        source: row.get("source"),
                    })
                    .collect()
            }
        };
        Ok(rows)
    }
}

/// Group episode rows under their seasons
fn assemble_seasons(
    seasons: Vec<(i64, String)>,
    episodes: Vec<(i64, Episode)>,
) -> Vec<Season> {
    let mut by_season: HashMap<i64, Vec<Episode>> = HashMap::new();
    for (season_number, episode) in episodes {
        by_season.entry(season_number).or_default().push(episode);
    }
    seasons
        .into_iter()
        .map(|(number, link)| Season {
            number,
            link,
            episodes: by_season.remove(&number).unwrap_or_default(),
        })
        .collect()
}

fn group_genres(rows: Vec<(String, Genre)>, materials: &mut [Material]) {
    let mut by_material: HashMap<String, Vec<Genre>> = HashMap::new();
    for (kodik_id, genre) in rows {
        by_material.entry(kodik_id).or_default().push(genre);
    }
    for material in materials {
        material.genres = by_material.remove(&material.kodik_id).unwrap_or_default();
    }
}

// ============================================================================
// SQLite implementations
// ============================================================================

async fn attach_genres_sqlite(pool: &SqlitePool, materials: &mut [Material]) -> Result<()> {
    if materials.is_empty() {
        return Ok(());
    }
    let sql = genres_of_sql(materials.len());
    let mut query = sqlx::query(&sql);
    for material in materials.iter() {
        query = query.bind(material.kodik_id.clone());
    }
    let rows = query
        .fetch_all(pool)
        .await
        .context("Failed to load material genres")?
        .iter()
        .map(|row| {
            let genre = Genre {
                name: row.get("name"),
                source: row.get("source"),
            };
            (row.get("kodik_id"), genre)
        })
        .collect();
    group_genres(rows, materials);
    Ok(())
}

async fn seasons_sqlite(pool: &SqlitePool, kodik_id: &str) -> Result<Vec<Season>> {
    let seasons = sqlx::query(SEASONS_SQL)
        .bind(kodik_id)
        .fetch_all(pool)
        .await
        .context("Failed to load seasons")?
        .iter()
        .map(|row| (row.get("number"), row.get("link")))
        .collect();
    let episodes = sqlx::query(EPISODES_SQL)
        .bind(kodik_id)
        .fetch_all(pool)
        .await
        .context("Failed to load episodes")?
        .iter()
        .map(|row| {
            let screenshots: String = row.get("screenshots");
            let episode = Episode {
                number: row.get("number"),
                link: row.get("link"),
                title: row.get("title"),
                screenshots: serde_json::from_str(&screenshots)
                    .context("Invalid episode screenshots JSON")?,
            };
            Ok((row.get("season_number"), episode))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(assemble_seasons(seasons, episodes))
}

async fn material_exists_sqlite(conn: &mut SqliteConnection, kodik_id: &str) -> Result<bool> {
    Ok(sqlx::query("SELECT 1 FROM kodik_materials WHERE kodik_id = ?")
        .bind(kodik_id)
        .fetch_optional(conn)
        .await
        .context("Failed to look up material")?
        .is_some())
}

#[async_trait]
impl MaterialTxOps for SqliteTx {
    async fn material_save(&mut self, material: &Material) -> Result<bool> {
        let exists = material_exists_sqlite(self.conn()?, &material.kodik_id).await?;
        let screenshots = serde_json::to_string(&material.screenshots)?;
        let blocked = serde_json::to_string(&material.blocked_countries)?;

        if exists {
            bind_material!(sqlx::query(UPDATE_SQL), material, &screenshots, &blocked)
                .bind(&material.kodik_id)
                .execute(self.conn()?)
                .await
                .context("Failed to update material")?;
        } else {
            let query = sqlx::query(INSERT_SQL).bind(&material.kodik_id);
            bind_material!(query, material, &screenshots, &blocked)
                .execute(self.conn()?)
                .await
                .context("Failed to insert material")?;
        }
        Ok(!exists)
    }

    async fn translation_upsert(&mut self, translation: &Translation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kodik_translations (id, title, translation_type) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                translation_type = excluded.translation_type
            "#,
        )
        .bind(translation.id)
        .bind(&translation.title)
        .bind(&translation.translation_type)
        .execute(self.conn()?)
        .await
        .context("Failed to save translation")?;
        Ok(())
    }

    async fn material_genres_replace(&mut self, kodik_id: &str, genres: &[Genre]) -> Result<()> {
        sqlx::query("DELETE FROM material_genres WHERE kodik_id = ?")
            .bind(kodik_id)
            .execute(self.conn()?)
            .await
            .context("Failed to clear material genres")?;

        for genre in genres {
            sqlx::query("INSERT OR IGNORE INTO kodik_genres (name, source) VALUES (?, ?)")
                .bind(&genre.name)
                .bind(&genre.source)
                .execute(self.conn()?)
                .await
                .context("Failed to save genre")?;
            let genre_id: i64 = sqlx::query(GENRE_ID_SQL)
                .bind(&genre.name)
                .bind(&genre.source)
                .fetch_one(self.conn()?)
                .await
                .context("Failed to load genre")?
                .get("id");
            sqlx::query("INSERT OR IGNORE INTO material_genres (kodik_id, genre_id) VALUES (?, ?)")
                .bind(kodik_id)
                .bind(genre_id)
                .execute(self.conn()?)
                .await
                .context("Failed to link genre")?;
        }
        Ok(())
    }

    async fn material_seasons_replace(&mut self, kodik_id: &str, seasons: &[Season]) -> Result<()> {
        sqlx::query("DELETE FROM material_episodes WHERE kodik_id = ?")
            .bind(kodik_id)
            .execute(self.conn()?)
            .await
            .context("Failed to clear episodes")?;
        sqlx::query("DELETE FROM material_seasons WHERE kodik_id = ?")
            .bind(kodik_id)
            .execute(self.conn()?)
            .await
            .context("Failed to clear seasons")?;

        for season in seasons {
            sqlx::query(INSERT_SEASON_SQL)
                .bind(kodik_id)
                .bind(season.number)
                .bind(&season.link)
                .execute(self.conn()?)
                .await
                .context("Failed to insert season")?;
            for episode in &season.episodes {
                sqlx::query(INSERT_EPISODE_SQL)
                    .bind(kodik_id)
                    .bind(season.number)
                    .bind(episode.number)
                    .bind(&episode.link)
                    .bind(&episode.title)
                    .bind(serde_json::to_string(&episode.screenshots)?)
                    .execute(self.conn()?)
                    .await
                    .context("Failed to insert episode")?;
            }
        }
        Ok(())
    }
}

fn row_to_material_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<Material> {
    let screenshots: String = row.get("screenshots");
    let blocked: Option<String> = row.get("blocked_countries");
    let other_title: Option<String> = row.get("other_title");
    let translation_id: Option<i64> = row.get("translation_id");
    let translation = match translation_id {
        Some(id) => Some(Translation {
            id,
            title: row.get::<Option<String>, _>("translation_title").unwrap_or_default(),
            translation_type: row.get::<Option<String>, _>("translation_type").unwrap_or_default(),
        }),
        None => None,
    };
    Ok(Material {
        kodik_id: row.get("kodik_id"),
        slug: row.get("slug"),
        material_type: row.get("material_type"),
        link: row.get("link"),
        title: row.get("title"),
        title_orig: row.get("title_orig"),
        other_title: other_title.unwrap_or_default(),
        year: row.get("year"),
        quality: row.get("quality"),
        camrip: row.get("camrip"),
        lgbt: row.get("lgbt"),
        kinopoisk_id: row.get("kinopoisk_id"),
        imdb_id: row.get("imdb_id"),
        mdl_id: row.get("mdl_id"),
        worldart_link: row.get("worldart_link"),
        shikimori_id: row.get("shikimori_id"),
        created_at: row.get("remote_created_at"),
        updated_at: row.get("remote_updated_at"),
        last_season: row.get("last_season"),
        last_episode: row.get("last_episode"),
        episodes_count: row.get("episodes_count"),
        screenshots: serde_json::from_str(&screenshots).context("Invalid screenshots JSON")?,
        poster_url: row.get("poster_url"),
        blocked_countries: match blocked {
            Some(raw) => serde_json::from_str(&raw).context("Invalid blocked countries JSON")?,
            None => Vec::new(),
        },
        translation,
        genres: Vec::new(),
        seasons: Vec::new(),
        synced_at: row.get("synced_at"),
    })
}

// ============================================================================
// MySQL implementations
// ============================================================================

async fn attach_genres_mysql(pool: &MySqlPool, materials: &mut [Material]) -> Result<()> {
    if materials.is_empty() {
        return Ok(());
    }
    let sql = genres_of_sql(materials.len());
    let mut query = sqlx::query(&sql);
    for material in materials.iter() {
        query = query.bind(material.kodik_id.clone());
    }
    let rows = query
        .fetch_all(pool)
        .await
        .context("Failed to load material genres")?
        .iter()
        .map(|row| {
            let genre = Genre {
                name: row.get("name"),
                source: row.get("source"),
            };
            (row.get("kodik_id"), genre)
        })
        .collect();
    group_genres(rows, materials);
    Ok(())
}

async fn seasons_mysql(pool: &MySqlPool, kodik_id: &str) -> Result<Vec<Season>> {
    let seasons = sqlx::query(SEASONS_SQL)
        .bind(kodik_id)
        .fetch_all(pool)
        .await
        .context("Failed to load seasons")?
        .iter()
        .map(|row| (row.get("number"), row.get("link")))
        .collect();
    let episodes = sqlx::query(EPISODES_SQL)
        .bind(kodik_id)
        .fetch_all(pool)
        .await
        .context("Failed to load episodes")?
        .iter()
        .map(|row| {
            let screenshots: String = row.get("screenshots");
            let episode = Episode {
                number: row.get("number"),
                link: row.get("link"),
                title: row.get("title"),
                screenshots: serde_json::from_str(&screenshots)
                    .context("Invalid episode screenshots JSON")?,
            };
            Ok((row.get("season_number"), episode))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(assemble_seasons(seasons, episodes))
}

async fn material_exists_mysql(conn: &mut MySqlConnection, kodik_id: &str) -> Result<bool> {
    Ok(
        sqlx::query("SELECT 1 FROM kodik_materials WHERE kodik_id = ? FOR UPDATE")
            .bind(kodik_id)
            .fetch_optional(conn)
            .await
            .context("Failed to look up material")?
            .is_some(),
    )
}

#[async_trait]
impl MaterialTxOps for MysqlTx {
    async fn material_save(&mut self, material: &Material) -> Result<bool> {
        let exists = material_exists_mysql(self.conn()?, &material.kodik_id).await?;
        let screenshots = serde_json::to_string(&material.screenshots)?;
        let blocked = serde_json::to_string(&material.blocked_countries)?;

        if exists {
            bind_material!(sqlx::query(UPDATE_SQL), material, &screenshots, &blocked)
                .bind(&material.kodik_id)
                .execute(self.conn()?)
                .await
                .context("Failed to update material")?;
        } else {
            let query = sqlx::query(INSERT_SQL).bind(&material.kodik_id);
            bind_material!(query, material, &screenshots, &blocked)
                .execute(self.conn()?)
                .await
                .context("Failed to insert material")?;
        }
        Ok(!exists)
    }

    async fn translation_upsert(&mut self, translation: &Translation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kodik_translations (id, title, translation_type) VALUES (?, ?, ?)
            ON DUPLICATE KEY UPDATE
                title = VALUES(title),
                translation_type = VALUES(translation_type)
            "#,
        )
        .bind(translation.id)
        .bind(&translation.title)
        .bind(&translation.translation_type)
        .execute(self.conn()?)
        .await
        .context("Failed to save translation")?;
        Ok(())
    }

    async fn material_genres_replace(&mut self, kodik_id: &str, genres: &[Genre]) -> Result<()> {
        sqlx::query("DELETE FROM material_genres WHERE kodik_id = ?")
            .bind(kodik_id)
            .execute(self.conn()?)
            .await
            .context("Failed to clear material genres")?;

        for genre in genres {
            sqlx::query("INSERT IGNORE INTO kodik_genres (name, source) VALUES (?, ?)")
                .bind(&genre.name)
                .bind(&genre.source)
                .execute(self.conn()?)
                .await
                .context("Failed to save genre")?;
            let genre_id: i64 = sqlx::query(GENRE_ID_SQL)
                .bind(&genre.name)
                .bind(&genre.source)
                .fetch_one(self.conn()?)
                .await
                .context("Failed to load genre")?
                .get("id");
            sqlx::query("INSERT IGNORE INTO material_genres (kodik_id, genre_id) VALUES (?, ?)")
                .bind(kodik_id)
                .bind(genre_id)
                .execute(self.conn()?)
                .await
                .context("Failed to link genre")?;
        }
        Ok(())
    }

    async fn material_seasons_replace(&mut self, kodik_id: &str, seasons: &[Season]) -> Result<()> {
        sqlx::query("DELETE FROM material_episodes WHERE kodik_id = ?")
            .bind(kodik_id)
            .execute(self.conn()?)
            .await
            .context("Failed to clear episodes")?;
        sqlx::query("DELETE FROM material_seasons WHERE kodik_id = ?")
            .bind(kodik_id)
            .execute(self.conn()?)
            .await
            .context("Failed to clear seasons")?;

        for season in seasons {
            sqlx::query(INSERT_SEASON_SQL)
                .bind(kodik_id)
                .bind(season.number)
                .bind(&season.link)
                .execute(self.conn()?)
                .await
                .context("Failed to insert season")?;
            for episode in &season.episodes {
                sqlx::query(INSERT_EPISODE_SQL)
                    .bind(kodik_id)
                    .bind(season.number)
                    .bind(episode.number)
                    .bind(&episode.link)
                    .bind(&episode.title)
                    .bind(serde_json::to_string(&episode.screenshots)?)
                    .execute(self.conn()?)
                    .await
                    .context("Failed to insert episode")?;
            }
        }
        Ok(())
    }
}

fn row_to_material_mysql(row: &sqlx::mysql::MySqlRow) -> Result<Material> {
    let screenshots: String = row.get("screenshots");
    let blocked: Option<String> = row.get("blocked_countries");
    let other_title: Option<String> = row.get("other_title");
    let translation_id: Option<i64> = row.get("translation_id");
    let translation = match translation_id {
        Some(id) => Some(Translation {
            id,
            title: row.get::<Option<String>, _>("translation_title").unwrap_or_default(),
            translation_type: row.get::<Option<String>, _>("translation_type").unwrap_or_default(),
        }),
        None => None,
    };
    Ok(Material {
        kodik_id: row.get("kodik_id"),
        slug: row.get("slug"),
        material_type: row.get("material_type"),
        link: row.get("link"),
        title: row.get("title"),
        title_orig: row.get("title_orig"),
        other_title: other_title.unwrap_or_default(),
        year: row.get("year"),
        quality: row.get("quality"),
        camrip: row.get("camrip"),
        lgbt: row.get("lgbt"),
        kinopoisk_id: row.get("kinopoisk_id"),
        imdb_id: row.get("imdb_id"),
        mdl_id: row.get("mdl_id"),
        worldart_link: row.get("worldart_link"),
        shikimori_id: row.get("shikimori_id"),
        created_at: row.get("remote_created_at"),
        updated_at: row.get("remote_updated_at"),
        last_season: row.get("last_season"),
        last_episode: row.get("last_episode"),
        episodes_count: row.get("episodes_count"),
        screenshots: serde_json::from_str(&screenshots).context("Invalid screenshots JSON")?,
        poster_url: row.get("poster_url"),
        blocked_countries: match blocked {
            Some(raw) => serde_json::from_str(&raw).context("Invalid blocked countries JSON")?,
            None => Vec::new(),
        },
        translation,
        genres: Vec::new(),
        seasons: Vec::new(),
        synced_at: row.get("synced_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repositories::test_support::migrated_pool;
    use crate::models::KodikItem;
    use chrono::{Duration, Utc};

    fn material(id: &str, title: &str, year: i64, kind: &str, age_minutes: i64) -> Material {
        let item: KodikItem = serde_json::from_value(serde_json::json!({
            "id": id,
            "type": kind,
            "title": title,
            "title_orig": title,
            "year": year,
            "screenshots": ["https://i.kodik.biz/1.jpg"]
        }))
        .unwrap();
        let mut material = item.into_material(Utc::now());
        material.updated_at = Some(Utc::now() - Duration::minutes(age_minutes));
        material
    }

    fn translation(id: i64, title: &str) -> Translation {
        Translation {
            id,
            title: title.to_string(),
            translation_type: "voice".to_string(),
        }
    }

    fn genre(name: &str, source: &str) -> Genre {
        Genre {
            name: name.to_string(),
            source: source.to_string(),
        }
    }

    #[tokio::test]
    async fn test_upsert_reports_created() {
        let pool = migrated_pool().await;
        let repo = SqlxMaterialRepository::new(pool);

        let mut m = material("serial-1", "Frieren", 2023, "anime-serial", 0);
        assert!(repo.upsert(&m).await.unwrap());

        m.last_episode = Some(28);
        m.other_title = "Sousou no Frieren".to_string();
        assert!(!repo.upsert(&m).await.unwrap());

        let stored = repo.get("serial-1").await.unwrap().unwrap();
        assert_eq!(stored.last_episode, Some(28));
        assert_eq!(stored.other_title, "Sousou no Frieren");
        assert_eq!(stored.screenshots, vec!["https://i.kodik.biz/1.jpg".to_string()]);
        assert!(stored.translation.is_none());
    }

    #[tokio::test]
    async fn test_relations_round_trip() {
        let pool = migrated_pool().await;
        let repo = SqlxMaterialRepository::new(pool);

        let mut m = material("serial-2", "Mushishi", 2005, "anime-serial", 0);
        m.translation = Some(translation(610, "AniLibria"));
        m.blocked_countries = vec!["UA".to_string()];
        m.genres = vec![genre("аниме", "kp"), genre("Mystery", "shikimori")];
        m.seasons = vec![Season {
            number: 1,
            link: "//kodik.info/season/1".to_string(),
            episodes: vec![
                Episode {
                    number: 1,
                    link: "//kodik.info/e1".to_string(),
                    title: "The Green Seat".to_string(),
                    screenshots: vec!["https://i/1.jpg".to_string()],
                },
                Episode {
                    number: 2,
                    link: "//kodik.info/e2".to_string(),
                    title: String::new(),
                    screenshots: Vec::new(),
                },
            ],
        }];
        repo.upsert(&m).await.unwrap();

        let stored = repo.get("serial-2").await.unwrap().unwrap();
        assert_eq!(stored.translation, Some(translation(610, "AniLibria")));
        assert_eq!(stored.blocked_countries, vec!["UA".to_string()]);
        assert_eq!(stored.genres, m.genres);
        assert_eq!(stored.seasons, m.seasons);

        // A renamed translation and a new genre list replace the old ones
        m.translation = Some(translation(610, "AniLibria.TV"));
        m.genres = vec![genre("Drama", "shikimori")];
        m.seasons[0].episodes.truncate(1);
        repo.upsert(&m).await.unwrap();

        let stored = repo.get("serial-2").await.unwrap().unwrap();
        assert_eq!(stored.translation.unwrap().title, "AniLibria.TV");
        assert_eq!(stored.genres, vec![genre("Drama", "shikimori")]);
        assert_eq!(stored.seasons[0].episodes.len(), 1);

        // An item without episode data keeps the stored seasons
        m.seasons.clear();
        repo.upsert(&m).await.unwrap();
        assert_eq!(repo.get("serial-2").await.unwrap().unwrap().seasons.len(), 1);
    }

    #[tokio::test]
    async fn test_list_filters_and_paging() {
        let pool = migrated_pool().await;
        let repo = SqlxMaterialRepository::new(pool);
        let mut frieren = material("a", "Frieren", 2023, "anime-serial", 1);
        frieren.genres = vec![genre("Fantasy", "shikimori")];
        frieren.translation = Some(translation(610, "AniLibria"));
        repo.upsert(&frieren).await.unwrap();
        repo.upsert(&material("b", "Akira", 1988, "anime", 2)).await.unwrap();
        let mut mushishi = material("c", "Mushishi", 2005, "anime-serial", 3);
        mushishi.genres = vec![genre("Fantasy", "shikimori"), genre("Mystery", "shikimori")];
        repo.upsert(&mushishi).await.unwrap();

        let (all, count) = repo.list(&MaterialFilter::default(), 1, 2).await.unwrap();
        assert_eq!(count, 3);
        let ids: Vec<_> = all.iter().map(|m| m.kodik_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(all[0].genres, vec![genre("Fantasy", "shikimori")]);
        assert_eq!(all[0].translation.as_ref().map(|t| t.id), Some(610));
        assert!(all[1].genres.is_empty());
        assert!(all[1].seasons.is_empty());

        let serials = MaterialFilter {
            material_type: Some("anime-serial".to_string()),
            ..Default::default()
        };
        assert_eq!(repo.list(&serials, 1, 10).await.unwrap().1, 2);

        let by_year = MaterialFilter {
            year: Some(1988),
            ..Default::default()
        };
        assert_eq!(repo.list(&by_year, 1, 10).await.unwrap().0[0].kodik_id, "b");

        let search = MaterialFilter {
            search: Some("mushi".to_string()),
            ..Default::default()
        };
        let (found, count) = repo.list(&search, 1, 10).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(found[0].title, "Mushishi");

        let by_genre = MaterialFilter {
            genre: Some("Mystery".to_string()),
            ..Default::default()
        };
        let (found, _) = repo.list(&by_genre, 1, 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kodik_id, "c");

        let by_translation = MaterialFilter {
            translation_id: Some(610),
            ..Default::default()
        };
        assert_eq!(repo.list(&by_translation, 1, 10).await.unwrap().1, 1);
    }

    #[tokio::test]
    async fn test_genres_listing() {
        let pool = migrated_pool().await;
        let repo = SqlxMaterialRepository::new(pool);
        let mut m = material("a", "Frieren", 2023, "anime-serial", 1);
        m.genres = vec![
            genre("Fantasy", "shikimori"),
            genre("фэнтези", "kp"),
            genre("Adventure", "shikimori"),
        ];
        repo.upsert(&m).await.unwrap();

        let all = repo.genres(None, None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].name, "Adventure");

        let shikimori = repo.genres(Some("shikimori"), None).await.unwrap();
        assert_eq!(shikimori.len(), 2);

        let found = repo.genres(None, Some("fanta")).await.unwrap();
        assert_eq!(found, vec![genre("Fantasy", "shikimori")]);
    }
}
