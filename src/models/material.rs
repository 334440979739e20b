//! Kodik catalog models
//!
//! `KodikItem` is the wire shape of one entry in a Kodik `/list` response;
//! `Material` is the mirrored row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Screenshots kept per material
pub const MAX_SCREENSHOTS: usize = 200;

/// Screenshots kept per episode
pub const MAX_EPISODE_SCREENSHOTS: usize = 50;

/// Kodik types that are always episodic
pub const SERIAL_TYPES: [&str; 6] = [
    "cartoon-serial",
    "documentary-serial",
    "russian-serial",
    "foreign-serial",
    "anime-serial",
    "multi-part-film",
];

/// Voice-over or subtitle track, keyed by the Kodik translation id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Translation {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    /// `voice` or `subtitles`
    #[serde(rename = "type", default)]
    pub translation_type: String,
}

/// Genre as tagged by one metadata source (`kp`, `shikimori`, `mdl` or `all`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Genre {
    pub name: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub number: i64,
    pub link: String,
    pub title: String,
    pub screenshots: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Season {
    pub number: i64,
    pub link: String,
    pub episodes: Vec<Episode>,
}

/// Mirrored catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Material {
    pub kodik_id: String,
    pub slug: String,
    #[serde(rename = "type")]
    pub material_type: String,
    pub link: String,
    pub title: String,
    pub title_orig: String,
    pub other_title: String,
    pub year: Option<i64>,
    pub quality: String,
    pub camrip: bool,
    pub lgbt: bool,
    pub kinopoisk_id: Option<String>,
    pub imdb_id: Option<String>,
    pub mdl_id: Option<String>,
    pub worldart_link: Option<String>,
    pub shikimori_id: Option<String>,
    /// `created_at` as reported by Kodik
    pub created_at: Option<DateTime<Utc>>,
    /// `updated_at` as reported by Kodik
    pub updated_at: Option<DateTime<Utc>>,
    pub last_season: Option<i64>,
    pub last_episode: Option<i64>,
    pub episodes_count: Option<i64>,
    pub screenshots: Vec<String>,
    pub poster_url: Option<String>,
    pub blocked_countries: Vec<String>,
    pub translation: Option<Translation>,
    pub genres: Vec<Genre>,
    /// Loaded for the detail view only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seasons: Vec<Season>,
    pub synced_at: DateTime<Utc>,
}

impl Material {
    pub fn is_serial(&self) -> bool {
        SERIAL_TYPES.contains(&self.material_type.as_str())
            || !self.seasons.is_empty()
            || self.last_season.is_some()
    }
}

/// Optional extra block requested with `with_material_data=true`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KodikMaterialData {
    #[serde(default)]
    pub poster_url: Option<String>,
    #[serde(default)]
    pub anime_poster_url: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub anime_genres: Vec<String>,
    #[serde(default)]
    pub drama_genres: Vec<String>,
    #[serde(default)]
    pub all_genres: Vec<String>,
}

impl KodikMaterialData {
    /// Genres of every source, trimmed and without duplicates
    pub fn genres(&self) -> Vec<Genre> {
        let sources = [
            ("kp", &self.genres),
            ("shikimori", &self.anime_genres),
            ("mdl", &self.drama_genres),
            ("all", &self.all_genres),
        ];
        let mut seen = HashSet::new();
        let mut genres = Vec::new();
        for (source, names) in sources {
            for name in names.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
                let genre = Genre {
                    name: name.to_string(),
                    source: source.to_string(),
                };
                if seen.insert(genre.clone()) {
                    genres.push(genre);
                }
            }
        }
        genres
    }
}

/// Episode entry: a bare link, or an object with details
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum KodikEpisode {
    Link(String),
    Detailed {
        #[serde(default)]
        link: Option<String>,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        screenshots: Vec<serde_json::Value>,
    },
    /// Anything else, skipped
    Unknown(serde_json::Value),
}

/// Season block of `with_episodes_data=true`, episodes keyed by number
#[derive(Debug, Clone, Deserialize)]
pub struct KodikSeason {
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub episodes: BTreeMap<String, KodikEpisode>,
}

/// One result of the Kodik `/list` endpoint. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct KodikItem {
    pub id: String,
    #[serde(rename = "type", default)]
    pub material_type: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub title_orig: Option<String>,
    #[serde(default)]
    pub other_title: Option<String>,
    #[serde(default)]
    pub translation: Option<Translation>,
    #[serde(default)]
    pub year: Option<i64>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub camrip: Option<bool>,
    #[serde(default)]
    pub lgbt: Option<bool>,
    #[serde(default)]
    pub kinopoisk_id: Option<String>,
    #[serde(default)]
    pub imdb_id: Option<String>,
    #[serde(default)]
    pub mdl_id: Option<String>,
    #[serde(default)]
    pub worldart_link: Option<String>,
    #[serde(default)]
    pub shikimori_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_season: Option<i64>,
    #[serde(default)]
    pub last_episode: Option<i64>,
    #[serde(default)]
    pub episodes_count: Option<i64>,
    #[serde(default)]
    pub blocked_countries: Vec<String>,
    #[serde(default)]
    pub screenshots: Vec<String>,
    #[serde(default)]
    pub seasons: Option<BTreeMap<String, KodikSeason>>,
    #[serde(default)]
    pub material_data: Option<KodikMaterialData>,
}

/// One page of the Kodik `/list` endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct KodikPage {
    #[serde(default)]
    pub results: Vec<KodikItem>,
    #[serde(default)]
    pub next_page: Option<String>,
    #[serde(default)]
    pub total: Option<i64>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Screenshot URLs of an episode; entries are strings or objects carrying
/// `url`, `src` or `href`
fn episode_screenshots(raw: &[serde_json::Value]) -> Vec<String> {
    raw.iter()
        .filter_map(|shot| match shot {
            serde_json::Value::String(url) => Some(url.trim()),
            serde_json::Value::Object(map) => ["url", "src", "href"]
                .iter()
                .find_map(|key| map.get(*key).and_then(|v| v.as_str()))
                .map(str::trim),
            _ => None,
        })
        .filter(|url| !url.is_empty())
        .take(MAX_EPISODE_SCREENSHOTS)
        .map(str::to_string)
        .collect()
}

/// Numbered seasons in ascending order; non-numeric keys are dropped
fn parse_seasons(raw: BTreeMap<String, KodikSeason>) -> Vec<Season> {
    let mut seasons: Vec<Season> = raw
        .into_iter()
        .filter_map(|(key, season)| {
            let number = key.trim().parse::<i64>().ok()?;
            let mut episodes: Vec<Episode> = season
                .episodes
                .into_iter()
                .filter_map(|(key, episode)| {
                    let number = key.trim().parse::<i64>().ok()?;
                    let episode = match episode {
                        KodikEpisode::Link(link) => Episode {
                            number,
                            link,
                            title: String::new(),
                            screenshots: Vec::new(),
                        },
                        KodikEpisode::Detailed {
                            link,
                            title,
                            screenshots,
                        } => Episode {
                            number,
                            link: link.unwrap_or_default(),
                            title: title.unwrap_or_default(),
                            screenshots: episode_screenshots(&screenshots),
                        },
                        KodikEpisode::Unknown(_) => return None,
                    };
                    Some(episode)
                })
                .collect();
            episodes.sort_by_key(|e| e.number);
            Some(Season {
                number,
                link: season.link.unwrap_or_default(),
                episodes,
            })
        })
        .collect();
    seasons.sort_by_key(|s| s.number);
    seasons
}

impl KodikItem {
    /// Map the wire item into a mirrored row
    pub fn into_material(self, synced_at: DateTime<Utc>) -> Material {
        let (poster_url, genres) = match self.material_data {
            Some(data) => (
                non_empty(data.anime_poster_url.clone()).or(non_empty(data.poster_url.clone())),
                data.genres(),
            ),
            None => (None, Vec::new()),
        };
        let mut screenshots = self.screenshots;
        screenshots.truncate(MAX_SCREENSHOTS);
        let slug = crate::models::slugify(self.title_orig.as_deref().unwrap_or(&self.id));
        let link = self.link.unwrap_or_default();
        let blocked_countries = self
            .blocked_countries
            .into_iter()
            .filter_map(|c| non_empty(Some(c)))
            .collect();

        let mut material = Material {
            slug,
            material_type: self.material_type.unwrap_or_default(),
            link,
            title: self.title.unwrap_or_default(),
            title_orig: self.title_orig.unwrap_or_default(),
            other_title: self.other_title.unwrap_or_default(),
            year: self.year.filter(|y| *y > 0),
            quality: self.quality.unwrap_or_default(),
            camrip: self.camrip.unwrap_or(false),
            lgbt: self.lgbt.unwrap_or(false),
            kinopoisk_id: non_empty(self.kinopoisk_id),
            imdb_id: non_empty(self.imdb_id),
            mdl_id: non_empty(self.mdl_id),
            worldart_link: non_empty(self.worldart_link),
            shikimori_id: non_empty(self.shikimori_id),
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_season: self.last_season,
            last_episode: self.last_episode,
            episodes_count: self.episodes_count,
            screenshots,
            poster_url,
            blocked_countries,
            translation: self.translation.filter(|t| t.id > 0),
            genres,
            seasons: self.seasons.map(parse_seasons).unwrap_or_default(),
            synced_at,
            kodik_id: self.id,
        };

        // Movies are stored as season 1, episode 1 pointing at the movie
        if !material.is_serial() && !material.link.is_empty() {
            material.seasons = vec![Season {
                number: 1,
                link: material.link.clone(),
                episodes: vec![Episode {
                    number: 1,
                    link: material.link.clone(),
                    title: String::new(),
                    screenshots: Vec::new(),
                }],
            }];
        }
        material
    }
}

/// Catalog listing filters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MaterialFilter {
    pub search: Option<String>,
    #[serde(rename = "type")]
    pub material_type: Option<String>,
    pub year: Option<i64>,
    /// Genre name, any source
    pub genre: Option<String>,
    /// Kodik translation id
    pub translation_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "time": "2ms",
        "total": 1,
        "next_page": "https://kodikapi.com/list?page=abc",
        "results": [{
            "id": "serial-12345",
            "type": "anime-serial",
            "link": "//kodik.info/serial/12345/hash/720p",
            "title": "Магическая битва",
            "title_orig": "Jujutsu Kaisen",
            "other_title": "JJK",
            "translation": {"id": 610, "title": "AniLibria", "type": "voice"},
            "year": 2020,
            "last_season": 1,
            "last_episode": 24,
            "episodes_count": 24,
            "kinopoisk_id": " 1370366 ",
            "imdb_id": "",
            "shikimori_id": "40748",
            "quality": "WEB-DLRip 720p",
            "camrip": false,
            "lgbt": false,
            "created_at": "2020-10-03T03:12:44Z",
            "updated_at": "2021-03-27T10:45:01Z",
            "screenshots": ["https://i.kodik.biz/1.jpg", "https://i.kodik.biz/2.jpg"],
            "material_data": {"poster_url": "https://st.kp.yandex.net/p.jpg", "anime_poster_url": ""}
        }]
    }"#;

    #[test]
    fn test_parse_page() {
        let page: KodikPage = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(page.results.len(), 1);
        assert_eq!(page.next_page.as_deref(), Some("https://kodikapi.com/list?page=abc"));
    }

    #[test]
    fn test_into_material() {
        let page: KodikPage = serde_json::from_str(SAMPLE).unwrap();
        let now = Utc::now();
        let material = page.results.into_iter().next().unwrap().into_material(now);

        assert_eq!(material.kodik_id, "serial-12345");
        assert_eq!(material.slug, "jujutsu-kaisen");
        assert_eq!(material.material_type, "anime-serial");
        assert_eq!(material.kinopoisk_id.as_deref(), Some("1370366"));
        assert_eq!(material.imdb_id, None);
        assert_eq!(material.poster_url.as_deref(), Some("https://st.kp.yandex.net/p.jpg"));
        assert_eq!(material.screenshots.len(), 2);
        assert_eq!(material.episodes_count, Some(24));
        assert_eq!(material.synced_at, now);
    }

    #[test]
    fn test_screenshots_capped() {
        let mut item: KodikItem = serde_json::from_value(serde_json::json!({"id": "movie-1"})).unwrap();
        item.screenshots = (0..300).map(|i| format!("https://i/{}.jpg", i)).collect();
        let material = item.into_material(Utc::now());
        assert_eq!(material.screenshots.len(), MAX_SCREENSHOTS);
        assert_eq!(material.title, "");
    }

    #[test]
    fn test_translation_and_genres() {
        let item: KodikItem = serde_json::from_value(serde_json::json!({
            "id": "serial-1",
            "type": "anime-serial",
            "translation": {"id": 610, "title": "AniLibria", "type": "voice"},
            "blocked_countries": ["UA", " "],
            "material_data": {
                "genres": ["аниме", "фэнтези"],
                "anime_genres": ["Fantasy", " Fantasy ", ""],
                "all_genres": ["аниме"]
            }
        }))
        .unwrap();
        let material = item.into_material(Utc::now());

        let translation = material.translation.unwrap();
        assert_eq!(translation.id, 610);
        assert_eq!(translation.translation_type, "voice");
        assert_eq!(material.blocked_countries, vec!["UA".to_string()]);
        let genres: Vec<(&str, &str)> = material
            .genres
            .iter()
            .map(|g| (g.source.as_str(), g.name.as_str()))
            .collect();
        assert_eq!(
            genres,
            vec![
                ("kp", "аниме"),
                ("kp", "фэнтези"),
                ("shikimori", "Fantasy"),
                ("all", "аниме"),
            ]
        );
    }

    #[test]
    fn test_seasons_from_both_episode_shapes() {
        let item: KodikItem = serde_json::from_value(serde_json::json!({
            "id": "serial-2",
            "type": "anime-serial",
            "seasons": {
                "2": {"link": "//kodik.info/season/2", "episodes": {"1": "//kodik.info/s2e1"}},
                "1": {
                    "link": "//kodik.info/season/1",
                    "episodes": {
                        "10": "//kodik.info/s1e10",
                        "2": {
                            "link": "//kodik.info/s1e2",
                            "title": "Второй",
                            "screenshots": ["https://i/1.jpg", {"src": "https://i/2.jpg"}, {"alt": "x"}, 7]
                        },
                        "special": "//kodik.info/skip"
                    }
                }
            }
        }))
        .unwrap();
        let material = item.into_material(Utc::now());

        assert!(material.is_serial());
        let numbers: Vec<i64> = material.seasons.iter().map(|s| s.number).collect();
        assert_eq!(numbers, vec![1, 2]);
        let first = &material.seasons[0];
        let episodes: Vec<i64> = first.episodes.iter().map(|e| e.number).collect();
        assert_eq!(episodes, vec![2, 10]);
        assert_eq!(first.episodes[0].title, "Второй");
        assert_eq!(
            first.episodes[0].screenshots,
            vec!["https://i/1.jpg".to_string(), "https://i/2.jpg".to_string()]
        );
        assert_eq!(first.episodes[1].link, "//kodik.info/s1e10");
    }

    #[test]
    fn test_movie_gets_single_episode() {
        let item: KodikItem = serde_json::from_value(serde_json::json!({
            "id": "movie-7",
            "type": "anime",
            "link": "//kodik.info/video/7"
        }))
        .unwrap();
        let material = item.into_material(Utc::now());
        assert_eq!(material.seasons.len(), 1);
        assert_eq!(material.seasons[0].episodes[0].link, "//kodik.info/video/7");

        let bare: KodikItem = serde_json::from_value(serde_json::json!({"id": "movie-8", "type": "anime"})).unwrap();
        assert!(bare.into_material(Utc::now()).seasons.is_empty());
    }
}
