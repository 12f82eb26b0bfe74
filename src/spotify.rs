/*!
Spotify API client. One function per capability, each taking a bearer
token and returning flat records with the upstream payload shapes
kept private to this module.
*/
use crate::{se, CONFIG};

const AUTH_URL: &str = "https://accounts.spotify.com/authorize";
const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const API_BASE: &str = "https://api.spotify.com/v1";

const SCOPES: &str = "user-library-read user-top-read user-read-recently-played playlist-modify-public playlist-modify-private";

// -- raw payload shapes --
// Optional things (images, urls, emails) decode to None instead of
// erroring since spotify omits them for plenty of real accounts.
// Ids and names are required and fail the decode loudly.

#[derive(Debug, Default, serde::Deserialize)]
struct ExternalUrls {
    spotify: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct Image {
    url: String,
}

#[derive(Debug, serde::Deserialize)]
struct Followers {
    total: i64,
}

#[derive(Debug, serde::Deserialize)]
struct RawProfile {
    id: String,
    display_name: Option<String>,
    email: Option<String>,
    #[serde(default)]
    external_urls: ExternalUrls,
    #[serde(default)]
    images: Vec<Image>,
}

#[derive(Debug, serde::Deserialize)]
struct RawArtist {
    name: String,
    id: String,
    popularity: i32,
    followers: Followers,
    #[serde(default)]
    genres: Vec<String>,
    #[serde(default)]
    external_urls: ExternalUrls,
    #[serde(default)]
    images: Vec<Image>,
}

#[derive(Debug, serde::Deserialize)]
struct TrackArtist {
    name: String,
}

#[derive(Debug, serde::Deserialize)]
struct RawAlbum {
    name: String,
    #[serde(default)]
    images: Vec<Image>,
}

#[derive(Debug, serde::Deserialize)]
struct RawTrack {
    name: String,
    id: String,
    artists: Vec<TrackArtist>,
    album: RawAlbum,
    popularity: i32,
    duration_ms: i64,
    #[serde(default)]
    external_urls: ExternalUrls,
}

#[derive(Debug, serde::Deserialize)]
struct PlayHistoryItem {
    track: RawTrack,
    played_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, serde::Deserialize)]
struct Paging<T> {
    items: Vec<T>,
}

#[derive(Debug, serde::Deserialize)]
struct SearchResponse {
    tracks: Paging<RawTrack>,
}

#[derive(Debug, serde::Deserialize)]
struct RawPlaylist {
    id: String,
    #[serde(default)]
    external_urls: ExternalUrls,
}

// -- flat records handed to the rest of the app --

#[derive(Debug, serde::Serialize)]
pub struct Profile {
    pub id: String,
    pub display_name: String,
    pub email: String,
    pub profile_url: Option<String>,
    pub image: Option<String>,
}

impl From<RawProfile> for Profile {
    fn from(raw: RawProfile) -> Self {
        Profile {
            display_name: raw.display_name.clone().unwrap_or_else(|| raw.id.clone()),
            id: raw.id,
            email: raw.email.unwrap_or_else(|| "N/A".to_string()),
            profile_url: raw.external_urls.spotify,
            image: raw.images.into_iter().next().map(|i| i.url),
        }
    }
}

#[derive(Debug)]
pub struct Artist {
    pub name: String,
    pub id: String,
    pub popularity: i32,
    pub followers: i64,
    pub spotify_url: Option<String>,
    pub image_url: Option<String>,
    pub genres: Vec<String>,
}

impl From<RawArtist> for Artist {
    fn from(raw: RawArtist) -> Self {
        Artist {
            name: raw.name,
            id: raw.id,
            popularity: raw.popularity,
            followers: raw.followers.total,
            spotify_url: raw.external_urls.spotify,
            image_url: raw.images.into_iter().next().map(|i| i.url),
            genres: raw.genres,
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct Track {
    pub name: String,
    pub id: String,
    pub artists: Vec<String>,
    pub album: String,
    pub album_image: Option<String>,
    pub popularity: i32,
    pub spotify_url: Option<String>,
    pub duration_ms: i64,
}

impl From<RawTrack> for Track {
    fn from(raw: RawTrack) -> Self {
        Track {
            name: raw.name,
            id: raw.id,
            artists: raw.artists.into_iter().map(|a| a.name).collect(),
            album: raw.album.name,
            album_image: raw.album.images.into_iter().next().map(|i| i.url),
            popularity: raw.popularity,
            spotify_url: raw.external_urls.spotify,
            duration_ms: raw.duration_ms,
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct PlayedTrack {
    pub name: String,
    pub id: String,
    pub artists: Vec<String>,
    pub album: String,
    pub album_image: Option<String>,
    pub popularity: i32,
    pub spotify_url: Option<String>,
    pub played_at: chrono::DateTime<chrono::Utc>,
}

impl From<PlayHistoryItem> for PlayedTrack {
    fn from(item: PlayHistoryItem) -> Self {
        let track = item.track;
        PlayedTrack {
            name: track.name,
            id: track.id,
            artists: track.artists.into_iter().map(|a| a.name).collect(),
            album: track.album.name,
            album_image: track.album.images.into_iter().next().map(|i| i.url),
            popularity: track.popularity,
            spotify_url: track.external_urls.spotify,
            played_at: item.played_at,
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct SearchTrack {
    pub name: String,
    pub id: String,
    pub artists: Vec<String>,
    pub album: String,
    pub spotify_url: Option<String>,
}

impl From<RawTrack> for SearchTrack {
    fn from(raw: RawTrack) -> Self {
        SearchTrack {
            name: raw.name,
            id: raw.id,
            artists: raw.artists.into_iter().map(|a| a.name).collect(),
            album: raw.album.name,
            spotify_url: raw.external_urls.spotify,
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct Playlist {
    pub id: String,
    pub url: Option<String>,
}

impl From<RawPlaylist> for Playlist {
    fn from(raw: RawPlaylist) -> Self {
        Playlist {
            id: raw.id,
            url: raw.external_urls.spotify,
        }
    }
}

// -- token endpoint --

#[derive(serde::Deserialize, Debug)]
pub struct Access {
    pub access_token: String,
    pub token_type: String,
    pub scope: String,
    pub expires_in: u64,
    pub refresh_token: Option<String>,
}

#[derive(serde::Serialize)]
struct AccessParams {
    grant_type: String,
    code: String,
    redirect_uri: String,
}

impl AccessParams {
    fn from_code(code: &str) -> Self {
        AccessParams {
            grant_type: "authorization_code".to_string(),
            code: code.to_string(),
            redirect_uri: CONFIG.spotify_redirect_url(),
        }
    }
}

#[derive(serde::Serialize)]
struct RefreshParams {
    grant_type: String,
    refresh_token: String,
}

impl RefreshParams {
    fn from_token(token: &str) -> Self {
        RefreshParams {
            grant_type: "refresh_token".to_string(),
            refresh_token: token.to_string(),
        }
    }
}

/// The spotify authorize page users get redirected to when logging in.
/// `state` is an optional one-time token that spotify echoes back to
/// our callback.
pub fn authorize_url(state: Option<&str>) -> crate::Result<String> {
    let mut params: Vec<(&str, String)> = vec![
        ("client_id", CONFIG.spotify_client_id.clone()),
        ("response_type", "code".to_string()),
        ("redirect_uri", CONFIG.spotify_redirect_url()),
        ("scope", SCOPES.to_string()),
    ];
    if let Some(state) = state {
        params.push(("state", state.to_string()));
    }
    let url = surf::Url::parse_with_params(AUTH_URL, &params)
        .map_err(|e| se!("authorize url error {}", e))?;
    Ok(url.into())
}

pub async fn new_access_token(code: &str) -> crate::Result<Access> {
    let body = surf::Body::from_form(&AccessParams::from_code(code))
        .map_err(|e| se!("access form error {}", e))?;
    token_request(body).await
}

pub async fn refresh_access_token(refresh_token: &str) -> crate::Result<Access> {
    let body = surf::Body::from_form(&RefreshParams::from_token(refresh_token))
        .map_err(|e| se!("refresh form error {}", e))?;
    token_request(body).await
}

async fn token_request(body: surf::Body) -> crate::Result<Access> {
    let auth = base64::encode(
        format!("{}:{}", CONFIG.spotify_client_id, CONFIG.spotify_secret_id).as_bytes(),
    );
    let resp = surf::post(TOKEN_URL)
        .body(body)
        .header("authorization", format!("Basic {}", auth))
        .send()
        .await
        .map_err(|e| se!("token request error {}", e))?;
    let mut resp = ensure_success(resp, TOKEN_URL).await?;
    resp.body_json()
        .await
        .map_err(|e| se!("token response json error {}", e))
}

// -- web api --

async fn api_get(token: &str, url: impl AsRef<str>) -> crate::Result<surf::Response> {
    let url = url.as_ref();
    let resp = surf::get(url)
        .header("authorization", format!("Bearer {}", token))
        .send()
        .await
        .map_err(|e| se!("error requesting {} {}", url, e))?;
    ensure_success(resp, url).await
}

async fn ensure_success(mut resp: surf::Response, url: &str) -> crate::Result<surf::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp
        .body_string()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    Err(se!("{} responded {} {}", url, status, body))
}

pub async fn fetch_profile(token: &str) -> crate::Result<Profile> {
    let mut resp = api_get(token, format!("{}/me", API_BASE)).await?;
    let raw: RawProfile = resp
        .body_json()
        .await
        .map_err(|e| se!("profile json error {}", e))?;
    Ok(raw.into())
}

pub async fn fetch_top_artists(token: &str, limit: usize) -> crate::Result<Vec<Artist>> {
    let url = surf::Url::parse_with_params(
        &format!("{}/me/top/artists", API_BASE),
        &[("limit", limit.to_string())],
    )
    .map_err(|e| se!("top artists url error {}", e))?;
    let mut resp = api_get(token, url).await?;
    let page: Paging<RawArtist> = resp
        .body_json()
        .await
        .map_err(|e| se!("top artists json error {}", e))?;
    Ok(page.items.into_iter().map(Artist::from).collect())
}

pub async fn fetch_top_tracks(token: &str, limit: usize) -> crate::Result<Vec<Track>> {
    let url = surf::Url::parse_with_params(
        &format!("{}/me/top/tracks", API_BASE),
        &[("limit", limit.to_string())],
    )
    .map_err(|e| se!("top tracks url error {}", e))?;
    let mut resp = api_get(token, url).await?;
    let page: Paging<RawTrack> = resp
        .body_json()
        .await
        .map_err(|e| se!("top tracks json error {}", e))?;
    Ok(page.items.into_iter().map(Track::from).collect())
}

pub async fn fetch_recently_played(token: &str, limit: usize) -> crate::Result<Vec<PlayedTrack>> {
    let url = surf::Url::parse_with_params(
        &format!("{}/me/player/recently-played", API_BASE),
        &[("limit", limit.to_string())],
    )
    .map_err(|e| se!("recently played url error {}", e))?;
    let mut resp = api_get(token, url).await?;
    let page: Paging<PlayHistoryItem> = resp
        .body_json()
        .await
        .map_err(|e| se!("recently played json error {}", e))?;
    Ok(page.items.into_iter().map(PlayedTrack::from).collect())
}

pub async fn search_tracks(
    token: &str,
    query: &str,
    limit: usize,
) -> crate::Result<Vec<SearchTrack>> {
    let limit = limit.to_string();
    let url = surf::Url::parse_with_params(
        &format!("{}/search", API_BASE),
        &[("q", query), ("type", "track"), ("limit", limit.as_str())],
    )
    .map_err(|e| se!("search url error {}", e))?;
    let mut resp = api_get(token, url).await?;
    let results: SearchResponse = resp
        .body_json()
        .await
        .map_err(|e| se!("search json error {}", e))?;
    Ok(results
        .tracks
        .items
        .into_iter()
        .map(SearchTrack::from)
        .collect())
}

pub async fn create_playlist(token: &str, user_id: &str, name: &str) -> crate::Result<Playlist> {
    let url = format!("{}/users/{}/playlists", API_BASE, user_id);
    let body = serde_json::json!({ "name": name, "public": true });
    let resp = surf::post(&url)
        .header("authorization", format!("Bearer {}", token))
        .body(surf::Body::from_json(&body).map_err(|e| se!("playlist body error {}", e))?)
        .send()
        .await
        .map_err(|e| se!("create playlist request error {}", e))?;
    let mut resp = ensure_success(resp, &url).await?;
    let raw: RawPlaylist = resp
        .body_json()
        .await
        .map_err(|e| se!("create playlist json error {}", e))?;
    Ok(raw.into())
}

pub async fn add_playlist_tracks(
    token: &str,
    playlist_id: &str,
    uris: &[String],
) -> crate::Result<()> {
    let url = format!("{}/playlists/{}/tracks", API_BASE, playlist_id);
    let body = serde_json::json!({ "uris": uris });
    let resp = surf::post(&url)
        .header("authorization", format!("Bearer {}", token))
        .body(surf::Body::from_json(&body).map_err(|e| se!("playlist tracks body error {}", e))?)
        .send()
        .await
        .map_err(|e| se!("add playlist tracks request error {}", e))?;
    ensure_success(resp, &url).await?;
    Ok(())
}

/// Count every genre tag across `artists` and return the ten most
/// frequent, most common first. Ties keep the order the genres were
/// first seen in, which follows the upstream artist relevance order.
pub fn rank_genres(artists: &[Artist]) -> Vec<(String, usize)> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for artist in artists {
        for genre in &artist.genres {
            match counts.iter_mut().find(|entry| entry.0 == *genre) {
                Some(entry) => entry.1 += 1,
                None => counts.push((genre.clone(), 1)),
            }
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts.truncate(10);
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artist_with_genres(name: &str, genres: &[&str]) -> Artist {
        Artist {
            name: name.to_string(),
            id: format!("id-{}", name),
            popularity: 50,
            followers: 1000,
            spotify_url: None,
            image_url: None,
            genres: genres.iter().map(|g| g.to_string()).collect(),
        }
    }

    #[test]
    fn genres_are_ranked_by_frequency() {
        let artists = vec![
            artist_with_genres("a", &["rock"]),
            artist_with_genres("b", &["rock", "pop"]),
            artist_with_genres("c", &["jazz"]),
        ];
        let ranked = rank_genres(&artists);
        assert_eq!(
            ranked,
            vec![
                ("rock".to_string(), 2),
                ("pop".to_string(), 1),
                ("jazz".to_string(), 1),
            ]
        );
    }

    #[test]
    fn genre_ties_keep_first_seen_order() {
        let artists = vec![
            artist_with_genres("a", &["jazz"]),
            artist_with_genres("b", &["rock", "pop"]),
            artist_with_genres("c", &["rock"]),
        ];
        let ranked = rank_genres(&artists);
        assert_eq!(ranked[0], ("rock".to_string(), 2));
        assert_eq!(ranked[1], ("jazz".to_string(), 1));
        assert_eq!(ranked[2], ("pop".to_string(), 1));
    }

    #[test]
    fn genre_ranking_is_capped_at_ten() {
        let artists: Vec<Artist> = (0..12)
            .map(|n| {
                let genre = format!("genre-{}", n);
                artist_with_genres(&format!("a{}", n), &[genre.as_str()])
            })
            .collect();
        let ranked = rank_genres(&artists);
        assert_eq!(ranked.len(), 10);
        assert_eq!(ranked[0].0, "genre-0");
        assert_eq!(ranked[9].0, "genre-9");
    }

    #[test]
    fn no_artists_means_no_genres() {
        assert!(rank_genres(&[]).is_empty());
    }

    #[test]
    fn profile_decode_tolerates_missing_optional_fields() {
        let raw: RawProfile = serde_json::from_value(serde_json::json!({
            "id": "user-1",
            "display_name": "Somebody"
        }))
        .unwrap();
        let profile = Profile::from(raw);
        assert_eq!(profile.id, "user-1");
        assert_eq!(profile.email, "N/A");
        assert_eq!(profile.profile_url, None);
        assert_eq!(profile.image, None);
    }

    #[test]
    fn profile_decode_requires_an_id() {
        let raw = serde_json::from_value::<RawProfile>(serde_json::json!({
            "display_name": "Somebody"
        }));
        assert!(raw.is_err());
    }

    #[test]
    fn null_display_name_falls_back_to_the_account_id() {
        let raw: RawProfile = serde_json::from_value(serde_json::json!({
            "id": "user-1",
            "display_name": null,
            "email": "who@example.com"
        }))
        .unwrap();
        let profile = Profile::from(raw);
        assert_eq!(profile.display_name, "user-1");
        assert_eq!(profile.email, "who@example.com");
    }

    #[test]
    fn artist_decode_tolerates_missing_images_and_urls() {
        let raw: RawArtist = serde_json::from_value(serde_json::json!({
            "name": "Band",
            "id": "artist-1",
            "popularity": 71,
            "followers": { "total": 1234 }
        }))
        .unwrap();
        let artist = Artist::from(raw);
        assert_eq!(artist.followers, 1234);
        assert_eq!(artist.image_url, None);
        assert_eq!(artist.spotify_url, None);
        assert!(artist.genres.is_empty());
    }

    #[test]
    fn track_decode_maps_the_first_album_image() {
        let raw: RawTrack = serde_json::from_value(serde_json::json!({
            "name": "Song",
            "id": "track-1",
            "artists": [{ "name": "Band" }, { "name": "Guest" }],
            "album": {
                "name": "Album",
                "images": [
                    { "url": "https://img/large" },
                    { "url": "https://img/small" }
                ]
            },
            "popularity": 60,
            "duration_ms": 201000,
            "external_urls": { "spotify": "https://open/track-1" }
        }))
        .unwrap();
        let track = Track::from(raw);
        assert_eq!(track.artists, vec!["Band".to_string(), "Guest".to_string()]);
        assert_eq!(track.album_image.as_deref(), Some("https://img/large"));
        assert_eq!(track.spotify_url.as_deref(), Some("https://open/track-1"));
        assert_eq!(track.duration_ms, 201000);
    }

    #[test]
    fn play_history_decode_parses_played_at() {
        let item: PlayHistoryItem = serde_json::from_value(serde_json::json!({
            "track": {
                "name": "Song",
                "id": "track-1",
                "artists": [{ "name": "Band" }],
                "album": { "name": "Album" },
                "popularity": 60,
                "duration_ms": 201000
            },
            "played_at": "2024-01-15T12:34:56.789Z"
        }))
        .unwrap();
        let played = PlayedTrack::from(item);
        assert_eq!(played.album_image, None);
        assert_eq!(played.played_at.to_rfc3339(), "2024-01-15T12:34:56.789+00:00");
    }

    #[test]
    fn search_response_decode_reaches_nested_items() {
        let results: SearchResponse = serde_json::from_value(serde_json::json!({
            "tracks": {
                "items": [{
                    "name": "Hit",
                    "id": "track-9",
                    "artists": [{ "name": "Band" }],
                    "album": { "name": "Album" },
                    "popularity": 80,
                    "duration_ms": 180000
                }]
            }
        }))
        .unwrap();
        let tracks: Vec<SearchTrack> = results
            .tracks
            .items
            .into_iter()
            .map(SearchTrack::from)
            .collect();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].id, "track-9");
    }

    #[test]
    fn token_response_decode_tolerates_missing_refresh_token() {
        let access: Access = serde_json::from_value(serde_json::json!({
            "access_token": "abc",
            "token_type": "Bearer",
            "scope": "user-top-read",
            "expires_in": 3600
        }))
        .unwrap();
        assert_eq!(access.token_type, "Bearer");
        assert!(access.refresh_token.is_none());
    }

    #[test]
    fn authorize_url_carries_the_oauth_params() {
        let url = authorize_url(Some("state-token")).unwrap();
        let url = surf::Url::parse(&url).unwrap();
        let params: std::collections::HashMap<String, String> =
            url.query_pairs().into_owned().collect();
        assert_eq!(params.get("response_type").map(String::as_str), Some("code"));
        assert_eq!(params.get("scope").map(String::as_str), Some(SCOPES));
        assert_eq!(params.get("state").map(String::as_str), Some("state-token"));
        assert!(params
            .get("redirect_uri")
            .map(|r| r.ends_with("/callback"))
            .unwrap_or(false));
    }

    #[test]
    fn authorize_url_omits_state_when_not_asked_for() {
        let url = authorize_url(None).unwrap();
        assert!(!url.contains("state="));
    }
}
