use cached::Cached;
use sqlx::PgPool;

use crate::{crypto, db, models, resp, se, spotify, utils, Result, CONFIG, LOG};

/// Session key holding the encrypted spotify token bundle.
const TOKEN_KEY: &str = "token_bundle";

#[derive(Clone)]
struct Context {
    pool: sqlx::PgPool,
}

/// All middleware and routes mounted on a fresh server, not yet
/// listening.
fn build_server(pool: sqlx::PgPool) -> tide::Server<Context> {
    let ctx = Context { pool };
    let mut app = tide::with_state(ctx);
    app.with(crate::logging::LogMiddleware::new());
    app.with(tide::utils::After(crate::logging::json_error));
    app.with(
        tide::sessions::SessionMiddleware::new(
            tide::sessions::CookieStore::new(),
            CONFIG.session_secret.as_bytes(),
        )
        .with_cookie_name("cratedigger.sid"),
    );
    app.at("/").get(login);
    app.at("/callback").get(auth_callback);
    app.at("/status").get(status);
    app.at("/user-profile").get(user_profile);
    app.at("/user-top-artists").get(user_top_artists);
    app.at("/user-top-tracks").get(user_top_tracks);
    app.at("/user-recently-played").get(user_recently_played);
    app.at("/user-top-genres").get(user_top_genres);
    app.at("/user-top-genres-show").get(user_top_genres_show);
    app.at("/recommend-tracks").get(recommend_tracks);
    app.at("/create-playlist").post(create_playlist);
    app.at("/debug-token").get(debug_token);
    app
}

pub async fn start(pool: sqlx::PgPool) -> crate::Result<()> {
    let app = build_server(pool);
    slog::info!(LOG, "running at {}", CONFIG.host());
    app.listen(CONFIG.host()).await?;
    Ok(())
}

#[derive(serde::Serialize)]
struct Status<'a> {
    ok: &'a str,
    version: &'a str,
}

async fn status(_req: tide::Request<Context>) -> tide::Result {
    Ok(resp!(json => Status {
        ok: "ok",
        version: &CONFIG.version
    }))
}

/// The spotify access and refresh tokens tied to one browser session.
/// The bundle only ever lives in the session cookie, encrypted with
/// the application key; the server keeps no copy.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct TokenBundle {
    access_token: String,
    refresh_token: String,
    expires: i64,
    scopes: Vec<String>,
}

impl TokenBundle {
    /// Build a bundle from a token endpoint response. Refresh responses
    /// usually omit the refresh token, so the previous one carries over;
    /// having neither is an error since the session would be unrefreshable.
    fn from_access(access: &spotify::Access, prior_refresh: Option<String>) -> Result<Self> {
        let refresh_token = access
            .refresh_token
            .clone()
            .or(prior_refresh)
            .ok_or_else(|| se!("token response carried no refresh token"))?;
        Ok(TokenBundle {
            access_token: access.access_token.clone(),
            refresh_token,
            expires: utils::epoch_expiration(access.expires_in)?,
            scopes: access
                .scope
                .split_whitespace()
                .map(|s| s.to_string())
                .collect(),
        })
    }

    fn is_expired(&self) -> Result<bool> {
        Ok(self.expires <= utils::now_seconds()?)
    }
}

fn session_token(req: &tide::Request<Context>) -> Option<TokenBundle> {
    let enc: crypto::Enc = req.session().get(TOKEN_KEY)?;
    let raw = match crypto::decrypt(&enc) {
        Ok(raw) => raw,
        Err(e) => {
            slog::warn!(LOG, "dropping undecryptable session token {}", e);
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(bundle) => Some(bundle),
        Err(e) => {
            slog::warn!(LOG, "dropping unreadable session token {}", e);
            None
        }
    }
}

fn store_session_token(req: &mut tide::Request<Context>, bundle: &TokenBundle) -> Result<()> {
    let raw =
        serde_json::to_string(bundle).map_err(|e| se!("token bundle serialize error {}", e))?;
    let enc = crypto::encrypt(&raw)?;
    req.session_mut()
        .insert(TOKEN_KEY, enc)
        .map_err(|e| se!("session insert error {}", e))?;
    Ok(())
}

/// A usable access token for this session, or `None` when the caller
/// needs to log in. Expired tokens are refreshed in place and the
/// rotated bundle written back to the session.
async fn current_access_token(req: &mut tide::Request<Context>) -> Result<Option<String>> {
    let bundle = match session_token(req) {
        None => return Ok(None),
        Some(bundle) => bundle,
    };
    if !bundle.is_expired()? {
        return Ok(Some(bundle.access_token));
    }
    slog::info!(LOG, "access token expired, refreshing");
    let access = spotify::refresh_access_token(&bundle.refresh_token).await?;
    let bundle = TokenBundle::from_access(&access, Some(bundle.refresh_token))?;
    store_session_token(req, &bundle)?;
    Ok(Some(bundle.access_token))
}

macro_rules! token_or_redirect {
    ($req:expr) => {{
        match current_access_token(&mut $req).await? {
            Some(token) => token,
            None => {
                slog::info!(LOG, "no usable session token, redirecting to login");
                return Ok(
                    tide::Redirect::new(format!("{}/", CONFIG.redirect_host())).into()
                );
            }
        }
    }};
}

async fn current_db_user(pool: &PgPool, token: &str) -> Result<Option<models::User>> {
    let profile = spotify::fetch_profile(token).await?;
    db::lookup_user(pool, &profile.id).await
}

macro_rules! user_or_not_onboarded {
    ($pool:expr, $token:expr) => {{
        match current_db_user(&$pool, &$token).await? {
            Some(user) => user,
            None => {
                slog::info!(LOG, "request from a spotify account with no local user row");
                return Ok(resp!(status => 400, error => "User not found in database"));
            }
        }
    }};
}

/// Drops any existing session token and sends the user to spotify's
/// consent page. With `REQUIRE_LOGIN_STATE` set, a one-time state
/// token rides along and is checked when spotify redirects back.
async fn login(mut req: tide::Request<Context>) -> tide::Result {
    req.session_mut().remove(TOKEN_KEY);
    let url = if CONFIG.require_login_state {
        let state = new_login_state().await;
        spotify::authorize_url(Some(&state))?
    } else {
        spotify::authorize_url(None)?
    };
    slog::info!(LOG, "redirecting to spotify authorize");
    Ok(tide::Redirect::new(url).into())
}

#[derive(Debug, serde::Deserialize)]
struct AuthCallback {
    code: String,
    state: Option<String>,
}

/// Spotify sends users back here with a single-use `code` we exchange
/// for tokens. On success the user row is upserted, the encrypted
/// bundle goes into the session, and the browser moves on to the
/// profile page.
async fn auth_callback(mut req: tide::Request<Context>) -> tide::Result {
    slog::info!(LOG, "got authorize redirect");
    // tide reports a query that doesn't parse as a 400
    let auth: AuthCallback = req.query()?;
    if CONFIG.require_login_state {
        let valid = match &auth.state {
            Some(state) => take_login_state(state).await,
            None => false,
        };
        if !valid {
            slog::warn!(LOG, "rejecting login with a bad state token");
            return Ok(resp!(status => 400, error => "invalid login state"));
        }
    }
    let pool = req.state().pool.clone();
    let access = spotify::new_access_token(&auth.code).await?;
    let profile = spotify::fetch_profile(&access.access_token).await?;
    let user_id = db::upsert_user(&pool, &profile).await?;
    slog::info!(LOG, "completing login for {}", profile.display_name; "user_id" => user_id);
    let bundle = TokenBundle::from_access(&access, None)?;
    store_session_token(&mut req, &bundle)?;
    Ok(tide::Redirect::new(format!("{}/user-profile", CONFIG.redirect_host())).into())
}

async fn user_profile(mut req: tide::Request<Context>) -> tide::Result {
    let token = token_or_redirect!(req);
    let profile = spotify::fetch_profile(&token).await?;
    Ok(resp!(json => profile))
}

async fn user_top_artists(mut req: tide::Request<Context>) -> tide::Result {
    let token = token_or_redirect!(req);
    let pool = req.state().pool.clone();
    let user = user_or_not_onboarded!(pool, token);
    slog::info!(LOG, "storing top artists"; "user_id" => user.id, "display_name" => &user.display_name);
    let artists = spotify::fetch_top_artists(&token, 10).await?;
    db::replace_top_artists(&pool, user.id, &artists).await?;
    Ok(resp!(message => "Top artists stored successfully!"))
}

#[derive(serde::Serialize)]
struct TopTracksResponse {
    top_tracks: Vec<spotify::Track>,
}

async fn user_top_tracks(mut req: tide::Request<Context>) -> tide::Result {
    let token = token_or_redirect!(req);
    let top_tracks = spotify::fetch_top_tracks(&token, 10).await?;
    Ok(resp!(json => TopTracksResponse { top_tracks }))
}

#[derive(serde::Serialize)]
struct RecentlyPlayedResponse {
    recently_played: Vec<spotify::PlayedTrack>,
}

async fn user_recently_played(mut req: tide::Request<Context>) -> tide::Result {
    let token = token_or_redirect!(req);
    let recently_played = spotify::fetch_recently_played(&token, 10).await?;
    Ok(resp!(json => RecentlyPlayedResponse { recently_played }))
}

async fn user_top_genres(mut req: tide::Request<Context>) -> tide::Result {
    let token = token_or_redirect!(req);
    let pool = req.state().pool.clone();
    let user = user_or_not_onboarded!(pool, token);
    let artists = spotify::fetch_top_artists(&token, 20).await?;
    let ranked = spotify::rank_genres(&artists);
    db::replace_top_genres(&pool, user.id, &ranked).await?;
    Ok(resp!(message => "Top genres stored successfully!"))
}

#[derive(serde::Serialize)]
struct GenresShowResponse {
    genres: Vec<models::UserGenre>,
}

async fn user_top_genres_show(mut req: tide::Request<Context>) -> tide::Result {
    let token = token_or_redirect!(req);
    let pool = req.state().pool.clone();
    let user = user_or_not_onboarded!(pool, token);
    let genres = db::user_genres(&pool, user.id).await?;
    Ok(resp!(json => GenresShowResponse { genres }))
}

/// The current recommendation set: search hits for the caller's most
/// frequent genre. `None` means the caller has no genres at all.
async fn recommended_tracks(access_token: &str) -> Result<Option<Vec<spotify::SearchTrack>>> {
    let artists = spotify::fetch_top_artists(access_token, 20).await?;
    let ranked = spotify::rank_genres(&artists);
    let top_genre = match ranked.first() {
        None => return Ok(None),
        Some((genre, _count)) => genre.clone(),
    };
    slog::info!(LOG, "searching tracks for top genre"; "genre" => &top_genre);
    let tracks = spotify::search_tracks(access_token, &top_genre, 10).await?;
    Ok(Some(tracks))
}

#[derive(serde::Serialize)]
struct RecommendResponse {
    recommended_tracks: Vec<spotify::SearchTrack>,
}

async fn recommend_tracks(mut req: tide::Request<Context>) -> tide::Result {
    let token = token_or_redirect!(req);
    match recommended_tracks(&token).await? {
        None => Ok(resp!(status => 400, error => "No genres found")),
        Some(tracks) => Ok(resp!(json => RecommendResponse {
            recommended_tracks: tracks
        })),
    }
}

fn track_uris(tracks: &[spotify::SearchTrack]) -> Vec<String> {
    tracks
        .iter()
        .map(|t| format!("spotify:track:{}", t.id))
        .collect()
}

#[derive(Debug, serde::Deserialize)]
struct CreatePlaylistBody {
    name: Option<String>,
    genre: Option<String>,
}

#[derive(serde::Serialize)]
struct PlaylistCreated<'a> {
    message: &'a str,
    playlist_url: Option<String>,
}

/// Materialize the current recommendation set as a new public playlist
/// on the caller's spotify account.
async fn create_playlist(mut req: tide::Request<Context>) -> tide::Result {
    let token = token_or_redirect!(req);
    let body: CreatePlaylistBody = match req.body_json().await {
        Ok(body) => body,
        Err(e) => {
            slog::error!(LOG, "invalid create playlist body {}", e);
            return Ok(resp!(status => 400, error => "invalid request body"));
        }
    };
    if let Some(genre) = &body.genre {
        // accepted for compatibility, the set is always derived from
        // the caller's current top genre
        slog::info!(LOG, "create playlist body named a genre"; "genre" => genre);
    }
    let name = body
        .name
        .unwrap_or_else(|| "My Smart Playlist".to_string());
    let tracks = match recommended_tracks(&token).await? {
        None => return Ok(resp!(status => 400, error => "No genres found")),
        Some(tracks) => tracks,
    };
    let profile = spotify::fetch_profile(&token).await?;
    let playlist = spotify::create_playlist(&token, &profile.id, &name).await?;
    let uris = track_uris(&tracks);
    if !uris.is_empty() {
        spotify::add_playlist_tracks(&token, &playlist.id, &uris).await?;
    }
    slog::info!(LOG, "created playlist"; "name" => &name, "tracks" => uris.len());
    Ok(resp!(json => PlaylistCreated {
        message: "Playlist created!",
        playlist_url: playlist.url,
    }))
}

async fn debug_token(req: tide::Request<Context>) -> tide::Result {
    match session_token(&req) {
        None => Ok("No token found, please re-authenticate.".into()),
        Some(bundle) => Ok(resp!(json => bundle)),
    }
}

async fn new_login_state() -> String {
    let state = uuid::Uuid::new_v4()
        .simple()
        .encode_lower(&mut uuid::Uuid::encode_buffer())
        .to_string();
    let mut lock = crate::LOGIN_STATES.lock().await;
    lock.cache_set(state.clone(), ());
    state
}

async fn take_login_state(state: &str) -> bool {
    let mut lock = crate::LOGIN_STATES.lock().await;
    lock.cache_remove(&state.to_string()).is_some()
}
