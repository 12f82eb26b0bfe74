#[derive(sqlx::FromRow, Debug, serde::Serialize)]
pub struct User {
    pub id: i64,
    // account id reported by spotify, we're assuming this is unique
    // since it's the id of the spotify account.
    pub spotify_id: String,
    // name reported by spotify at first login
    pub display_name: String,
    pub profile_image: Option<String>,
    pub created: chrono::DateTime<chrono::Utc>,
}

#[derive(sqlx::FromRow, Debug, serde::Serialize)]
pub struct UserGenre {
    pub id: i64,
    pub user_id: i64,
    pub genre_name: String,
    pub created: chrono::DateTime<chrono::Utc>,
}
